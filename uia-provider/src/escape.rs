//! LDAP filter and DN escaping.
//!
//! `ldap_escape` is deliberately an allowlist, not an RFC-complete encoder:
//! the filter template supplies the quoting context, so anything outside the
//! safe set is dropped. `ldap_escape_binary` produces an RFC 4515 §3 filter
//! byte string for binary attribute values such as directory GUIDs.

/// Strip a filter substitution value down to `[a-z0-9-._=/]`.
pub fn ldap_escape(input: &str) -> String {
    input
        .chars()
        .filter(|c| {
            c.is_ascii_lowercase()
                || c.is_ascii_digit()
                || matches!(c, '-' | '.' | '_' | '=' | '/')
        })
        .collect()
}

const RFC4515_SPECIALS: &[u8] = b"#,+\"\\<>;=";

/// RFC 4515 §3 escape for raw bytes inside a filter.
///
/// Specials and non-printable / non-ASCII bytes become `\HH`; a leading or
/// trailing space becomes `\20`.
pub fn ldap_escape_binary(input: &[u8]) -> String {
    let mut out = String::with_capacity(input.len() * 3);
    let last = input.len().saturating_sub(1);
    for (i, &byte) in input.iter().enumerate() {
        let boundary_space = byte == b' ' && (i == 0 || i == last);
        if RFC4515_SPECIALS.contains(&byte) || byte < 0x20 || byte >= 0x80 || boundary_space {
            out.push_str(&format!("\\{byte:02X}"));
        } else {
            out.push(byte as char);
        }
    }
    out
}

/// Convert RFC 2253 hex escapes in a DN back to their literal characters so
/// the DN can be used as a search base.
pub fn dn_decode(dn: &str) -> String {
    let mut out = String::with_capacity(dn.len());
    let mut chars = dn.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        let mut lookahead = chars.clone();
        let hex: String = lookahead.by_ref().take(2).collect();
        match u8::from_str_radix(&hex, 16) {
            Ok(byte) if RFC4515_SPECIALS.contains(&byte) => {
                out.push(byte as char);
                chars = lookahead;
            }
            _ => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Inverse of `ldap_escape_binary`: reads an RFC 4515 filter byte
    /// string back into raw bytes.
    fn parse_rfc4515(input: &str) -> Option<Vec<u8>> {
        let mut out = Vec::new();
        let bytes = input.as_bytes();
        let mut i = 0;
        while i < bytes.len() {
            if bytes[i] == b'\\' {
                let hex = input.get(i + 1..i + 3)?;
                out.push(u8::from_str_radix(hex, 16).ok()?);
                i += 3;
            } else {
                out.push(bytes[i]);
                i += 1;
            }
        }
        Some(out)
    }

    // ── ldap_escape ──────────────────────────────────────────────

    #[test]
    fn escape_keeps_safe_set() {
        assert_eq!(ldap_escape("alice-01._=/"), "alice-01._=/");
    }

    #[test]
    fn escape_drops_everything_else() {
        assert_eq!(ldap_escape("al)(ice*\\00"), "alice00");
        assert_eq!(ldap_escape("ALICE"), "");
        assert_eq!(ldap_escape("päivä"), "piv");
    }

    #[test]
    fn escape_empty_is_empty() {
        assert_eq!(ldap_escape(""), "");
    }

    // ── ldap_escape_binary ───────────────────────────────────────

    #[test]
    fn binary_escape_passes_plain_ascii() {
        assert_eq!(ldap_escape_binary(b"alice01"), "alice01");
    }

    #[test]
    fn binary_escape_hex_encodes_specials() {
        assert_eq!(ldap_escape_binary(b"a#b"), "a\\23b");
        assert_eq!(ldap_escape_binary(b"a,b"), "a\\2Cb");
        assert_eq!(ldap_escape_binary(b"a\\b"), "a\\5Cb");
        assert_eq!(ldap_escape_binary(b"a=b"), "a\\3Db");
    }

    #[test]
    fn binary_escape_hex_encodes_control_and_high_bytes() {
        assert_eq!(ldap_escape_binary(&[0x01]), "\\01");
        assert_eq!(ldap_escape_binary(&[0xFF]), "\\FF");
        assert_eq!(ldap_escape_binary(&[0x7F]), "\u{7f}".to_string());
        assert_eq!(ldap_escape_binary(&[0x80]), "\\80");
    }

    #[test]
    fn binary_escape_boundary_spaces() {
        assert_eq!(ldap_escape_binary(b" a "), "\\20a\\20");
        assert_eq!(ldap_escape_binary(b"a b"), "a b");
    }

    #[test]
    fn binary_escape_round_trips_through_parser() {
        let inputs: &[&[u8]] = &[
            b"plain",
            b" lead and trail ",
            b"mix#of,all+the\"things\\<>;=",
            &[0x00, 0x1F, 0x20, 0x7E, 0x7F, 0x80, 0xFE, 0xFF],
            b"",
        ];
        for input in inputs {
            let escaped = ldap_escape_binary(input);
            assert_eq!(parse_rfc4515(&escaped).as_deref(), Some(*input), "input {input:?}");
        }
    }

    // ── dn_decode ────────────────────────────────────────────────

    #[test]
    fn dn_decode_restores_hex_escaped_specials() {
        assert_eq!(dn_decode("cn=a\\2Cb,dc=example"), "cn=a,b,dc=example");
        assert_eq!(dn_decode("cn=a\\23b"), "cn=a#b");
        assert_eq!(dn_decode("cn=a\\3Db"), "cn=a=b");
        assert_eq!(dn_decode("cn=a\\5Cb"), "cn=a\\b");
    }

    #[test]
    fn dn_decode_leaves_other_escapes_alone() {
        assert_eq!(dn_decode("cn=a\\41b"), "cn=a\\41b");
        assert_eq!(dn_decode("cn=plain"), "cn=plain");
    }

    #[test]
    fn dn_decode_trailing_backslash_is_kept() {
        assert_eq!(dn_decode("cn=a\\"), "cn=a\\");
    }
}
