use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use jsonwebtoken::{Algorithm, EncodingKey, Header, encode};
use serde::Serialize;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use uia_core::UiaError;
use uia_core::config::{TokenAlgorithm, TokenConfig};

/// Issuer claim the homeserver's token authenticator expects.
pub const TOKEN_ISSUER: &str = "Famedly Login Service";

#[derive(Debug, Serialize)]
struct TokenClaims<'a> {
    iss: &'static str,
    sub: &'a str,
    exp: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    admin: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    displayname: Option<&'a str>,
}

/// Signs the short-lived tokens the homeserver accepts for
/// `com.famedly.login.token` logins.
pub struct TokenMinter {
    signer: Signer,
    expires: Duration,
}

enum Signer {
    Key { header: Header, key: EncodingKey },
    /// `alg: none` — unsigned tokens for test deployments.
    Unsigned,
}

impl TokenMinter {
    pub fn new(config: &TokenConfig) -> anyhow::Result<Self> {
        let signer = match config.algorithm {
            TokenAlgorithm::None => Signer::Unsigned,
            algorithm => {
                let algorithm = jwt_algorithm(algorithm)?;
                let key = match algorithm {
                    Algorithm::HS256 | Algorithm::HS384 | Algorithm::HS512 => {
                        EncodingKey::from_secret(config.secret.as_bytes())
                    }
                    Algorithm::RS256
                    | Algorithm::RS384
                    | Algorithm::RS512
                    | Algorithm::PS256
                    | Algorithm::PS384
                    | Algorithm::PS512 => EncodingKey::from_rsa_pem(config.secret.as_bytes())
                        .map_err(|e| anyhow::anyhow!("homeserver.token: invalid RSA key: {e}"))?,
                    Algorithm::ES256 | Algorithm::ES384 => {
                        EncodingKey::from_ec_pem(config.secret.as_bytes())
                            .map_err(|e| anyhow::anyhow!("homeserver.token: invalid EC key: {e}"))?
                    }
                    Algorithm::EdDSA => {
                        anyhow::bail!("homeserver.token: unsupported algorithm")
                    }
                };
                Signer::Key { header: Header::new(algorithm), key }
            }
        };
        Ok(Self {
            signer,
            expires: Duration::from_millis(config.expires),
        })
    }

    pub fn mint(
        &self,
        username: &str,
        admin: Option<bool>,
        displayname: Option<&str>,
    ) -> Result<String, UiaError> {
        let exp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_err(|e| UiaError::Unknown(e.to_string()))?
            .as_secs()
            + self.expires.as_secs();
        let claims = TokenClaims {
            iss: TOKEN_ISSUER,
            sub: username,
            exp,
            admin,
            displayname,
        };
        match &self.signer {
            Signer::Key { header, key } => encode(header, &claims, key)
                .map_err(|e| UiaError::Unknown(format!("token signing failed: {e}"))),
            Signer::Unsigned => {
                let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"none","typ":"JWT"}"#);
                let payload = URL_SAFE_NO_PAD.encode(
                    serde_json::to_vec(&claims).map_err(|e| UiaError::Unknown(e.to_string()))?,
                );
                Ok(format!("{header}.{payload}."))
            }
        }
    }
}

fn jwt_algorithm(algorithm: TokenAlgorithm) -> anyhow::Result<Algorithm> {
    Ok(match algorithm {
        TokenAlgorithm::HS256 => Algorithm::HS256,
        TokenAlgorithm::HS384 => Algorithm::HS384,
        TokenAlgorithm::HS512 => Algorithm::HS512,
        TokenAlgorithm::RS256 => Algorithm::RS256,
        TokenAlgorithm::RS384 => Algorithm::RS384,
        TokenAlgorithm::RS512 => Algorithm::RS512,
        TokenAlgorithm::ES256 => Algorithm::ES256,
        TokenAlgorithm::ES384 => Algorithm::ES384,
        TokenAlgorithm::ES512 => {
            anyhow::bail!("homeserver.token: ES512 is not supported by the signing backend")
        }
        TokenAlgorithm::PS256 => Algorithm::PS256,
        TokenAlgorithm::PS384 => Algorithm::PS384,
        TokenAlgorithm::PS512 => Algorithm::PS512,
        TokenAlgorithm::None => unreachable!("handled by the caller"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{DecodingKey, Validation, decode};

    fn config(algorithm: TokenAlgorithm, secret: &str) -> TokenConfig {
        TokenConfig {
            secret: secret.to_string(),
            algorithm,
            expires: 120_000,
        }
    }

    #[derive(Debug, serde::Deserialize)]
    struct DecodedClaims {
        iss: String,
        sub: String,
        exp: u64,
        #[serde(default)]
        admin: Option<bool>,
        #[serde(default)]
        displayname: Option<String>,
    }

    #[test]
    fn hs512_token_round_trips() {
        let minter = TokenMinter::new(&config(TokenAlgorithm::HS512, "love")).unwrap();
        let token = minter.mint("alice", Some(true), Some("Alice")).unwrap();
        let decoded = decode::<DecodedClaims>(
            &token,
            &DecodingKey::from_secret(b"love"),
            &Validation::new(Algorithm::HS512),
        )
        .unwrap();
        assert_eq!(decoded.claims.iss, TOKEN_ISSUER);
        assert_eq!(decoded.claims.sub, "alice");
        assert_eq!(decoded.claims.admin, Some(true));
        assert_eq!(decoded.claims.displayname.as_deref(), Some("Alice"));
    }

    #[test]
    fn optional_claims_are_omitted() {
        let minter = TokenMinter::new(&config(TokenAlgorithm::HS256, "love")).unwrap();
        let token = minter.mint("alice", None, None).unwrap();
        let payload = token.split('.').nth(1).unwrap();
        let raw = URL_SAFE_NO_PAD.decode(payload).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&raw).unwrap();
        assert!(value.get("admin").is_none());
        assert!(value.get("displayname").is_none());
    }

    #[test]
    fn expiry_is_seconds_from_now() {
        let minter = TokenMinter::new(&config(TokenAlgorithm::HS256, "love")).unwrap();
        let token = minter.mint("alice", None, None).unwrap();
        let payload = token.split('.').nth(1).unwrap();
        let raw = URL_SAFE_NO_PAD.decode(payload).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&raw).unwrap();
        let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs();
        let exp = value["exp"].as_u64().unwrap();
        assert!(exp >= now + 115 && exp <= now + 125, "exp {exp} vs now {now}");
    }

    #[test]
    fn none_algorithm_emits_unsigned_token() {
        let minter = TokenMinter::new(&config(TokenAlgorithm::None, "")).unwrap();
        let token = minter.mint("alice", None, None).unwrap();
        assert!(token.ends_with('.'));
        let header = token.split('.').next().unwrap();
        let raw = URL_SAFE_NO_PAD.decode(header).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&raw).unwrap();
        assert_eq!(value["alg"], "none");
    }

    #[test]
    fn rsa_algorithm_with_garbage_key_fails_init() {
        assert!(TokenMinter::new(&config(TokenAlgorithm::RS256, "not a pem")).is_err());
    }

    #[test]
    fn es512_fails_init() {
        assert!(TokenMinter::new(&config(TokenAlgorithm::ES512, "whatever")).is_err());
    }
}
