use crate::kv::KvStore;
use data_encoding::BASE32_NOPAD;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::sync::Arc;
use tracing::warn;
use uia_core::UiaError;
use uia_core::config::{MapperMode, UsernameMapperConfig};

type HmacSha256 = Hmac<Sha256>;

/// Reverse-index record stored under a localpart key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MapperEntry {
    pub username: String,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "optional_base64"
    )]
    pub persistent_id: Option<Vec<u8>>,
}

/// Derives stable pseudonymous localparts and maintains the
/// localpart → source-username reverse index.
pub struct UsernameMapper {
    mode: MapperMode,
    pepper: Vec<u8>,
    binary_pid: bool,
    kv: Arc<dyn KvStore>,
}

impl UsernameMapper {
    pub fn new(config: &UsernameMapperConfig, kv: Arc<dyn KvStore>) -> anyhow::Result<Self> {
        let pepper = match config.mode {
            MapperMode::Plain => Vec::new(),
            MapperMode::HmacSha256 => config
                .pepper
                .as_ref()
                .ok_or_else(|| anyhow::anyhow!("usernameMapper: HMAC-SHA256 requires a pepper"))?
                .clone()
                .into_bytes(),
        };
        Ok(Self {
            mode: config.mode,
            pepper,
            binary_pid: config.binary_pid,
            kv,
        })
    }

    /// Whether persistent IDs are hashed (and filtered) as raw bytes.
    pub fn binary_pid(&self) -> bool {
        self.binary_pid
    }

    /// Derive the Matrix localpart for a source username and optional
    /// persistent ID. In HMAC-SHA256 mode the reverse entry is durably
    /// written before the localpart is returned.
    pub fn username_to_localpart(
        &self,
        username: &str,
        persistent_id: Option<&[u8]>,
    ) -> Result<String, UiaError> {
        match self.mode {
            MapperMode::Plain => Ok(username.to_string()),
            MapperMode::HmacSha256 => {
                let localpart = self.derive_localpart(username, persistent_id);
                let entry = MapperEntry {
                    username: username.to_string(),
                    persistent_id: persistent_id.map(<[u8]>::to_vec),
                };
                self.kv.put(&localpart, &serde_json::to_vec(&entry)?)?;
                Ok(localpart)
            }
        }
    }

    fn derive_localpart(&self, username: &str, persistent_id: Option<&[u8]>) -> String {
        let mut mac =
            HmacSha256::new_from_slice(&self.pepper).expect("HMAC accepts any key length");
        match persistent_id {
            Some(pid) if self.binary_pid => mac.update(pid),
            // Decode lossily so byte and string supply hash identically
            Some(pid) => mac.update(String::from_utf8_lossy(pid).as_bytes()),
            None => mac.update(username.as_bytes()),
        }
        let digest = mac.finalize().into_bytes();
        BASE32_NOPAD.encode(&digest).to_lowercase()
    }

    /// The stored record for a localpart, or None if absent or not
    /// parseable. Store errors other than "not found" propagate.
    pub fn localpart_to_username(&self, localpart: &str) -> Result<Option<MapperEntry>, UiaError> {
        match self.mode {
            MapperMode::Plain => Ok(Some(MapperEntry {
                username: localpart.to_string(),
                persistent_id: None,
            })),
            MapperMode::HmacSha256 => {
                let Some(raw) = self.kv.get(localpart)? else {
                    return Ok(None);
                };
                match serde_json::from_slice::<MapperEntry>(&raw) {
                    Ok(entry) => Ok(Some(entry)),
                    Err(e) => {
                        warn!(localpart, error = %e, "Unparseable mapper entry");
                        Ok(None)
                    }
                }
            }
        }
    }

    /// Drop a reverse-index entry, e.g. after a repair pass moved it.
    pub fn remove_entry(&self, localpart: &str) -> Result<(), UiaError> {
        self.kv.remove(localpart)
    }

    /// All reverse-index entries, for the repair pass.
    pub fn entries(&self) -> Result<Vec<(String, MapperEntry)>, UiaError> {
        let mut out = Vec::new();
        for (localpart, raw) in self.kv.scan()? {
            match serde_json::from_slice::<MapperEntry>(&raw) {
                Ok(entry) => out.push((localpart, entry)),
                Err(e) => warn!(localpart, error = %e, "Skipping unparseable mapper entry"),
            }
        }
        Ok(out)
    }
}

mod optional_base64 {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        value: &Option<Vec<u8>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(bytes) => serializer.serialize_str(&STANDARD.encode(bytes)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Vec<u8>>, D::Error> {
        let value: Option<String> = Option::deserialize(deserializer)?;
        value
            .map(|s| STANDARD.decode(s).map_err(serde::de::Error::custom))
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::SledStore;

    fn hmac_mapper(binary_pid: bool) -> UsernameMapper {
        let config = UsernameMapperConfig {
            mode: MapperMode::HmacSha256,
            pepper: Some("salt-and".to_string()),
            folder: "/unused".into(),
            binary_pid,
        };
        UsernameMapper::new(&config, Arc::new(SledStore::temporary().unwrap())).unwrap()
    }

    fn plain_mapper() -> UsernameMapper {
        let config = UsernameMapperConfig {
            mode: MapperMode::Plain,
            pepper: None,
            folder: "/unused".into(),
            binary_pid: false,
        };
        UsernameMapper::new(&config, Arc::new(SledStore::temporary().unwrap())).unwrap()
    }

    // ── PLAIN mode ───────────────────────────────────────────────

    #[test]
    fn plain_mode_is_identity() {
        let mapper = plain_mapper();
        assert_eq!(mapper.username_to_localpart("alice", None).unwrap(), "alice");
        let entry = mapper.localpart_to_username("alice").unwrap().unwrap();
        assert_eq!(entry.username, "alice");
        assert_eq!(entry.persistent_id, None);
    }

    // ── HMAC-SHA256 mode ─────────────────────────────────────────

    #[test]
    fn hmac_localpart_is_lowercase_base32() {
        let mapper = hmac_mapper(false);
        let localpart = mapper.username_to_localpart("fox", Some(b"pidfox")).unwrap();
        assert!(!localpart.is_empty());
        assert!(
            localpart
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit())
        );
        // HMAC-SHA256 digest is 32 bytes → 52 base32 characters unpadded
        assert_eq!(localpart.len(), 52);
    }

    #[test]
    fn hmac_mapping_is_deterministic() {
        let mapper = hmac_mapper(false);
        let a = mapper.username_to_localpart("fox", Some(b"pidfox")).unwrap();
        let b = mapper.username_to_localpart("fox", Some(b"pidfox")).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn hmac_reverse_entry_round_trips_pid() {
        let mapper = hmac_mapper(false);
        let localpart = mapper.username_to_localpart("fox", Some(b"pidfox")).unwrap();
        let entry = mapper.localpart_to_username(&localpart).unwrap().unwrap();
        assert_eq!(entry.username, "fox");
        assert_eq!(entry.persistent_id.as_deref(), Some(&b"pidfox"[..]));
    }

    #[test]
    fn hmac_without_pid_hashes_username() {
        let mapper = hmac_mapper(false);
        let with_pid = mapper.username_to_localpart("fox", Some(b"pidfox")).unwrap();
        let without_pid = mapper.username_to_localpart("fox", None).unwrap();
        assert_ne!(with_pid, without_pid);
    }

    #[test]
    fn lossy_decode_makes_byte_and_string_supply_equal() {
        // With binary_pid = false the pid goes through lossy UTF-8, so
        // invalid bytes collapse to the replacement character either way.
        let mapper = hmac_mapper(false);
        let invalid = [0x66u8, 0xFF, 0x6F];
        let lossy = String::from_utf8_lossy(&invalid).into_owned();
        let from_bytes = mapper.username_to_localpart("u", Some(&invalid)).unwrap();
        let from_string = mapper.username_to_localpart("u", Some(lossy.as_bytes())).unwrap();
        assert_eq!(from_bytes, from_string);
    }

    #[test]
    fn binary_pid_hashes_raw_bytes() {
        let raw = hmac_mapper(true);
        let lossy = hmac_mapper(false);
        let invalid = [0x66u8, 0xFF, 0x6F];
        assert_ne!(
            raw.username_to_localpart("u", Some(&invalid)).unwrap(),
            lossy.username_to_localpart("u", Some(&invalid)).unwrap()
        );
    }

    #[test]
    fn rename_overwrites_reverse_entry() {
        let mapper = hmac_mapper(false);
        let localpart = mapper.username_to_localpart("fox", Some(b"pidfox")).unwrap();
        let renamed = mapper.username_to_localpart("newfox", Some(b"pidfox")).unwrap();
        assert_eq!(localpart, renamed);
        let entry = mapper.localpart_to_username(&localpart).unwrap().unwrap();
        assert_eq!(entry.username, "newfox");
    }

    #[test]
    fn unknown_localpart_returns_none() {
        let mapper = hmac_mapper(false);
        assert!(mapper.localpart_to_username("nosuch").unwrap().is_none());
    }

    #[test]
    fn unparseable_entry_returns_none() {
        let kv = Arc::new(SledStore::temporary().unwrap());
        kv.put("broken", b"not json").unwrap();
        let config = UsernameMapperConfig {
            mode: MapperMode::HmacSha256,
            pepper: Some("p".to_string()),
            folder: "/unused".into(),
            binary_pid: false,
        };
        let mapper = UsernameMapper::new(&config, kv).unwrap();
        assert!(mapper.localpart_to_username("broken").unwrap().is_none());
    }

    #[test]
    fn entries_lists_written_mappings() {
        let mapper = hmac_mapper(false);
        mapper.username_to_localpart("fox", Some(b"pidfox")).unwrap();
        mapper.username_to_localpart("owl", Some(b"pidowl")).unwrap();
        let entries = mapper.entries().unwrap();
        assert_eq!(entries.len(), 2);
        assert!(entries.iter().any(|(_, e)| e.username == "fox"));
    }

    #[test]
    fn different_peppers_produce_different_localparts() {
        let mapper_a = hmac_mapper(false);
        let config_b = UsernameMapperConfig {
            mode: MapperMode::HmacSha256,
            pepper: Some("other".to_string()),
            folder: "/unused".into(),
            binary_pid: false,
        };
        let mapper_b =
            UsernameMapper::new(&config_b, Arc::new(SledStore::temporary().unwrap())).unwrap();
        assert_ne!(
            mapper_a.username_to_localpart("fox", None).unwrap(),
            mapper_b.username_to_localpart("fox", None).unwrap()
        );
    }
}
