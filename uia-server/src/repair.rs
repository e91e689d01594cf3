use serde_json::Value;
use std::sync::Arc;
use tracing::{info, warn};
use uia_core::config::UiaConfig;
use uia_provider::ldap::LdapProvider;
use uia_stage::STAGE_PASSWORD;
use uia_store::{SledStore, UsernameMapper};

/// The LDAP provider config of the first endpoint that carries one.
fn find_ldap_config(config: &UiaConfig) -> Option<&Value> {
    for (_, endpoint_config) in config.uia.configured() {
        let ldap = endpoint_config
            .stages
            .get(STAGE_PASSWORD)
            .and_then(|stage| stage.get("passwordProviders"))
            .and_then(|providers| providers.get("ldap"));
        if ldap.is_some() {
            return ldap;
        }
    }
    None
}

/// Walk every mapper entry and, for entries with a persistent ID, re-derive
/// and rewrite the mapping. With an LDAP provider configured, the source
/// username is refreshed from the directory first, so renames are healed.
pub async fn run(config: &UiaConfig) -> anyhow::Result<()> {
    let kv = SledStore::open(&config.username_mapper.folder)?;
    let mapper = Arc::new(UsernameMapper::new(&config.username_mapper, Arc::new(kv))?);
    let ldap = find_ldap_config(config)
        .map(|raw| LdapProvider::configure(raw, Arc::clone(&mapper)))
        .transpose()?;
    if ldap.is_none() {
        info!("No LDAP provider configured, re-deriving from stored usernames");
    }

    let mut rewritten = 0usize;
    let mut moved = 0usize;
    for (localpart, entry) in mapper.entries()? {
        let Some(pid) = entry.persistent_id.clone() else {
            continue;
        };
        let username = match &ldap {
            Some(provider) => match provider.username_for_pid(&pid).await {
                Ok(Some(name)) if !name.is_empty() => name,
                Ok(_) => entry.username.clone(),
                Err(e) => {
                    warn!(localpart, error = %e, "LDAP lookup failed, keeping stored username");
                    entry.username.clone()
                }
            },
            None => entry.username.clone(),
        };

        let fresh = mapper.username_to_localpart(&username, Some(&pid))?;
        rewritten += 1;
        if fresh != localpart {
            mapper.remove_entry(&localpart)?;
            moved += 1;
            info!(from = %localpart, to = %fresh, "Mapping moved");
        }
    }

    info!(rewritten, moved, "Mapper repair finished");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use uia_store::KvStore;

    fn config_yaml(folder: &str) -> UiaConfig {
        let yaml = format!(
            r#"
usernameMapper:
  mode: HMAC-SHA256
  pepper: salt-and
  folder: {folder}
homeserver:
  domain: example.org
  url: http://localhost:8008
  token:
    secret: love
"#
        );
        serde_yaml::from_str(&yaml).unwrap()
    }

    #[tokio::test]
    async fn repair_moves_stale_entries() {
        let dir = tempfile::tempdir().unwrap();
        let folder = dir.path().to_str().unwrap().to_string();
        let config = config_yaml(&folder);

        // Seed a mapping under a stale localpart key, as if the pepper or
        // pid handling had changed since it was written.
        let expected = {
            let kv = SledStore::open(dir.path()).unwrap();
            let entry = serde_json::json!({
                "username": "fox",
                "persistentId": STANDARD.encode(b"pidfox"),
            });
            kv.put("stale-localpart", entry.to_string().as_bytes()).unwrap();

            let mapper =
                UsernameMapper::new(&config.username_mapper, Arc::new(kv)).unwrap();
            mapper.username_to_localpart("fox", Some(b"pidfox")).unwrap()
        };

        run(&config).await.unwrap();

        let kv = SledStore::open(dir.path()).unwrap();
        assert!(kv.get("stale-localpart").unwrap().is_none());
        assert!(kv.get(&expected).unwrap().is_some());
    }

    #[tokio::test]
    async fn repair_ignores_entries_without_pid() {
        let dir = tempfile::tempdir().unwrap();
        let folder = dir.path().to_str().unwrap().to_string();
        let config = config_yaml(&folder);
        {
            let kv = SledStore::open(dir.path()).unwrap();
            kv.put("plain", br#"{"username":"fox"}"#).unwrap();
        }
        run(&config).await.unwrap();
        let kv = SledStore::open(dir.path()).unwrap();
        assert!(kv.get("plain").unwrap().is_some());
    }

    #[test]
    fn ldap_config_is_found_in_password_stage() {
        let yaml = r#"
usernameMapper:
  mode: PLAIN
  folder: /tmp/x
homeserver:
  domain: example.org
  url: http://localhost:8008
  token:
    secret: love
uia:
  login:
    stages:
      m.login.password:
        passwordProviders:
          ldap:
            url: ldap://localhost
    flows:
      - stages: ["m.login.password"]
"#;
        let config: UiaConfig = serde_yaml::from_str(yaml).unwrap();
        assert!(find_ldap_config(&config).is_some());
    }
}
