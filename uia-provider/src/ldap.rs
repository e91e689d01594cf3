use crate::escape::{dn_decode, ldap_escape, ldap_escape_binary};
use crate::{PasswordProvider, ProviderCheck};
use async_trait::async_trait;
use ldap3::exop::PasswordModify;
use ldap3::{Ldap, LdapConnAsync, LdapConnSettings, Scope, SearchEntry};
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uia_store::UsernameMapper;

/// LDAP bind-search-bind provider.
///
/// A service-bound client locates the user (directly, or through the
/// username mapper's reverse index), then a second client binds as the
/// discovered DN with the user-supplied password and re-fetches the user's
/// attributes. Both clients are unbound on every exit path.
pub struct LdapProvider {
    config: LdapConfig,
    mapper: Arc<UsernameMapper>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LdapConfig {
    url: String,
    base: String,
    bind_dn: String,
    bind_password: String,

    /// Search base for user lookups; falls back to `base`.
    #[serde(default)]
    user_base: Option<String>,

    /// Filter template with a `%s` placeholder for the escaped username.
    #[serde(default)]
    user_filter: Option<String>,

    /// Filter template with a `%s` placeholder for the escaped persistent ID.
    #[serde(default)]
    pid_filter: Option<String>,

    #[serde(default)]
    attributes: LdapAttributes,

    /// Skip TLS certificate verification.
    #[serde(default)]
    allow_unauthorized: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LdapAttributes {
    #[serde(default = "default_uid_attribute")]
    uid: String,

    #[serde(default)]
    persistent_id: Option<String>,

    #[serde(default)]
    enabled: Option<String>,

    #[serde(default)]
    displayname: Option<String>,

    #[serde(default)]
    admin: Option<String>,
}

impl Default for LdapAttributes {
    fn default() -> Self {
        Self {
            uid: default_uid_attribute(),
            persistent_id: None,
            enabled: None,
            displayname: None,
            admin: None,
        }
    }
}

fn default_uid_attribute() -> String {
    "uid".to_string()
}

/// Attributes re-fetched from the user's own entry after the second bind.
#[derive(Debug, PartialEq)]
struct UserRecord {
    username: String,
    persistent_id: Option<Vec<u8>>,
    displayname: Option<String>,
    admin: Option<bool>,
}

impl LdapProvider {
    pub fn configure(config: &serde_json::Value, mapper: Arc<UsernameMapper>) -> anyhow::Result<Self> {
        let cfg: LdapConfig = serde_json::from_value(config.clone())
            .map_err(|e| anyhow::anyhow!("ldap provider config error: {e}"))?;
        Ok(Self { config: cfg, mapper })
    }

    async fn connect(&self) -> anyhow::Result<Ldap> {
        let mut settings = LdapConnSettings::new();
        if self.config.allow_unauthorized {
            settings = settings.set_no_tls_verify(true);
        }
        let (conn, ldap) = LdapConnAsync::with_settings(settings, &self.config.url).await?;
        // Keep the connection driven so asynchronous socket errors are
        // observed here instead of aborting the process.
        tokio::spawn(async move {
            if let Err(e) = conn.drive().await {
                warn!(error = %e, "LDAP connection error");
            }
        });
        Ok(ldap)
    }

    fn search_attrs(&self) -> Vec<String> {
        let attrs = &self.config.attributes;
        let mut out = vec![attrs.uid.clone()];
        for optional in [
            &attrs.persistent_id,
            &attrs.enabled,
            &attrs.displayname,
            &attrs.admin,
        ] {
            if let Some(name) = optional {
                out.push(name.clone());
            }
        }
        out
    }

    fn user_search_base(&self) -> &str {
        self.config.user_base.as_deref().unwrap_or(&self.config.base)
    }

    fn primary_filter(&self, username: &str) -> String {
        let escaped = ldap_escape(username);
        match &self.config.user_filter {
            Some(template) => template.replace("%s", &escaped),
            None => format!("({}={})", self.config.attributes.uid, escaped),
        }
    }

    fn pid_filter(&self, pid: &[u8]) -> Option<String> {
        let template = self.config.pid_filter.as_ref()?;
        let escaped = if self.mapper.binary_pid() {
            ldap_escape_binary(pid)
        } else {
            ldap_escape(&String::from_utf8_lossy(pid))
        };
        Some(template.replace("%s", &escaped))
    }

    /// Locate the user with the service-bound client. Returns None unless
    /// the lookup yields exactly one entry.
    async fn locate_user(
        &self,
        service: &mut Ldap,
        username: &str,
    ) -> anyhow::Result<Option<SearchEntry>> {
        let attrs = self.search_attrs();
        let base = self.user_search_base();

        let filter = self.primary_filter(username);
        let (mut entries, _) = service
            .search(base, Scope::Subtree, &filter, attrs.clone())
            .await?
            .success()?;

        if entries.is_empty() {
            // Treat the requested name as a Matrix localpart and chase the
            // reverse index.
            if let Some(mapped) = self.mapper.localpart_to_username(username)? {
                if let Some(filter) = mapped
                    .persistent_id
                    .as_deref()
                    .and_then(|pid| self.pid_filter(pid))
                {
                    debug!(username, "LDAP fallback via persistent ID");
                    entries = service
                        .search(base, Scope::Subtree, &filter, attrs.clone())
                        .await?
                        .success()?
                        .0;
                }
                if entries.is_empty() {
                    debug!(username, mapped = %mapped.username, "LDAP fallback via mapped username");
                    let filter = self.primary_filter(&mapped.username);
                    entries = service
                        .search(base, Scope::Subtree, &filter, attrs)
                        .await?
                        .success()?
                        .0;
                }
            }
        }

        match entries.len() {
            1 => Ok(Some(SearchEntry::construct(entries.remove(0)))),
            hits => {
                info!(username, hits, "LDAP lookup did not yield exactly one entry");
                Ok(None)
            }
        }
    }

    /// Bind as the user and re-fetch their attributes from their own entry.
    async fn bind_and_fetch(
        &self,
        user: &mut Ldap,
        dn: &str,
        password: &str,
    ) -> anyhow::Result<UserRecord> {
        user.simple_bind(dn, password).await?.success()?;
        let (entries, _) = user
            .search(dn, Scope::Base, "(objectClass=*)", self.search_attrs())
            .await?
            .success()?;
        let entry = entries
            .into_iter()
            .next()
            .ok_or_else(|| anyhow::anyhow!("self-search at {dn} returned no entry"))?;
        Ok(extract_record(
            &SearchEntry::construct(entry),
            &self.config.attributes,
        ))
    }

    async fn try_check(&self, username: &str, password: &str) -> anyhow::Result<ProviderCheck> {
        let mut service = self.connect().await?;
        let located = async {
            service
                .simple_bind(&self.config.bind_dn, &self.config.bind_password)
                .await?
                .success()?;
            self.locate_user(&mut service, username).await
        }
        .await;
        let _ = service.unbind().await;

        let Some(entry) = located? else {
            return Ok(ProviderCheck::failure());
        };

        if let Some(enabled_attr) = &self.config.attributes.enabled {
            let enabled = entry.attrs.get(enabled_attr).and_then(|v| v.first());
            if enabled.map(String::as_str) == Some("FALSE") {
                info!(username, "User deactivated");
                return Ok(ProviderCheck::failure());
            }
        }

        let dn = dn_decode(&entry.dn);
        let mut user = self.connect().await?;
        let fetched = self.bind_and_fetch(&mut user, &dn, password).await;
        let _ = user.unbind().await;

        let record = match fetched {
            Ok(record) => record,
            Err(e) => {
                debug!(username, error = %e, "LDAP user bind failed");
                return Ok(ProviderCheck::failure());
            }
        };
        if record.username.is_empty() {
            warn!(username, dn = %dn, "LDAP entry is missing the uid attribute");
            return Ok(ProviderCheck::failure());
        }

        let canonical = match record.persistent_id.as_deref() {
            Some(pid) => Some(self.mapper.username_to_localpart(&record.username, Some(pid))?),
            None => None,
        };
        Ok(ProviderCheck {
            success: true,
            username: canonical,
            displayname: record.displayname,
            admin: record.admin,
        })
    }

    /// Current directory username for a persistent ID, via the service
    /// bind. Used by the mapper repair pass.
    pub async fn username_for_pid(&self, pid: &[u8]) -> anyhow::Result<Option<String>> {
        let Some(filter) = self.pid_filter(pid) else {
            return Ok(None);
        };
        let mut service = self.connect().await?;
        let found = async {
            service
                .simple_bind(&self.config.bind_dn, &self.config.bind_password)
                .await?
                .success()?;
            let (entries, _) = service
                .search(self.user_search_base(), Scope::Subtree, &filter, self.search_attrs())
                .await?
                .success()?;
            Ok::<_, anyhow::Error>(entries.into_iter().next().map(|entry| {
                extract_record(&SearchEntry::construct(entry), &self.config.attributes).username
            }))
        }
        .await;
        let _ = service.unbind().await;
        found
    }

    async fn try_change(&self, username: &str, old: &str, new: &str) -> anyhow::Result<bool> {
        let mut service = self.connect().await?;
        let located = async {
            service
                .simple_bind(&self.config.bind_dn, &self.config.bind_password)
                .await?
                .success()?;
            self.locate_user(&mut service, username).await
        }
        .await;
        let _ = service.unbind().await;

        let Some(entry) = located? else {
            return Ok(false);
        };
        let dn = dn_decode(&entry.dn);

        let mut user = self.connect().await?;
        let changed = async {
            user.simple_bind(&dn, old).await?.success()?;
            user.extended(PasswordModify {
                user_id: Some(&dn),
                old_pass: Some(old),
                new_pass: Some(new),
            })
            .await?
            .success()?;
            Ok::<_, anyhow::Error>(())
        }
        .await;
        let _ = user.unbind().await;

        match changed {
            Ok(()) => Ok(true),
            Err(e) => {
                debug!(username, error = %e, "LDAP password change failed");
                Ok(false)
            }
        }
    }
}

#[async_trait]
impl PasswordProvider for LdapProvider {
    fn id(&self) -> &'static str {
        "ldap"
    }

    async fn check_user(&self, username: &str, password: &str) -> ProviderCheck {
        match self.try_check(username, password).await {
            Ok(check) => check,
            Err(e) => {
                warn!(username, error = %e, "LDAP check failed");
                ProviderCheck::failure()
            }
        }
    }

    fn supports_change_password(&self) -> bool {
        true
    }

    async fn change_password(&self, username: &str, old: &str, new: &str) -> bool {
        match self.try_change(username, old, new).await {
            Ok(changed) => changed,
            Err(e) => {
                warn!(username, error = %e, "LDAP password change errored");
                false
            }
        }
    }
}

fn extract_record(entry: &SearchEntry, attrs: &LdapAttributes) -> UserRecord {
    let first = |name: &str| entry.attrs.get(name).and_then(|values| values.first());

    let username = first(&attrs.uid).cloned().unwrap_or_default();
    let persistent_id = attrs.persistent_id.as_ref().and_then(|name| {
        entry
            .bin_attrs
            .get(name)
            .and_then(|values| values.first())
            .cloned()
            .or_else(|| first(name).map(|s| s.clone().into_bytes()))
    });
    let displayname = attrs.displayname.as_ref().and_then(|name| first(name)).cloned();
    let admin = attrs
        .admin
        .as_ref()
        .and_then(|name| first(name))
        .and_then(|value| match value.as_str() {
            "TRUE" => Some(true),
            "FALSE" => Some(false),
            _ => None,
        });

    UserRecord { username, persistent_id, displayname, admin }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use uia_core::config::{MapperMode, UsernameMapperConfig};
    use uia_store::SledStore;

    fn provider(config: serde_json::Value, binary_pid: bool) -> LdapProvider {
        let mapper_config = UsernameMapperConfig {
            mode: MapperMode::HmacSha256,
            pepper: Some("salt-and".to_string()),
            folder: "/unused".into(),
            binary_pid,
        };
        let mapper = Arc::new(
            UsernameMapper::new(&mapper_config, Arc::new(SledStore::temporary().unwrap())).unwrap(),
        );
        LdapProvider::configure(&config, mapper).unwrap()
    }

    fn base_config() -> serde_json::Value {
        serde_json::json!({
            "url": "ldap://localhost",
            "base": "dc=example,dc=org",
            "bindDn": "cn=service,dc=example,dc=org",
            "bindPassword": "svc",
        })
    }

    fn entry(
        dn: &str,
        attrs: &[(&str, &str)],
        bin_attrs: &[(&str, &[u8])],
    ) -> SearchEntry {
        SearchEntry {
            dn: dn.to_string(),
            attrs: attrs
                .iter()
                .map(|(k, v)| (k.to_string(), vec![v.to_string()]))
                .collect(),
            bin_attrs: bin_attrs
                .iter()
                .map(|(k, v)| (k.to_string(), vec![v.to_vec()]))
                .collect(),
        }
    }

    // ── Filter construction ──────────────────────────────────────

    #[test]
    fn default_filter_uses_uid_attribute() {
        let provider = provider(base_config(), false);
        assert_eq!(provider.primary_filter("alice"), "(uid=alice)");
    }

    #[test]
    fn custom_filter_substitutes_escaped_username() {
        let mut config = base_config();
        config["userFilter"] = "(&(objectClass=person)(cn=%s))".into();
        let provider = provider(config, false);
        assert_eq!(
            provider.primary_filter("al)(ice*"),
            "(&(objectClass=person)(cn=alice))"
        );
    }

    #[test]
    fn pid_filter_string_escapes_by_default() {
        let mut config = base_config();
        config["pidFilter"] = "(objectGUID=%s)".into();
        let provider = provider(config, false);
        assert_eq!(
            provider.pid_filter(b"pid)fox").as_deref(),
            Some("(objectGUID=pidfox)")
        );
    }

    #[test]
    fn pid_filter_binary_escapes_when_configured() {
        let mut config = base_config();
        config["pidFilter"] = "(objectGUID=%s)".into();
        let provider = provider(config, true);
        assert_eq!(
            provider.pid_filter(&[0x01, b'a', 0xFF]).as_deref(),
            Some("(objectGUID=\\01a\\FF)")
        );
    }

    #[test]
    fn pid_filter_absent_without_template() {
        let provider = provider(base_config(), false);
        assert_eq!(provider.pid_filter(b"pid"), None);
    }

    // ── Search base & attributes ─────────────────────────────────

    #[test]
    fn user_base_falls_back_to_base() {
        let provider = provider(base_config(), false);
        assert_eq!(provider.user_search_base(), "dc=example,dc=org");

        let mut config = base_config();
        config["userBase"] = "ou=people,dc=example,dc=org".into();
        let provider = super::LdapProvider::configure(
            &config,
            Arc::new(
                UsernameMapper::new(
                    &UsernameMapperConfig {
                        mode: MapperMode::Plain,
                        pepper: None,
                        folder: "/unused".into(),
                        binary_pid: false,
                    },
                    Arc::new(SledStore::temporary().unwrap()),
                )
                .unwrap(),
            ),
        )
        .unwrap();
        assert_eq!(provider.user_search_base(), "ou=people,dc=example,dc=org");
    }

    #[test]
    fn search_attrs_includes_configured_names() {
        let mut config = base_config();
        config["attributes"] = serde_json::json!({
            "uid": "cn",
            "persistentId": "objectGUID",
            "enabled": "accountEnabled",
        });
        let provider = provider(config, false);
        assert_eq!(provider.search_attrs(), vec!["cn", "objectGUID", "accountEnabled"]);
    }

    // ── Attribute extraction ─────────────────────────────────────

    #[test]
    fn extract_record_reads_all_attributes() {
        let attrs = LdapAttributes {
            uid: "uid".to_string(),
            persistent_id: Some("objectGUID".to_string()),
            enabled: Some("enabled".to_string()),
            displayname: Some("displayName".to_string()),
            admin: Some("isAdmin".to_string()),
        };
        let entry = entry(
            "uid=fox,dc=example,dc=org",
            &[("uid", "fox"), ("displayName", "Fox"), ("isAdmin", "TRUE")],
            &[("objectGUID", b"pidfox")],
        );
        let record = extract_record(&entry, &attrs);
        assert_eq!(record.username, "fox");
        assert_eq!(record.persistent_id.as_deref(), Some(&b"pidfox"[..]));
        assert_eq!(record.displayname.as_deref(), Some("Fox"));
        assert_eq!(record.admin, Some(true));
    }

    #[test]
    fn extract_record_admin_false_and_unknown() {
        let attrs = LdapAttributes {
            admin: Some("isAdmin".to_string()),
            ..Default::default()
        };
        let falsy = entry("uid=a", &[("uid", "a"), ("isAdmin", "FALSE")], &[]);
        assert_eq!(extract_record(&falsy, &attrs).admin, Some(false));
        let odd = entry("uid=a", &[("uid", "a"), ("isAdmin", "maybe")], &[]);
        assert_eq!(extract_record(&odd, &attrs).admin, None);
        let absent = entry("uid=a", &[("uid", "a")], &[]);
        assert_eq!(extract_record(&absent, &attrs).admin, None);
    }

    #[test]
    fn extract_record_string_pid_falls_back_to_attrs() {
        let attrs = LdapAttributes {
            persistent_id: Some("employeeNumber".to_string()),
            ..Default::default()
        };
        let entry = entry("uid=a", &[("uid", "a"), ("employeeNumber", "1234")], &[]);
        assert_eq!(
            extract_record(&entry, &attrs).persistent_id.as_deref(),
            Some(&b"1234"[..])
        );
    }

    #[test]
    fn extract_record_missing_uid_yields_empty_username() {
        let attrs = LdapAttributes::default();
        let entry = SearchEntry {
            dn: "uid=a".to_string(),
            attrs: HashMap::new(),
            bin_attrs: HashMap::new(),
        };
        assert_eq!(extract_record(&entry, &attrs).username, "");
    }

    // ── Config ───────────────────────────────────────────────────

    #[test]
    fn configure_rejects_missing_url() {
        let mapper = Arc::new(
            UsernameMapper::new(
                &UsernameMapperConfig {
                    mode: MapperMode::Plain,
                    pepper: None,
                    folder: "/unused".into(),
                    binary_pid: false,
                },
                Arc::new(SledStore::temporary().unwrap()),
            )
            .unwrap(),
        );
        let result = LdapProvider::configure(&serde_json::json!({ "base": "dc=x" }), mapper);
        assert!(result.is_err());
    }
}
