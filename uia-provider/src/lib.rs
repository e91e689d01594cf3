pub mod dummy;
pub mod escape;
pub mod ldap;

use async_trait::async_trait;
use std::sync::Arc;
use uia_store::UsernameMapper;

/// Outcome of a credential check.
///
/// When `username` is set it is the canonical localpart and callers must
/// adopt it in place of what the user typed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProviderCheck {
    pub success: bool,
    pub username: Option<String>,
    pub displayname: Option<String>,
    pub admin: Option<bool>,
}

impl ProviderCheck {
    pub fn failure() -> Self {
        Self::default()
    }
}

/// Validates `(user, password)` pairs against some backend. A provider may
/// rewrite the username and may optionally support password changes.
#[async_trait]
pub trait PasswordProvider: Send + Sync {
    /// Stable provider identifier, also the config key.
    fn id(&self) -> &'static str;

    async fn check_user(&self, username: &str, password: &str) -> ProviderCheck;

    fn supports_change_password(&self) -> bool {
        false
    }

    async fn change_password(&self, _username: &str, _old: &str, _new: &str) -> bool {
        false
    }
}

/// Build the configured providers, preserving config order. Unknown
/// provider keys fail startup.
pub fn build_providers(
    config: &serde_json::Value,
    mapper: Arc<UsernameMapper>,
) -> anyhow::Result<Vec<Arc<dyn PasswordProvider>>> {
    let Some(object) = config.as_object() else {
        anyhow::bail!("passwordProviders must be an object");
    };
    let mut providers: Vec<Arc<dyn PasswordProvider>> = Vec::with_capacity(object.len());
    for (key, value) in object {
        match key.as_str() {
            "dummy" => providers.push(Arc::new(dummy::DummyProvider::configure(value)?)),
            "ldap" => providers.push(Arc::new(ldap::LdapProvider::configure(
                value,
                Arc::clone(&mapper),
            )?)),
            other => anyhow::bail!("unknown password provider '{other}'"),
        }
    }
    if providers.is_empty() {
        anyhow::bail!("at least one password provider must be configured");
    }
    Ok(providers)
}
