use crate::{PasswordProvider, ProviderCheck};
use async_trait::async_trait;
use serde::Deserialize;

/// Accepts any username with one shared password. For testing deployments.
pub struct DummyProvider {
    valid_password: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DummyConfig {
    valid_password: String,
}

impl DummyProvider {
    pub fn configure(config: &serde_json::Value) -> anyhow::Result<Self> {
        let cfg: DummyConfig = serde_json::from_value(config.clone())
            .map_err(|e| anyhow::anyhow!("dummy provider config error: {e}"))?;
        Ok(Self { valid_password: cfg.valid_password })
    }
}

#[async_trait]
impl PasswordProvider for DummyProvider {
    fn id(&self) -> &'static str {
        "dummy"
    }

    async fn check_user(&self, _username: &str, password: &str) -> ProviderCheck {
        ProviderCheck {
            success: password == self.valid_password,
            ..Default::default()
        }
    }

    fn supports_change_password(&self) -> bool {
        true
    }

    async fn change_password(&self, _username: &str, old: &str, _new: &str) -> bool {
        old == self.valid_password
    }
}
