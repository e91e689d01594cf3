use crate::StageContext;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;
use uia_core::SessionData;
use uia_provider::{PasswordProvider, build_providers};
use uia_stage::{AuthResponse, STAGE_PASSWORD, Stage};

/// `m.login.password`: checks the credentials against the configured
/// password providers, first success wins.
pub struct PasswordStage {
    providers: Vec<Arc<dyn PasswordProvider>>,
    homeserver_domain: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PasswordStageConfig {
    password_providers: Value,
}

impl PasswordStage {
    pub fn configure(config: &Value, ctx: &StageContext) -> anyhow::Result<Self> {
        let cfg: PasswordStageConfig = serde_json::from_value(config.clone())
            .map_err(|e| anyhow::anyhow!("m.login.password config error: {e}"))?;
        let providers = build_providers(&cfg.password_providers, Arc::clone(&ctx.mapper))?;
        Ok(Self {
            providers,
            homeserver_domain: ctx.homeserver_domain.clone(),
        })
    }

    pub fn providers(&self) -> &[Arc<dyn PasswordProvider>] {
        &self.providers
    }

    /// Pull the localpart out of the request, rejecting mxids that belong
    /// to a different homeserver.
    fn localpart(&self, user: &str) -> Result<String, AuthResponse> {
        if let Some(qualified) = user.strip_prefix('@') {
            let (localpart, domain) = qualified
                .split_once(':')
                .ok_or_else(|| AuthResponse::failure("M_UNKNOWN", "Bad User"))?;
            if domain != self.homeserver_domain || localpart.is_empty() {
                return Err(AuthResponse::failure("M_UNKNOWN", "Bad User"));
            }
            return Ok(localpart.to_string());
        }
        Ok(user.to_string())
    }
}

#[async_trait]
impl Stage for PasswordStage {
    fn stage_type(&self) -> &'static str {
        STAGE_PASSWORD
    }

    async fn auth(&self, auth: &Value, _params: Option<&Value>) -> AuthResponse {
        let identifier_user = auth
            .get("identifier")
            .filter(|identifier| {
                identifier.get("type").and_then(Value::as_str) == Some("m.id.user")
            })
            .and_then(|identifier| identifier.get("user"))
            .and_then(Value::as_str);
        // Off-spec fallback some clients still send.
        let user = identifier_user.or_else(|| auth.get("user").and_then(Value::as_str));

        let (Some(user), Some(password)) = (user, auth.get("password").and_then(Value::as_str))
        else {
            return AuthResponse::failure("M_BAD_JSON", "Missing user or password");
        };

        let localpart = match self.localpart(user) {
            Ok(localpart) => localpart,
            Err(response) => return response,
        };

        for provider in &self.providers {
            let check = provider.check_user(&localpart, password).await;
            if check.success {
                debug!(provider = provider.id(), "Password check succeeded");
                return AuthResponse::success(SessionData {
                    username: Some(check.username.unwrap_or(localpart)),
                    password: Some(password.to_string()),
                    displayname: check.displayname,
                    admin: check.admin,
                    password_provider: Some(provider.id().to_string()),
                });
            }
        }
        AuthResponse::failure("M_FORBIDDEN", "User not found or invalid password")
    }
}
