use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;
use uia_core::SessionData;
use uia_oidc::OidcCoordinator;
use uia_stage::{AuthResponse, STAGE_SSO, Stage};

/// `com.famedly.login.sso`: consumes a one-shot OIDC login token minted by
/// the callback endpoint. The token must belong to this UIA session when it
/// was bound to one.
pub struct SsoStage {
    oidc: Arc<OidcCoordinator>,
}

impl SsoStage {
    pub fn new(oidc: Arc<OidcCoordinator>) -> Self {
        Self { oidc }
    }
}

#[async_trait]
impl Stage for SsoStage {
    fn stage_type(&self) -> &'static str {
        STAGE_SSO
    }

    async fn auth(&self, auth: &Value, _params: Option<&Value>) -> AuthResponse {
        let Some(token) = auth.get("token").and_then(Value::as_str) else {
            return AuthResponse::failure("M_BAD_JSON", "Missing token");
        };
        let uia_session = auth.get("session").and_then(Value::as_str);

        match self.oidc.consume_login_token(token, uia_session) {
            Ok(entry) => {
                debug!(user = %entry.user, "SSO login token consumed");
                AuthResponse::success(SessionData {
                    username: Some(entry.user),
                    displayname: entry.displayname,
                    ..Default::default()
                })
            }
            Err(e) => {
                debug!(error = %e, "SSO login token rejected");
                AuthResponse::failure("M_FORBIDDEN", "Token login failed")
            }
        }
    }
}
