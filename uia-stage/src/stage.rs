use async_trait::async_trait;
use serde_json::Value;
use uia_core::SessionData;

/// Well-known stage type identifiers.
pub const STAGE_PASSWORD: &str = "m.login.password";
pub const STAGE_DUMMY: &str = "m.login.dummy";
pub const STAGE_WELCOME_MESSAGE: &str = "com.famedly.login.welcome_message";
pub const STAGE_SSO: &str = "com.famedly.login.sso";
pub const STAGE_CRM: &str = "com.famedly.login.crm";

/// Client-visible `auth.type` that maps onto the SSO stage.
pub const TYPE_LOGIN_TOKEN: &str = "m.login.token";

/// Result of one stage authentication attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum AuthResponse {
    /// Stage passed; merge `data` into the session.
    Success { data: SessionData },

    /// Stage rejected the attempt. Rendered into the 401 UIA progress
    /// envelope as `errcode`/`error`.
    Failure { errcode: &'static str, error: String },
}

impl AuthResponse {
    pub fn success(data: SessionData) -> Self {
        Self::Success { data }
    }

    pub fn ok() -> Self {
        Self::Success { data: SessionData::default() }
    }

    pub fn failure(errcode: &'static str, error: impl Into<String>) -> Self {
        Self::Failure { errcode, error: error.into() }
    }
}

/// One authentication step. Stages are stateless across sessions; they hold
/// only their own configuration.
#[async_trait]
pub trait Stage: Send + Sync {
    /// The stage type string, stable across deployments.
    fn stage_type(&self) -> &'static str;

    /// Whether this stage applies to the session at all. Inactive stages
    /// are filtered from flows and recorded as skipped.
    async fn is_active(&self, _data: &SessionData) -> bool {
        true
    }

    /// Parameters the client needs to drive this stage, if any. Memoized
    /// per session by the stage handler.
    async fn params(&self, _data: &SessionData) -> Option<Value> {
        None
    }

    /// Process one authentication attempt. `auth` is the client's raw
    /// `auth` object; `params` are this session's cached parameters.
    async fn auth(&self, auth: &Value, params: Option<&Value>) -> AuthResponse;
}
