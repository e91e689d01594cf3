use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};
use std::path::PathBuf;
use uia_core::SessionData;
use uia_stage::{AuthResponse, STAGE_WELCOME_MESSAGE, Stage};

/// `com.famedly.login.welcome_message`: hands the client a message to
/// display. The auth step itself always passes.
pub struct WelcomeMessageStage {
    message: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WelcomeConfig {
    #[serde(default)]
    welcome_message: Option<String>,

    /// Read the message from this file instead.
    #[serde(default)]
    file: Option<PathBuf>,
}

impl WelcomeMessageStage {
    pub fn configure(config: &Value) -> anyhow::Result<Self> {
        let cfg: WelcomeConfig = serde_json::from_value(config.clone())
            .map_err(|e| anyhow::anyhow!("welcome_message config error: {e}"))?;
        let message = match (cfg.welcome_message, cfg.file) {
            (Some(message), _) => message,
            (None, Some(file)) => std::fs::read_to_string(&file)
                .map_err(|e| anyhow::anyhow!("welcome_message: cannot read {}: {e}", file.display()))?,
            (None, None) => String::new(),
        };
        Ok(Self { message })
    }
}

#[async_trait]
impl Stage for WelcomeMessageStage {
    fn stage_type(&self) -> &'static str {
        STAGE_WELCOME_MESSAGE
    }

    async fn is_active(&self, _data: &SessionData) -> bool {
        !self.message.is_empty()
    }

    async fn params(&self, _data: &SessionData) -> Option<Value> {
        Some(json!({ "welcome_message": self.message }))
    }

    async fn auth(&self, _auth: &Value, _params: Option<&Value>) -> AuthResponse {
        AuthResponse::ok()
    }
}
