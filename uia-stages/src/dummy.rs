use async_trait::async_trait;
use serde_json::Value;
use uia_stage::{AuthResponse, STAGE_DUMMY, Stage};

/// `m.login.dummy`: unconditional success. Exists so a flow can be a pure
/// consent step.
pub struct DummyStage;

#[async_trait]
impl Stage for DummyStage {
    fn stage_type(&self) -> &'static str {
        STAGE_DUMMY
    }

    async fn auth(&self, _auth: &Value, _params: Option<&Value>) -> AuthResponse {
        AuthResponse::ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn always_succeeds() {
        let response = DummyStage.auth(&serde_json::json!({}), None).await;
        assert!(matches!(response, AuthResponse::Success { .. }));
    }
}
