pub mod crm;
pub mod dummy;
pub mod password;
pub mod sso;
pub mod welcome;

pub use crm::CrmStage;
pub use dummy::DummyStage;
pub use password::PasswordStage;
pub use sso::SsoStage;
pub use welcome::WelcomeMessageStage;

use anyhow::Context;
use serde_json::Value;
use std::sync::Arc;
use uia_core::config::EndpointConfig;
use uia_core::{Endpoint, SessionStore};
use uia_oidc::OidcCoordinator;
use uia_stage::{
    STAGE_CRM, STAGE_DUMMY, STAGE_PASSWORD, STAGE_SSO, STAGE_WELCOME_MESSAGE, Stage, StageHandler,
    StageSet,
};
use uia_store::UsernameMapper;

/// Dependencies handed to stage constructors.
pub struct StageContext {
    pub homeserver_domain: String,
    pub mapper: Arc<UsernameMapper>,
    pub oidc: Option<Arc<OidcCoordinator>>,
}

/// Construct one stage from its opaque config. The stage type string is the
/// stable identifier config files use.
pub fn build_stage(
    stage_type: &str,
    config: &Value,
    ctx: &StageContext,
) -> anyhow::Result<Arc<dyn Stage>> {
    match stage_type {
        STAGE_PASSWORD => Ok(Arc::new(PasswordStage::configure(config, ctx)?)),
        STAGE_DUMMY => Ok(Arc::new(DummyStage)),
        STAGE_WELCOME_MESSAGE => Ok(Arc::new(WelcomeMessageStage::configure(config)?)),
        STAGE_SSO => {
            let oidc = ctx
                .oidc
                .clone()
                .context("sso stage configured but OIDC is not initialized")?;
            Ok(Arc::new(SsoStage::new(oidc)))
        }
        STAGE_CRM => Ok(Arc::new(CrmStage::configure(config)?)),
        other => anyhow::bail!("unknown stage type '{other}'"),
    }
}

/// Build the full stage handler for one endpoint.
pub fn build_handler(
    endpoint: Endpoint,
    config: &EndpointConfig,
    ctx: &StageContext,
    store: SessionStore,
) -> anyhow::Result<StageHandler> {
    let mut stages = StageSet::new();
    for (stage_type, stage_config) in &config.stages {
        stages.register(build_stage(stage_type, stage_config, ctx)?);
    }
    StageHandler::new(
        endpoint,
        &config.flows,
        stages,
        config.stage_aliases.clone(),
        store,
    )
}

#[cfg(test)]
pub(crate) mod tests_support {
    use super::StageContext;
    use std::sync::Arc;
    use uia_core::config::{MapperMode, UsernameMapperConfig};
    use uia_store::{SledStore, UsernameMapper};

    pub fn context() -> StageContext {
        let mapper_config = UsernameMapperConfig {
            mode: MapperMode::Plain,
            pepper: None,
            folder: "/unused".into(),
            binary_pid: false,
        };
        StageContext {
            homeserver_domain: "example.org".to_string(),
            mapper: Arc::new(
                UsernameMapper::new(&mapper_config, Arc::new(SledStore::temporary().unwrap()))
                    .unwrap(),
            ),
            oidc: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests_support::context;
    use serde_json::json;
    use std::collections::HashMap;
    use std::time::Duration;
    use uia_core::config::FlowConfig;

    #[test]
    fn build_stage_dispatches_known_types() {
        let ctx = context();
        assert!(build_stage(STAGE_DUMMY, &json!({}), &ctx).is_ok());
        assert!(build_stage(STAGE_WELCOME_MESSAGE, &json!({ "welcomeMessage": "hi" }), &ctx).is_ok());
        assert!(
            build_stage(
                STAGE_PASSWORD,
                &json!({ "passwordProviders": { "dummy": { "validPassword": "x" } } }),
                &ctx,
            )
            .is_ok()
        );
    }

    #[test]
    fn build_stage_rejects_unknown_type() {
        assert!(build_stage("m.login.fancy", &json!({}), &context()).is_err());
    }

    #[test]
    fn build_stage_sso_without_oidc_fails() {
        assert!(build_stage(STAGE_SSO, &json!({}), &context()).is_err());
    }

    #[test]
    fn build_handler_wires_configured_stages() {
        let config = EndpointConfig {
            rate_limit: Default::default(),
            stages: [
                (STAGE_DUMMY.to_string(), json!({})),
                (
                    STAGE_PASSWORD.to_string(),
                    json!({ "passwordProviders": { "dummy": { "validPassword": "x" } } }),
                ),
            ]
            .into_iter()
            .collect(),
            flows: vec![FlowConfig {
                stages: vec![STAGE_PASSWORD.to_string(), STAGE_DUMMY.to_string()],
            }],
            stage_aliases: HashMap::new(),
        };
        let store = SessionStore::new(Duration::from_secs(60));
        let handler = build_handler(Endpoint::Login, &config, &context(), store);
        assert!(handler.is_ok());
    }
}
