use crate::config::SsoConfig;
use crate::provider::{LoginToken, OidcProvider, random_string};
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};
use uia_core::UiaError;

/// Length of the `state` parameter.
const STATE_LENGTH: usize = 32;

/// An authorization-code exchange in flight, indexed by `state`.
#[derive(Debug, Clone)]
pub struct OidcSession {
    pub id: String,
    pub provider_id: String,
    pub redirect_url: String,
    pub uia_session: Option<String>,
}

/// Where to send the user agent after the redirect endpoint ran.
#[derive(Debug, Clone, PartialEq)]
pub struct RedirectOutcome {
    pub location: String,
    pub json: bool,
}

/// Owns the provider set and the in-flight authorization-code sessions.
/// Stages reference providers through this coordinator by string ID.
pub struct OidcCoordinator {
    providers: HashMap<String, Arc<OidcProvider>>,
    default_provider: String,
    sessions: DashMap<String, OidcSession>,
    redirect_path: String,
    callback_path: String,
    callback_uri: String,
}

impl OidcCoordinator {
    /// Initialize all providers. Fails when the configured default does
    /// not exist.
    pub async fn init(config: SsoConfig, public_baseurl: &str) -> anyhow::Result<Self> {
        let mut providers = HashMap::new();
        for (id, provider_config) in config.providers {
            let provider = OidcProvider::init(id.clone(), provider_config).await?;
            providers.insert(id, Arc::new(provider));
        }
        if !providers.contains_key(&config.default) {
            anyhow::bail!("oidc: default provider '{}' is not configured", config.default);
        }
        let callback_uri = format!(
            "{}{}",
            public_baseurl.trim_end_matches('/'),
            config.endpoints.callback
        );
        info!(providers = providers.len(), "OIDC providers initialized");
        Ok(Self {
            providers,
            default_provider: config.default,
            sessions: DashMap::new(),
            redirect_path: config.endpoints.redirect,
            callback_path: config.endpoints.callback,
            callback_uri,
        })
    }

    pub fn redirect_path(&self) -> &str {
        &self.redirect_path
    }

    pub fn callback_path(&self) -> &str {
        &self.callback_path
    }

    pub fn provider(&self, id: &str) -> Option<&Arc<OidcProvider>> {
        self.providers.get(id)
    }

    /// Redirect endpoint: allocate a `state`, remember the in-flight
    /// session, and point the user agent at the provider.
    pub fn start_auth(
        &self,
        provider_id: Option<&str>,
        redirect_url: String,
        uia_session: Option<String>,
    ) -> Result<RedirectOutcome, UiaError> {
        let id = provider_id.unwrap_or(&self.default_provider);
        let provider = self
            .provider(id)
            .ok_or_else(|| UiaError::Unrecognized(format!("Unknown OIDC provider '{id}'")))?;

        let state = random_string(STATE_LENGTH);
        self.sessions.insert(
            state.clone(),
            OidcSession {
                id: state.clone(),
                provider_id: provider.id.clone(),
                redirect_url,
                uia_session,
            },
        );
        debug!(provider = %provider.id, state = %state, "OIDC authorization started");
        Ok(RedirectOutcome {
            location: provider.authorization_url(&self.callback_uri, &state),
            json: provider.json_redirects(),
        })
    }

    /// Callback endpoint: exchange the code, enforce the claim contract,
    /// mint a one-shot login token, and bounce back to the client.
    pub async fn handle_callback(
        &self,
        state: &str,
        code: &str,
    ) -> Result<RedirectOutcome, UiaError> {
        let session = self
            .sessions
            .get(state)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| UiaError::Unrecognized("Unknown OIDC state".to_string()))?;
        let provider = self
            .provider(&session.provider_id)
            .ok_or_else(|| UiaError::Unrecognized("Unknown OIDC provider".to_string()))?;

        let claims = provider.exchange_code(code, &self.callback_uri).await?;
        let token = provider.issue_login_token(&claims, session.uia_session.clone());
        self.sessions.remove(state);
        debug!(provider = %provider.id, subject = %claims.subject, "OIDC login token minted");

        let separator = if session.redirect_url.contains('?') { '&' } else { '?' };
        Ok(RedirectOutcome {
            location: format!("{}{}loginToken={}", session.redirect_url, separator, token),
            json: provider.json_redirects(),
        })
    }

    /// Consume a one-shot login token, applying the provider's namespace.
    /// Used by the SSO stage.
    pub fn consume_login_token(
        &self,
        token: &str,
        uia_session: Option<&str>,
    ) -> Result<LoginToken, UiaError> {
        let provider_id = token.split('|').next().unwrap_or_default();
        let provider = self
            .provider(provider_id)
            .ok_or_else(|| UiaError::Forbidden("Token login failed".to_string()))?;
        let mut entry = provider
            .consume_login_token(token, uia_session)
            .ok_or_else(|| UiaError::Forbidden("Token login failed".to_string()))?;
        if let Some(namespace) = provider.namespace() {
            entry.user = format!("{namespace}/{}", entry.user);
        }
        Ok(entry)
    }

    #[cfg(test)]
    pub(crate) fn session_for_state(&self, state: &str) -> Option<OidcSession> {
        self.sessions.get(state).map(|entry| entry.value().clone())
    }
}
