use crate::config::ProviderConfig;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use uia_core::cache::DEFAULT_SWEEP_INTERVAL;
use uia_core::{TimedCache, UiaError};
use url::Url;

/// Lifetime of one-shot login tokens.
pub const LOGIN_TOKEN_TTL: Duration = Duration::from_secs(30 * 60);

/// Length of the random part of a login token.
const LOGIN_TOKEN_LENGTH: usize = 32;

/// One-shot login token handed back to the Matrix client after the
/// callback. Successful consumption deletes it.
#[derive(Debug, Clone, PartialEq)]
pub struct LoginToken {
    pub user: String,
    pub displayname: Option<String>,
    pub uia_session: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct DiscoveryDocument {
    authorization_endpoint: Url,
    token_endpoint: Url,
    #[serde(default)]
    introspection_endpoint: Option<Url>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    id_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct IntrospectionResponse {
    active: bool,
}

/// Claims the callback path cares about, pulled out of the ID token.
#[derive(Debug, Clone, PartialEq)]
pub struct VerifiedClaims {
    pub subject: String,
    pub displayname: Option<String>,
}

/// A single configured OIDC provider: prepared endpoints, an HTTP client
/// with the provider's timeout, and the provider-owned login token cache.
pub struct OidcProvider {
    pub id: String,
    config: ProviderConfig,
    authorization_endpoint: Url,
    token_endpoint: Url,
    introspection_endpoint: Option<Url>,
    http: reqwest::Client,
    login_tokens: Arc<TimedCache<String, LoginToken>>,
}

impl OidcProvider {
    /// Initialize a provider, fetching the issuer metadata when
    /// autodiscovery is configured. Runs on the server runtime so the
    /// token cache sweeper can be started here.
    pub async fn init(id: String, config: ProviderConfig) -> anyhow::Result<Self> {
        if config.timeout_ms == 0 {
            anyhow::bail!("oidc provider '{id}': timeout_ms must be positive");
        }
        let http = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()?;

        let (authorization_endpoint, token_endpoint, introspection_endpoint) =
            if config.autodiscover {
                let well_known = format!(
                    "{}/.well-known/openid-configuration",
                    config.issuer.trim_end_matches('/')
                );
                let document: DiscoveryDocument = http
                    .get(&well_known)
                    .send()
                    .await?
                    .error_for_status()?
                    .json()
                    .await?;
                debug!(provider = %id, "OIDC issuer metadata discovered");
                (
                    document.authorization_endpoint,
                    document.token_endpoint,
                    document.introspection_endpoint,
                )
            } else {
                let authorization = config
                    .authorization_endpoint
                    .as_deref()
                    .ok_or_else(|| anyhow::anyhow!("oidc provider '{id}': authorization_endpoint required without autodiscovery"))?;
                let token = config
                    .token_endpoint
                    .as_deref()
                    .ok_or_else(|| anyhow::anyhow!("oidc provider '{id}': token_endpoint required without autodiscovery"))?;
                (
                    Url::parse(authorization)?,
                    Url::parse(token)?,
                    config
                        .introspection_endpoint
                        .as_deref()
                        .map(Url::parse)
                        .transpose()?,
                )
            };

        if config.introspect && introspection_endpoint.is_none() {
            anyhow::bail!("oidc provider '{id}': introspection enabled but no endpoint known");
        }

        Ok(Self {
            id,
            config,
            authorization_endpoint,
            token_endpoint,
            introspection_endpoint,
            http,
            login_tokens: TimedCache::with_sweeper(LOGIN_TOKEN_TTL, DEFAULT_SWEEP_INTERVAL),
        })
    }

    pub fn json_redirects(&self) -> bool {
        self.config.json_redirects
    }

    pub fn namespace(&self) -> Option<&str> {
        self.config.namespace.as_deref()
    }

    /// Authorization URL for a fresh `state`.
    pub fn authorization_url(&self, redirect_uri: &str, state: &str) -> String {
        let mut url = self.authorization_endpoint.clone();
        url.query_pairs_mut()
            .append_pair("client_id", &self.config.client_id)
            .append_pair("response_type", "code")
            .append_pair("redirect_uri", redirect_uri)
            .append_pair("scope", &self.config.scopes.join(" "))
            .append_pair("state", state);
        url.into()
    }

    /// Exchange an authorization code for claims, enforcing the provider's
    /// claim contract and (when enabled) introspecting the access token.
    pub async fn exchange_code(
        &self,
        code: &str,
        redirect_uri: &str,
    ) -> Result<VerifiedClaims, UiaError> {
        let response = self
            .http
            .post(self.token_endpoint.clone())
            .form(&[
                ("grant_type", "authorization_code"),
                ("code", code),
                ("redirect_uri", redirect_uri),
                ("client_id", self.config.client_id.as_str()),
                ("client_secret", self.config.client_secret.as_str()),
            ])
            .send()
            .await
            .map_err(|e| {
                warn!(provider = %self.id, error = %e, "OIDC token endpoint unreachable");
                UiaError::BackendUnreachable
            })?;
        if !response.status().is_success() {
            warn!(provider = %self.id, status = %response.status(), "OIDC code exchange rejected");
            return Err(UiaError::Unauthorized("Code exchange failed".to_string()));
        }
        let tokens: TokenResponse = response
            .json()
            .await
            .map_err(|_| UiaError::Unauthorized("Malformed token response".to_string()))?;

        let id_token = tokens
            .id_token
            .as_deref()
            .ok_or_else(|| UiaError::Unauthorized("Provider returned no ID token".to_string()))?;
        let claims = decode_claims(id_token)?;
        let verified = self.verify_claims(&claims)?;

        if self.config.introspect {
            self.introspect(&tokens.access_token).await?;
        }
        Ok(verified)
    }

    fn verify_claims(&self, claims: &serde_json::Value) -> Result<VerifiedClaims, UiaError> {
        let subject = claims
            .get(&self.config.subject_claim)
            .and_then(|v| v.as_str())
            .ok_or_else(|| {
                UiaError::Unauthorized(format!(
                    "Subject claim '{}' missing or not a string",
                    self.config.subject_claim
                ))
            })?
            .to_string();

        let displayname = match &self.config.name_claim {
            Some(name_claim) => match claims.get(name_claim) {
                None => None,
                Some(serde_json::Value::String(s)) => Some(s.clone()),
                Some(_) => {
                    return Err(UiaError::Unauthorized(format!(
                        "Name claim '{name_claim}' is not a string"
                    )));
                }
            },
            None => None,
        };

        for (claim, expected) in &self.config.expected_claims {
            if claims.get(claim) != Some(expected) {
                debug!(provider = %self.id, claim, "Expected claim mismatch");
                return Err(UiaError::Unauthorized(format!(
                    "Claim '{claim}' did not match"
                )));
            }
        }

        Ok(VerifiedClaims { subject, displayname })
    }

    async fn introspect(&self, access_token: &str) -> Result<(), UiaError> {
        let endpoint = self
            .introspection_endpoint
            .as_ref()
            .expect("checked at init");
        let response: IntrospectionResponse = self
            .http
            .post(endpoint.clone())
            .basic_auth(&self.config.client_id, Some(&self.config.client_secret))
            .form(&[("token", access_token)])
            .send()
            .await
            .map_err(|e| {
                warn!(provider = %self.id, error = %e, "OIDC introspection unreachable");
                UiaError::BackendUnreachable
            })?
            .json()
            .await
            .map_err(|_| UiaError::Unauthorized("Malformed introspection response".to_string()))?;
        if !response.active {
            return Err(UiaError::TokenInactive);
        }
        Ok(())
    }

    /// Mint a one-shot login token for verified claims.
    pub fn issue_login_token(&self, claims: &VerifiedClaims, uia_session: Option<String>) -> String {
        let token = format!("{}|{}", self.id, random_string(LOGIN_TOKEN_LENGTH));
        self.login_tokens.set(
            token.clone(),
            LoginToken {
                user: claims.subject.clone(),
                displayname: claims.displayname.clone(),
                uia_session,
            },
        );
        token
    }

    /// Consume a login token. The token is removed on success; a session
    /// mismatch leaves it in place.
    pub fn consume_login_token(
        &self,
        token: &str,
        uia_session: Option<&str>,
    ) -> Option<LoginToken> {
        let entry = self.login_tokens.remove(&token.to_string())?;
        if let Some(bound) = &entry.uia_session {
            if uia_session != Some(bound.as_str()) {
                // Not the session this token was minted for; keep it live.
                self.login_tokens.set(token.to_string(), entry);
                return None;
            }
        }
        Some(entry)
    }
}

/// Pull the claims object out of a JWT without verifying the signature:
/// the token was received first-hand from the token endpoint over TLS.
fn decode_claims(id_token: &str) -> Result<serde_json::Value, UiaError> {
    let payload = id_token
        .split('.')
        .nth(1)
        .ok_or_else(|| UiaError::Unauthorized("Malformed ID token".to_string()))?;
    let raw = URL_SAFE_NO_PAD
        .decode(payload)
        .map_err(|_| UiaError::Unauthorized("Malformed ID token".to_string()))?;
    serde_json::from_slice(&raw)
        .map_err(|_| UiaError::Unauthorized("Malformed ID token".to_string()))
}

pub(crate) fn random_string(length: usize) -> String {
    use rand::Rng;
    use rand::distributions::Alphanumeric;
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(length)
        .map(char::from)
        .collect()
}
