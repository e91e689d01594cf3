use serde::Deserialize;
use std::collections::HashMap;

/// Configuration of the SSO stage, decoded from its opaque stage config.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SsoConfig {
    pub providers: HashMap<String, ProviderConfig>,

    /// Provider used when the redirect endpoint names none.
    pub default: String,

    #[serde(default)]
    pub endpoints: SsoEndpoints,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SsoEndpoints {
    #[serde(default = "default_redirect_path")]
    pub redirect: String,

    #[serde(default = "default_callback_path")]
    pub callback: String,
}

impl Default for SsoEndpoints {
    fn default() -> Self {
        Self {
            redirect: default_redirect_path(),
            callback: default_callback_path(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderConfig {
    pub issuer: String,

    pub client_id: String,
    pub client_secret: String,

    /// Fetch endpoint URLs from the issuer's well-known document instead
    /// of requiring them inline.
    #[serde(default)]
    pub autodiscover: bool,

    #[serde(default)]
    pub authorization_endpoint: Option<String>,

    #[serde(default)]
    pub token_endpoint: Option<String>,

    #[serde(default)]
    pub introspection_endpoint: Option<String>,

    #[serde(default = "default_scopes")]
    pub scopes: Vec<String>,

    /// Claim carrying the stable subject. Must decode to a string.
    #[serde(default = "default_subject_claim")]
    pub subject_claim: String,

    /// Optional claim carrying the display name.
    #[serde(default)]
    pub name_claim: Option<String>,

    /// Claims that must match these values exactly.
    #[serde(default)]
    pub expected_claims: HashMap<String, serde_json::Value>,

    /// Verify token liveness at the introspection endpoint.
    #[serde(default)]
    pub introspect: bool,

    /// Prefix for minted usernames (`namespace/subject`); null leaves the
    /// subject untouched.
    #[serde(default)]
    pub namespace: Option<String>,

    /// Per-provider HTTP timeout in milliseconds.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Answer the redirect endpoint with `200 {location}` instead of a 302.
    #[serde(default)]
    pub json_redirects: bool,
}

fn default_redirect_path() -> String {
    "/_uiap/oidc/redirect".to_string()
}

fn default_callback_path() -> String {
    "/_uiap/oidc/callback".to_string()
}

fn default_scopes() -> Vec<String> {
    vec!["openid".to_string()]
}

fn default_subject_claim() -> String {
    "sub".to_string()
}

fn default_timeout_ms() -> u64 {
    10_000
}
