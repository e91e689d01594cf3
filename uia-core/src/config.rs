use crate::session::Endpoint;
use figment::Figment;
use figment::providers::{Env, Format, Yaml};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

/// Top-level configuration for the UIA proxy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UiaConfig {
    /// HTTP listener configuration
    #[serde(default)]
    pub webserver: WebserverConfig,

    /// UIA session lifetime
    #[serde(default)]
    pub session: SessionConfig,

    /// Localpart derivation / reverse index
    pub username_mapper: UsernameMapperConfig,

    /// Upstream homeserver
    pub homeserver: HomeserverConfig,

    /// Per-endpoint UIA configuration
    #[serde(default)]
    pub uia: UiaEndpointsConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebserverConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Public base URL used to build OIDC redirect URIs. Defaults to
    /// `http://{host}:{port}`.
    #[serde(default)]
    pub public_baseurl: Option<String>,
}

impl WebserverConfig {
    pub fn public_baseurl(&self) -> String {
        self.public_baseurl
            .clone()
            .unwrap_or_else(|| format!("http://{}:{}", self.host, self.port))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionConfig {
    /// Session TTL in milliseconds.
    #[serde(default = "default_session_timeout")]
    pub timeout: u64,
}

impl SessionConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MapperMode {
    #[serde(rename = "PLAIN")]
    Plain,
    #[serde(rename = "HMAC-SHA256")]
    HmacSha256,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsernameMapperConfig {
    pub mode: MapperMode,

    /// Server-side secret mixed into localpart derivation.
    #[serde(default)]
    pub pepper: Option<String>,

    /// Directory for the persistent reverse index.
    pub folder: PathBuf,

    /// Hash persistent IDs as raw bytes instead of lossy UTF-8 strings.
    #[serde(default)]
    pub binary_pid: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HomeserverConfig {
    /// The server_name part of mxids this proxy accepts.
    pub domain: String,

    /// Base URL of the homeserver's client-server API.
    pub url: String,

    /// Client API path prefix on the homeserver.
    #[serde(default = "default_homeserver_base")]
    pub base: String,

    pub token: TokenConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenConfig {
    /// HMAC secret or PEM-encoded private key, per algorithm family.
    pub secret: String,

    #[serde(default = "default_token_algorithm")]
    pub algorithm: TokenAlgorithm,

    /// Token lifetime in milliseconds.
    #[serde(default = "default_token_expires")]
    pub expires: u64,
}

/// Signing algorithms accepted for the minted homeserver token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TokenAlgorithm {
    HS256,
    HS384,
    HS512,
    RS256,
    RS384,
    RS512,
    ES256,
    ES384,
    ES512,
    PS256,
    PS384,
    PS512,
    #[serde(rename = "none")]
    None,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UiaEndpointsConfig {
    #[serde(default)]
    pub login: Option<EndpointConfig>,

    #[serde(default)]
    pub password: Option<EndpointConfig>,

    #[serde(default)]
    pub delete_device: Option<EndpointConfig>,

    #[serde(default)]
    pub delete_devices: Option<EndpointConfig>,

    #[serde(default)]
    pub upload_device_signing_keys: Option<EndpointConfig>,
}

impl UiaEndpointsConfig {
    pub fn get(&self, endpoint: Endpoint) -> Option<&EndpointConfig> {
        match endpoint {
            Endpoint::Login => self.login.as_ref(),
            Endpoint::Password => self.password.as_ref(),
            Endpoint::DeleteDevice => self.delete_device.as_ref(),
            Endpoint::DeleteDevices => self.delete_devices.as_ref(),
            Endpoint::UploadDeviceSigningKeys => self.upload_device_signing_keys.as_ref(),
        }
    }

    pub fn configured(&self) -> Vec<(Endpoint, &EndpointConfig)> {
        Endpoint::all()
            .iter()
            .filter_map(|endpoint| self.get(*endpoint).map(|cfg| (*endpoint, cfg)))
            .collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointConfig {
    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    /// Stage type → opaque stage configuration. Decoded by the stage
    /// implementation itself.
    #[serde(default)]
    pub stages: HashMap<String, serde_json::Value>,

    #[serde(default)]
    pub flows: Vec<FlowConfig>,

    /// Requested auth.type → configured stage type.
    #[serde(default)]
    pub stage_aliases: HashMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowConfig {
    pub stages: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitConfig {
    /// Window size in milliseconds.
    #[serde(default = "default_rate_window")]
    pub window_ms: u64,

    /// Max requests per remote address per window.
    #[serde(default = "default_rate_max")]
    pub max: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoggingConfig {
    /// Console level filter (tracing EnvFilter syntax).
    #[serde(default = "default_log_level")]
    pub console: String,

    #[serde(default)]
    pub files: Vec<FileLogConfig>,

    /// chrono strftime format for log line timestamps.
    #[serde(default = "default_line_date_format")]
    pub line_date_format: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileLogConfig {
    pub file: PathBuf,

    #[serde(default = "default_log_level")]
    pub level: String,
}

impl UiaConfig {
    /// Load configuration from a YAML file, overridable via
    /// `UIA_`-prefixed environment variables (`UIA_WEBSERVER__PORT`, …).
    pub fn load(config_path: &str) -> anyhow::Result<Self> {
        let config: Self = Figment::new()
            .merge(Yaml::file(config_path))
            .merge(Env::prefixed("UIA_").split("__"))
            .extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Startup validation beyond what serde can express. Failures here are
    /// fatal.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.username_mapper.mode == MapperMode::HmacSha256
            && self.username_mapper.pepper.is_none()
        {
            anyhow::bail!("usernameMapper: HMAC-SHA256 mode requires a pepper");
        }
        if self.session.timeout == 0 {
            anyhow::bail!("session.timeout must be positive");
        }
        for (endpoint, cfg) in self.uia.configured() {
            for flow in &cfg.flows {
                for stage in &flow.stages {
                    if !cfg.stages.contains_key(stage) {
                        anyhow::bail!(
                            "uia.{endpoint}: flow references unconfigured stage '{stage}'"
                        );
                    }
                }
            }
            for target in cfg.stage_aliases.values() {
                if !cfg.stages.contains_key(target) {
                    anyhow::bail!(
                        "uia.{endpoint}: stage alias targets unconfigured stage '{target}'"
                    );
                }
            }
        }
        Ok(())
    }
}

// Default implementations

impl Default for WebserverConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            public_baseurl: None,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self { timeout: default_session_timeout() }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            window_ms: default_rate_window(),
            max: default_rate_max(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            console: default_log_level(),
            files: vec![],
            line_date_format: default_line_date_format(),
        }
    }
}

// Serde default functions

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    9740
}

fn default_session_timeout() -> u64 {
    30 * 60 * 1000
}

fn default_homeserver_base() -> String {
    "/_matrix/client/r0".to_string()
}

fn default_token_algorithm() -> TokenAlgorithm {
    TokenAlgorithm::HS512
}

fn default_token_expires() -> u64 {
    2 * 60 * 1000
}

fn default_rate_window() -> u64 {
    60 * 1000
}

fn default_rate_max() -> u64 {
    100
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_line_date_format() -> String {
    "%Y-%m-%d %H:%M:%S%.3f".to_string()
}
