use serde_json::{Value, json};
use std::time::Duration;
use tracing::{debug, warn};
use uia_core::UiaError;
use uia_core::config::HomeserverConfig;

/// Login type the homeserver's token authenticator accepts.
pub const LOGIN_TOKEN_TYPE: &str = "com.famedly.login.token";

/// Thin client for the upstream homeserver's client-server API.
pub struct HomeserverClient {
    base: String,
    domain: String,
    http: reqwest::Client,
}

/// A verbatim upstream response: status plus JSON body.
#[derive(Debug)]
pub struct UpstreamResponse {
    pub status: u16,
    pub body: Value,
}

impl HomeserverClient {
    pub fn new(config: &HomeserverConfig) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            base: format!(
                "{}{}",
                config.url.trim_end_matches('/'),
                config.base.trim_end_matches('/')
            ),
            domain: config.domain.clone(),
            http,
        })
    }

    pub fn mxid(&self, localpart: &str) -> String {
        format!("@{localpart}:{}", self.domain)
    }

    /// `POST /login` with a minted token. The response is returned
    /// verbatim to the client.
    pub async fn login_with_token(
        &self,
        localpart: &str,
        token: &str,
        device_id: Option<&str>,
        initial_device_display_name: Option<&str>,
    ) -> Result<UpstreamResponse, UiaError> {
        let mut body = json!({
            "type": LOGIN_TOKEN_TYPE,
            "identifier": { "type": "m.id.user", "user": localpart },
            "token": token,
        });
        if let Some(device_id) = device_id {
            body["device_id"] = json!(device_id);
        }
        if let Some(name) = initial_device_display_name {
            body["initial_device_display_name"] = json!(name);
        }

        let response = self
            .http
            .post(format!("{}/login", self.base))
            .json(&body)
            .send()
            .await
            .map_err(backend_unreachable)?;
        let status = response.status().as_u16();
        let body = response.json().await.map_err(backend_unreachable)?;
        debug!(status, "Homeserver login forwarded");
        Ok(UpstreamResponse { status, body })
    }

    /// Validate a client access token against `/account/whoami`.
    pub async fn whoami(&self, access_token: &str) -> Result<(), UiaError> {
        let response = self
            .http
            .get(format!("{}/account/whoami", self.base))
            .bearer_auth(access_token)
            .send()
            .await
            .map_err(backend_unreachable)?;
        match response.status().as_u16() {
            200..=299 => Ok(()),
            401 | 403 => Err(UiaError::UnknownToken),
            status => {
                warn!(status, "whoami failed upstream");
                Err(UiaError::BackendUnreachable)
            }
        }
    }

    /// Best-effort displayname update after a successful login.
    pub async fn set_displayname(&self, mxid: &str, displayname: &str, access_token: &str) {
        let url = format!("{}/profile/{mxid}/displayname", self.base);
        let result = self
            .http
            .put(url)
            .bearer_auth(access_token)
            .json(&json!({ "displayname": displayname }))
            .send()
            .await;
        match result {
            Ok(response) if response.status().is_success() => {}
            Ok(response) => warn!(status = %response.status(), "Displayname update rejected"),
            Err(e) => warn!(error = %e, "Displayname update failed"),
        }
    }

    /// Forward a device-management request verbatim, with the token auth
    /// object injected into the body.
    pub async fn proxy_request(
        &self,
        method: &http::Method,
        path: &str,
        mut body: Value,
        localpart: &str,
        minted_token: &str,
        access_token: &str,
    ) -> Result<UpstreamResponse, UiaError> {
        let mxid = self.mxid(localpart);
        body["auth"] = json!({
            "type": LOGIN_TOKEN_TYPE,
            "identifier": { "type": "m.id.user", "user": mxid },
            "user": mxid,
            "token": minted_token,
        });

        let url = format!("{}{}", self.base_host(), path);
        let response = self
            .http
            .request(method.clone(), url)
            .bearer_auth(access_token)
            .json(&body)
            .send()
            .await
            .map_err(backend_unreachable)?;
        let status = response.status().as_u16();
        let body = if status == 204 {
            json!({})
        } else {
            response.json().await.unwrap_or_else(|_| json!({}))
        };
        Ok(UpstreamResponse { status, body })
    }

    /// The homeserver origin without the client API prefix, for requests
    /// that already carry a full path.
    fn base_host(&self) -> &str {
        match self.base.find("/_matrix") {
            Some(position) => &self.base[..position],
            None => &self.base,
        }
    }
}

fn backend_unreachable(e: reqwest::Error) -> UiaError {
    warn!(error = %e, "Homeserver unreachable");
    UiaError::BackendUnreachable
}
