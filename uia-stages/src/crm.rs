use async_trait::async_trait;
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode};
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, warn};
use uia_core::SessionData;
use uia_stage::{AuthResponse, STAGE_CRM, Stage};

/// `com.famedly.login.crm`: verifies a JWT issued by the CRM backend.
///
/// The verification key is fetched from the CRM and cached; a failing
/// verification refetches the key and retries exactly once, so a rotated
/// key heals itself while a genuinely bad token stays rejected.
pub struct CrmStage {
    config: CrmConfig,
    http: reqwest::Client,
    key: RwLock<Option<CrmKey>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CrmConfig {
    /// CRM base URL; the key lives at `<url>/jwt-key`.
    url: String,

    pharmacy_id: String,
}

#[derive(Clone)]
struct CrmKey {
    decoding: DecodingKey,
    validation: Validation,
}

#[derive(Debug, Deserialize)]
struct KeyResponse {
    jwt_key: String,
    jwt_algorithm: String,
}

#[derive(Debug, Deserialize)]
struct CrmClaims {
    sub: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    pharmacy_id: Option<Value>,
    #[serde(default)]
    pharmacy_admin: Option<bool>,
}

impl CrmStage {
    pub fn configure(config: &Value) -> anyhow::Result<Self> {
        let cfg: CrmConfig = serde_json::from_value(config.clone())
            .map_err(|e| anyhow::anyhow!("crm stage config error: {e}"))?;
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self { config: cfg, http, key: RwLock::new(None) })
    }

    async fn fetch_key(&self) -> anyhow::Result<CrmKey> {
        let url = format!("{}/jwt-key", self.config.url.trim_end_matches('/'));
        let response: KeyResponse = self
            .http
            .get(&url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        let algorithm: Algorithm = response
            .jwt_algorithm
            .parse()
            .map_err(|_| anyhow::anyhow!("crm: unknown JWT algorithm {}", response.jwt_algorithm))?;
        let decoding = match algorithm {
            Algorithm::HS256 | Algorithm::HS384 | Algorithm::HS512 => {
                DecodingKey::from_secret(response.jwt_key.as_bytes())
            }
            Algorithm::RS256
            | Algorithm::RS384
            | Algorithm::RS512
            | Algorithm::PS256
            | Algorithm::PS384
            | Algorithm::PS512 => DecodingKey::from_rsa_pem(response.jwt_key.as_bytes())?,
            Algorithm::ES256 | Algorithm::ES384 => {
                DecodingKey::from_ec_pem(response.jwt_key.as_bytes())?
            }
            Algorithm::EdDSA => DecodingKey::from_ed_pem(response.jwt_key.as_bytes())?,
        };
        let mut validation = Validation::new(algorithm);
        // Tokens without exp are still accepted; expiry is enforced when
        // present.
        validation.required_spec_claims.clear();
        debug!(algorithm = %response.jwt_algorithm, "CRM JWT key fetched");
        Ok(CrmKey { decoding, validation })
    }

    async fn current_key(&self, refresh: bool) -> anyhow::Result<CrmKey> {
        if !refresh {
            if let Some(key) = self.key.read().await.clone() {
                return Ok(key);
            }
        }
        let key = self.fetch_key().await?;
        *self.key.write().await = Some(key.clone());
        Ok(key)
    }

    fn pharmacy_matches(&self, claims: &CrmClaims) -> bool {
        match &claims.pharmacy_id {
            Some(Value::String(id)) => *id == self.config.pharmacy_id,
            Some(other) => other.to_string() == self.config.pharmacy_id,
            None => false,
        }
    }
}

#[async_trait]
impl Stage for CrmStage {
    fn stage_type(&self) -> &'static str {
        STAGE_CRM
    }

    async fn auth(&self, auth: &Value, _params: Option<&Value>) -> AuthResponse {
        let Some(token) = auth.get("token").and_then(Value::as_str) else {
            return AuthResponse::failure("M_BAD_JSON", "Missing token");
        };

        let key = match self.current_key(false).await {
            Ok(key) => key,
            Err(e) => {
                warn!(error = %e, "CRM key endpoint unreachable");
                return AuthResponse::failure("M_UNKNOWN", "Backend unreachable");
            }
        };

        let claims = match decode::<CrmClaims>(token, &key.decoding, &key.validation) {
            Ok(data) => data.claims,
            Err(first_error) => {
                // Possibly a rotated key; refetch and retry exactly once.
                debug!(error = %first_error, "CRM token verification failed, refetching key");
                let key = match self.current_key(true).await {
                    Ok(key) => key,
                    Err(e) => {
                        warn!(error = %e, "CRM key refetch failed");
                        return AuthResponse::failure("M_UNKNOWN", "Backend unreachable");
                    }
                };
                match decode::<CrmClaims>(token, &key.decoding, &key.validation) {
                    Ok(data) => data.claims,
                    Err(_) => {
                        return AuthResponse::failure("M_UNAUTHORIZED", "Invalid token");
                    }
                }
            }
        };

        if !self.pharmacy_matches(&claims) {
            return AuthResponse::failure("M_UNAUTHORIZED", "Invalid token");
        }

        AuthResponse::success(SessionData {
            username: Some(claims.sub),
            displayname: claims.name,
            admin: claims.pharmacy_admin,
            ..Default::default()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{EncodingKey, Header, encode};
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn sign(secret: &str, claims: &Value) -> String {
        encode(
            &Header::new(Algorithm::HS256),
            claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap()
    }

    fn claims() -> Value {
        json!({
            "sub": "alice",
            "name": "Alice",
            "pharmacy_id": "apo-1",
            "pharmacy_admin": true,
        })
    }

    async fn key_mock(server: &MockServer, secret: &str) {
        Mock::given(method("GET"))
            .and(path("/jwt-key"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "jwt_key": secret,
                "jwt_algorithm": "HS256",
            })))
            .mount(server)
            .await;
    }

    fn stage(server_uri: &str) -> CrmStage {
        CrmStage::configure(&json!({ "url": server_uri, "pharmacyId": "apo-1" })).unwrap()
    }

    #[tokio::test]
    async fn valid_token_succeeds() {
        let server = MockServer::start().await;
        key_mock(&server, "k1").await;
        let stage = stage(&server.uri());
        let token = sign("k1", &claims());
        let AuthResponse::Success { data } = stage.auth(&json!({ "token": token }), None).await
        else {
            panic!("expected success");
        };
        assert_eq!(data.username.as_deref(), Some("alice"));
        assert_eq!(data.displayname.as_deref(), Some("Alice"));
        assert_eq!(data.admin, Some(true));
    }

    #[tokio::test]
    async fn rotated_key_heals_with_one_refetch() {
        let server = MockServer::start().await;
        // First fetch sees the stale key, the refetch sees the current one.
        Mock::given(method("GET"))
            .and(path("/jwt-key"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "jwt_key": "stale",
                "jwt_algorithm": "HS256",
            })))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        key_mock(&server, "current").await;

        let stage = stage(&server.uri());
        let token = sign("current", &claims());
        let response = stage.auth(&json!({ "token": token }), None).await;
        assert!(matches!(response, AuthResponse::Success { .. }));
        assert_eq!(server.received_requests().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn bad_token_fails_after_exactly_one_refetch() {
        let server = MockServer::start().await;
        key_mock(&server, "k1").await;
        let stage = stage(&server.uri());
        let token = sign("other-key", &claims());
        let response = stage.auth(&json!({ "token": token }), None).await;
        assert_eq!(response, AuthResponse::failure("M_UNAUTHORIZED", "Invalid token"));
        // Initial fetch plus one retry fetch, nothing more.
        assert_eq!(server.received_requests().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn pharmacy_mismatch_is_unauthorized() {
        let server = MockServer::start().await;
        key_mock(&server, "k1").await;
        let stage = stage(&server.uri());
        let mut wrong = claims();
        wrong["pharmacy_id"] = json!("apo-2");
        let token = sign("k1", &wrong);
        let response = stage.auth(&json!({ "token": token }), None).await;
        assert_eq!(response, AuthResponse::failure("M_UNAUTHORIZED", "Invalid token"));
    }

    #[tokio::test]
    async fn numeric_pharmacy_id_compares_textually() {
        let server = MockServer::start().await;
        key_mock(&server, "k1").await;
        let stage = CrmStage::configure(&json!({ "url": server.uri(), "pharmacyId": "17" })).unwrap();
        let mut numeric = claims();
        numeric["pharmacy_id"] = json!(17);
        let token = sign("k1", &numeric);
        let response = stage.auth(&json!({ "token": token }), None).await;
        assert!(matches!(response, AuthResponse::Success { .. }));
    }

    #[tokio::test]
    async fn unreachable_key_endpoint_is_backend_error() {
        let stage = stage("http://127.0.0.1:1");
        let response = stage.auth(&json!({ "token": "x.y.z" }), None).await;
        assert_eq!(response, AuthResponse::failure("M_UNKNOWN", "Backend unreachable"));
    }

    #[tokio::test]
    async fn missing_token_is_bad_json() {
        let stage = stage("http://127.0.0.1:1");
        let response = stage.auth(&json!({}), None).await;
        assert!(matches!(response, AuthResponse::Failure { errcode: "M_BAD_JSON", .. }));
    }
}
