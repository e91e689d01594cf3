use crate::middleware::{access_token, parse_query};
use crate::server::AppState;
use axum::Json;
use axum::extract::{ConnectInfo, Path, Request, State};
use axum::response::{IntoResponse, Response};
use http::{Method, StatusCode};
use serde_json::{Value, json};
use std::net::SocketAddr;
use tracing::debug;
use uia_core::{Endpoint, Session, UiaError};
use uia_oidc::RedirectOutcome;
use uia_stage::UiaOutcome;

const BODY_LIMIT: usize = 1024 * 1024;

fn json_response(status: u16, body: Value) -> Response {
    let status = StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(body)).into_response()
}

fn error_response(e: &UiaError) -> Response {
    json_response(e.status(), e.to_body())
}

struct Prepared {
    method: Method,
    path: String,
    body: Value,
    access_token: Option<String>,
}

/// The front half of every UIA endpoint: rate limit, JSON validation,
/// access-token parsing, and (where required) upstream token verification.
async fn prepare(
    state: &AppState,
    endpoint: Endpoint,
    request: Request,
    needs_upstream_token: bool,
) -> Result<Prepared, Response> {
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let query = parse_query(request.uri().query().unwrap_or(""));
    let client_ip = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string());
    let headers = request.headers().clone();

    if let Some(limiter) = state.limiters.get(&endpoint) {
        if !limiter.check(&client_ip) {
            debug!(endpoint = %endpoint, client_ip, "Rate limited");
            return Err(json_response(
                429,
                json!({ "errcode": "M_LIMIT_EXCEEDED", "error": "Too many requests" }),
            ));
        }
    }

    let bytes = axum::body::to_bytes(request.into_body(), BODY_LIMIT)
        .await
        .map_err(|_| error_response(&UiaError::NotJson))?;
    let body = if matches!(method, Method::POST | Method::PUT | Method::PATCH) {
        serde_json::from_slice(&bytes).map_err(|_| error_response(&UiaError::NotJson))?
    } else if bytes.is_empty() {
        json!({})
    } else {
        serde_json::from_slice(&bytes).map_err(|_| error_response(&UiaError::NotJson))?
    };

    let access_token = access_token(&headers, &query);
    if needs_upstream_token {
        let Some(token) = access_token.as_deref() else {
            return Err(error_response(&UiaError::MissingToken));
        };
        if let Err(e) = state.homeserver.whoami(token).await {
            return Err(error_response(&e));
        }
    }

    Ok(Prepared { method, path, body, access_token })
}

/// Drive the endpoint's stage handler; only a completed flow falls through.
async fn run_uia(state: &AppState, endpoint: Endpoint, body: &Value) -> Result<Session, Response> {
    let Some(handler) = state.handlers.get(&endpoint) else {
        return Err(error_response(&UiaError::Unrecognized(
            "Endpoint not configured".to_string(),
        )));
    };
    match handler.handle(body).await {
        Ok(UiaOutcome::Complete(session)) => Ok(session),
        Ok(UiaOutcome::Respond { status, body }) => Err(json_response(status, body)),
        Err(e) => Err(error_response(&e)),
    }
}

pub async fn health() -> Json<Value> {
    Json(json!({}))
}

// ── UIA endpoints ─────────────────────────────────────────────────

pub async fn login(State(state): State<AppState>, request: Request) -> Response {
    let prepared = match prepare(&state, Endpoint::Login, request, false).await {
        Ok(prepared) => prepared,
        Err(response) => return response,
    };
    let session = match run_uia(&state, Endpoint::Login, &prepared.body).await {
        Ok(session) => session,
        Err(response) => return response,
    };
    let Some(username) = session.data.username.clone() else {
        return error_response(&UiaError::Unknown("No username in session".to_string()));
    };

    let token = match state.minter.mint(
        &username,
        session.data.admin,
        session.data.displayname.as_deref(),
    ) {
        Ok(token) => token,
        Err(e) => return error_response(&e),
    };

    let device_id = prepared.body.get("device_id").and_then(Value::as_str);
    let device_name = prepared
        .body
        .get("initial_device_display_name")
        .and_then(Value::as_str);
    match state
        .homeserver
        .login_with_token(&username, &token, device_id, device_name)
        .await
    {
        Ok(upstream) => {
            if upstream.status == 200 {
                if let (Some(displayname), Some(access), Some(user_id)) = (
                    session.data.displayname.as_deref(),
                    upstream.body.get("access_token").and_then(Value::as_str),
                    upstream.body.get("user_id").and_then(Value::as_str),
                ) {
                    state.homeserver.set_displayname(user_id, displayname, access).await;
                }
            }
            json_response(upstream.status, upstream.body)
        }
        Err(e) => error_response(&e),
    }
}

pub async fn password(State(state): State<AppState>, request: Request) -> Response {
    let prepared = match prepare(&state, Endpoint::Password, request, true).await {
        Ok(prepared) => prepared,
        Err(response) => return response,
    };
    let session = match run_uia(&state, Endpoint::Password, &prepared.body).await {
        Ok(session) => session,
        Err(response) => return response,
    };

    let Some(new_password) = prepared.body.get("new_password").and_then(Value::as_str) else {
        return error_response(&UiaError::BadJson("Missing new_password".to_string()));
    };
    let (Some(username), Some(old_password)) = (&session.data.username, &session.data.password)
    else {
        return error_response(&UiaError::Unknown("Password change failed".to_string()));
    };

    // Prefer the provider that authenticated this session.
    let provider = state
        .change_providers
        .iter()
        .find(|provider| {
            session.data.password_provider.as_deref() == Some(provider.id())
                && provider.supports_change_password()
        })
        .or_else(|| {
            state
                .change_providers
                .iter()
                .find(|provider| provider.supports_change_password())
        });
    let Some(provider) = provider else {
        return error_response(&UiaError::Unknown("Password change failed".to_string()));
    };

    if provider.change_password(username, old_password, new_password).await {
        json_response(200, json!({}))
    } else {
        error_response(&UiaError::Unknown("Password change failed".to_string()))
    }
}

pub async fn delete_device(State(state): State<AppState>, request: Request) -> Response {
    proxy_endpoint(state, Endpoint::DeleteDevice, request).await
}

pub async fn delete_devices(State(state): State<AppState>, request: Request) -> Response {
    proxy_endpoint(state, Endpoint::DeleteDevices, request).await
}

pub async fn upload_device_signing_keys(
    State(state): State<AppState>,
    request: Request,
) -> Response {
    proxy_endpoint(state, Endpoint::UploadDeviceSigningKeys, request).await
}

/// Shared tail of the device endpoints: forward the original request to
/// the homeserver with the token auth object injected.
async fn proxy_endpoint(state: AppState, endpoint: Endpoint, request: Request) -> Response {
    let prepared = match prepare(&state, endpoint, request, true).await {
        Ok(prepared) => prepared,
        Err(response) => return response,
    };
    let session = match run_uia(&state, endpoint, &prepared.body).await {
        Ok(session) => session,
        Err(response) => return response,
    };
    let Some(username) = session.data.username.clone() else {
        return error_response(&UiaError::Unknown("No username in session".to_string()));
    };
    let Some(access_token) = prepared.access_token.as_deref() else {
        return error_response(&UiaError::MissingToken);
    };

    let token = match state.minter.mint(
        &username,
        session.data.admin,
        session.data.displayname.as_deref(),
    ) {
        Ok(token) => token,
        Err(e) => return error_response(&e),
    };

    match state
        .homeserver
        .proxy_request(
            &prepared.method,
            &prepared.path,
            prepared.body.clone(),
            &username,
            &token,
            access_token,
        )
        .await
    {
        Ok(upstream) => json_response(upstream.status, upstream.body),
        Err(e) => error_response(&e),
    }
}

// ── OIDC endpoints ────────────────────────────────────────────────

fn redirect_response(outcome: RedirectOutcome) -> Response {
    if outcome.json {
        json_response(200, json!({ "location": outcome.location }))
    } else {
        (StatusCode::FOUND, [(http::header::LOCATION, outcome.location)]).into_response()
    }
}

pub async fn oidc_redirect(State(state): State<AppState>, request: Request) -> Response {
    start_oidc_auth(state, None, request).await
}

pub async fn oidc_redirect_provider(
    State(state): State<AppState>,
    Path(provider): Path<String>,
    request: Request,
) -> Response {
    start_oidc_auth(state, Some(provider), request).await
}

async fn start_oidc_auth(state: AppState, provider: Option<String>, request: Request) -> Response {
    let Some(oidc) = &state.oidc else {
        return error_response(&UiaError::Unrecognized("SSO is not configured".to_string()));
    };
    let query = parse_query(request.uri().query().unwrap_or(""));
    let Some(redirect_url) = query.get("redirectUrl") else {
        return error_response(&UiaError::Unrecognized("Missing redirectUrl".to_string()));
    };
    let uia_session = query.get("uiaSession").cloned();

    match oidc.start_auth(provider.as_deref(), redirect_url.clone(), uia_session) {
        Ok(outcome) => redirect_response(outcome),
        Err(e) => error_response(&e),
    }
}

pub async fn oidc_callback(State(state): State<AppState>, request: Request) -> Response {
    let Some(oidc) = &state.oidc else {
        return error_response(&UiaError::Unrecognized("SSO is not configured".to_string()));
    };
    let query = parse_query(request.uri().query().unwrap_or(""));
    let Some(oidc_state) = query.get("state") else {
        return error_response(&UiaError::Unrecognized("Missing state".to_string()));
    };
    let Some(code) = query.get("code") else {
        return error_response(&UiaError::Unrecognized("Missing code".to_string()));
    };

    match oidc.handle_callback(oidc_state, code).await {
        Ok(outcome) => redirect_response(outcome),
        Err(e) => error_response(&e),
    }
}
