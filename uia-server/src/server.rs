use crate::api;
use crate::homeserver::HomeserverClient;
use crate::middleware::RateLimiter;
use crate::token::TokenMinter;
use axum::Router;
use axum::routing::{delete, get, post};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::info;
use uia_core::config::UiaConfig;
use uia_core::{Endpoint, SessionStore};
use uia_oidc::{OidcCoordinator, SsoConfig};
use uia_provider::{PasswordProvider, build_providers};
use uia_stage::{STAGE_PASSWORD, STAGE_SSO, StageHandler};
use uia_stages::{StageContext, build_handler};
use uia_store::{SledStore, UsernameMapper};

/// Shared state for the UIA webserver.
#[derive(Clone)]
pub struct AppState {
    pub store: SessionStore,
    pub handlers: Arc<HashMap<Endpoint, StageHandler>>,
    pub limiters: Arc<HashMap<Endpoint, RateLimiter>>,
    /// Providers eligible for password changes on the password endpoint.
    pub change_providers: Arc<Vec<Arc<dyn PasswordProvider>>>,
    pub minter: Arc<TokenMinter>,
    pub homeserver: Arc<HomeserverClient>,
    pub oidc: Option<Arc<OidcCoordinator>>,
}

/// The SSO stage config of the first endpoint that carries one; the OIDC
/// coordinator is process-wide.
fn find_sso_config(config: &UiaConfig) -> anyhow::Result<Option<SsoConfig>> {
    for (endpoint, endpoint_config) in config.uia.configured() {
        if let Some(raw) = endpoint_config.stages.get(STAGE_SSO) {
            let sso: SsoConfig = serde_json::from_value(raw.clone())
                .map_err(|e| anyhow::anyhow!("uia.{endpoint}: sso stage config error: {e}"))?;
            return Ok(Some(sso));
        }
    }
    Ok(None)
}

/// Wire up stores, providers, stages, and upstream clients from config.
pub async fn build_state(config: &UiaConfig) -> anyhow::Result<AppState> {
    let store = SessionStore::with_sweeper(config.session.timeout());

    let kv = SledStore::open(&config.username_mapper.folder)?;
    let mapper = Arc::new(UsernameMapper::new(&config.username_mapper, Arc::new(kv))?);

    let oidc = match find_sso_config(config)? {
        Some(sso) => Some(Arc::new(
            OidcCoordinator::init(sso, &config.webserver.public_baseurl()).await?,
        )),
        None => None,
    };

    let ctx = StageContext {
        homeserver_domain: config.homeserver.domain.clone(),
        mapper: Arc::clone(&mapper),
        oidc: oidc.clone(),
    };

    let mut handlers = HashMap::new();
    let mut limiters = HashMap::new();
    for (endpoint, endpoint_config) in config.uia.configured() {
        handlers.insert(
            endpoint,
            build_handler(endpoint, endpoint_config, &ctx, store.clone())?,
        );
        limiters.insert(endpoint, RateLimiter::new(&endpoint_config.rate_limit));
        info!(endpoint = %endpoint, flows = endpoint_config.flows.len(), "UIA endpoint configured");
    }

    let change_providers = config
        .uia
        .password
        .as_ref()
        .and_then(|endpoint_config| endpoint_config.stages.get(STAGE_PASSWORD))
        .and_then(|stage_config| stage_config.get("passwordProviders"))
        .map(|providers| build_providers(providers, Arc::clone(&mapper)))
        .transpose()?
        .unwrap_or_default();

    Ok(AppState {
        store,
        handlers: Arc::new(handlers),
        limiters: Arc::new(limiters),
        change_providers: Arc::new(change_providers),
        minter: Arc::new(TokenMinter::new(&config.homeserver.token)?),
        homeserver: Arc::new(HomeserverClient::new(&config.homeserver)?),
        oidc,
    })
}

/// Build the public router: UIA endpoints, OIDC endpoints, health.
pub fn build_router(state: AppState) -> Router {
    let mut router = Router::new().route("/health", get(api::health));

    if state.handlers.contains_key(&Endpoint::Login) {
        router = router.route("/_matrix/client/r0/login", post(api::login));
    }
    if state.handlers.contains_key(&Endpoint::Password) {
        router = router.route("/_matrix/client/r0/account/password", post(api::password));
    }
    if state.handlers.contains_key(&Endpoint::DeleteDevice) {
        router = router.route(
            "/_matrix/client/r0/devices/{device_id}",
            delete(api::delete_device),
        );
    }
    if state.handlers.contains_key(&Endpoint::DeleteDevices) {
        router = router.route("/_matrix/client/r0/delete_devices", post(api::delete_devices));
    }
    if state.handlers.contains_key(&Endpoint::UploadDeviceSigningKeys) {
        router = router.route(
            "/_matrix/client/r0/keys/device_signing/upload",
            post(api::upload_device_signing_keys),
        );
    }

    if let Some(oidc) = &state.oidc {
        router = router
            .route(oidc.redirect_path(), get(api::oidc_redirect))
            .route(
                &format!("{}/{{provider}}", oidc.redirect_path()),
                get(api::oidc_redirect_provider),
            )
            .route(oidc.callback_path(), get(api::oidc_callback));
        info!(
            redirect = oidc.redirect_path(),
            callback = oidc.callback_path(),
            "OIDC endpoints mounted"
        );
    }

    router.with_state(state)
}

/// Bind and serve until SIGINT/SIGTERM.
pub async fn serve(config: UiaConfig) -> anyhow::Result<()> {
    let state = build_state(&config).await?;
    let app = build_router(state);

    let addr = format!("{}:{}", config.webserver.host, config.webserver.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(addr = %addr, "UIA proxy listening");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("Shutdown signal received, stopping");
}
