use crate::cache::{DEFAULT_SWEEP_INTERVAL, TimedCache};
use rand::Rng;
use rand::distributions::Alphanumeric;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Length of generated session identifiers.
pub const SESSION_ID_LENGTH: usize = 20;

/// The UIA-capable endpoints this proxy terminates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Endpoint {
    Login,
    Password,
    DeleteDevice,
    DeleteDevices,
    UploadDeviceSigningKeys,
}

impl Endpoint {
    pub fn as_str(&self) -> &'static str {
        match self {
            Endpoint::Login => "login",
            Endpoint::Password => "password",
            Endpoint::DeleteDevice => "deleteDevice",
            Endpoint::DeleteDevices => "deleteDevices",
            Endpoint::UploadDeviceSigningKeys => "uploadDeviceSigningKeys",
        }
    }

    pub fn all() -> &'static [Endpoint] {
        &[
            Endpoint::Login,
            Endpoint::Password,
            Endpoint::DeleteDevice,
            Endpoint::DeleteDevices,
            Endpoint::UploadDeviceSigningKeys,
        ]
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Attributes accumulated while the user passes stages.
///
/// Stages return a delta of these; the stage handler merges the delta into
/// the session on success.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionData {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub displayname: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub admin: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password_provider: Option<String>,
}

impl SessionData {
    /// Merge `other` into `self`; set fields win over unset ones.
    pub fn merge(&mut self, other: &SessionData) {
        if other.username.is_some() {
            self.username = other.username.clone();
        }
        if other.password.is_some() {
            self.password = other.password.clone();
        }
        if other.displayname.is_some() {
            self.displayname = other.displayname.clone();
        }
        if other.admin.is_some() {
            self.admin = other.admin;
        }
        if other.password_provider.is_some() {
            self.password_provider = other.password_provider.clone();
        }
    }
}

/// Per-session UIA state. Mutated only through [`SessionStore::save`].
#[derive(Debug, Clone)]
pub struct Session {
    pub id: String,
    pub endpoint: Endpoint,
    /// Stage type → params object, cached at first computation.
    pub params: HashMap<String, serde_json::Value>,
    pub data: SessionData,
    /// Stage types the user has passed, in order.
    pub completed: Vec<String>,
    /// Stage types deemed inactive for this session.
    pub skipped_stages: HashSet<String>,
}

impl Session {
    fn new(id: String, endpoint: Endpoint) -> Self {
        Self {
            id,
            endpoint,
            params: HashMap::new(),
            data: SessionData::default(),
            completed: Vec::new(),
            skipped_stages: HashSet::new(),
        }
    }
}

/// Allocates random session IDs and holds per-session state with a bounded
/// lifetime. A session expires `timeout` after its last save.
#[derive(Clone)]
pub struct SessionStore {
    sessions: Arc<TimedCache<String, Session>>,
}

impl SessionStore {
    pub fn new(timeout: Duration) -> Self {
        Self { sessions: TimedCache::new(timeout) }
    }

    /// Create a store whose expiry sweeper runs on the current runtime.
    pub fn with_sweeper(timeout: Duration) -> Self {
        Self { sessions: TimedCache::with_sweeper(timeout, DEFAULT_SWEEP_INTERVAL) }
    }

    fn random_id() -> String {
        rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(SESSION_ID_LENGTH)
            .map(char::from)
            .collect()
    }

    /// Allocate a blank session bound to `endpoint`. Retries ID generation
    /// on the (cosmically unlikely) collision.
    pub fn create(&self, endpoint: Endpoint) -> Session {
        let id = loop {
            let candidate = Self::random_id();
            if !self.sessions.has(&candidate) {
                break candidate;
            }
        };
        let session = Session::new(id.clone(), endpoint);
        self.sessions.set(id, session.clone());
        debug!(session = %session.id, endpoint = %endpoint, "Created UIA session");
        session
    }

    /// Live session for `id`, or None if unknown or expired.
    pub fn get(&self, id: &str) -> Option<Session> {
        self.sessions.get(&id.to_string())
    }

    /// Persist a mutated session. Returns false when the session has
    /// expired in the meantime; an expired session is never resurrected.
    pub fn save(&self, session: Session) -> bool {
        self.sessions.set_if_present(session.id.clone(), session)
    }
}
