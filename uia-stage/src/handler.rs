use crate::registry::StageSet;
use crate::stage::{AuthResponse, STAGE_SSO, TYPE_LOGIN_TOKEN};
use serde_json::{Map, Value, json};
use std::collections::{HashMap, HashSet};
use tracing::debug;
use uia_core::config::FlowConfig;
use uia_core::{Endpoint, Session, SessionStore, UiaError};

/// What the webserver should do after UIA processing.
#[derive(Debug)]
pub enum UiaOutcome {
    /// Some flow is fully completed; run the real endpoint handler with
    /// this session.
    Complete(Session),

    /// Answer the client with this status and body (UIA progress or stage
    /// failure).
    Respond { status: u16, body: Value },
}

/// Per-endpoint UIA orchestrator: drives sessions through the configured
/// flows, one stage per request.
pub struct StageHandler {
    endpoint: Endpoint,
    flows: Vec<Vec<String>>,
    stages: StageSet,
    aliases: HashMap<String, String>,
    store: SessionStore,
}

impl StageHandler {
    pub fn new(
        endpoint: Endpoint,
        flows: &[FlowConfig],
        stages: StageSet,
        aliases: HashMap<String, String>,
        store: SessionStore,
    ) -> anyhow::Result<Self> {
        if flows.is_empty() {
            anyhow::bail!("uia.{endpoint}: at least one flow required");
        }
        for flow in flows {
            for stage_type in &flow.stages {
                if !stages.contains(stage_type) {
                    anyhow::bail!("uia.{endpoint}: flow references unregistered stage '{stage_type}'");
                }
            }
        }
        for target in aliases.values() {
            if !stages.contains(target) {
                anyhow::bail!("uia.{endpoint}: alias targets unregistered stage '{target}'");
            }
        }
        Ok(Self {
            endpoint,
            flows: flows.iter().map(|flow| flow.stages.clone()).collect(),
            stages,
            aliases,
            store,
        })
    }

    /// Translate a requested `auth.type` to the configured stage type.
    fn resolve(&self, requested: &str) -> String {
        if requested == TYPE_LOGIN_TOKEN {
            return STAGE_SSO.to_string();
        }
        self.aliases
            .get(requested)
            .cloned()
            .unwrap_or_else(|| requested.to_string())
    }

    /// The configured flows with this session's inactive stages filtered
    /// out. Newly inactive stages are recorded on the session.
    pub async fn get_flows(&self, session: &mut Session) -> Vec<Vec<String>> {
        for flow in &self.flows {
            for stage_type in flow {
                if session.skipped_stages.contains(stage_type) {
                    continue;
                }
                if let Some(stage) = self.stages.get(stage_type) {
                    if !stage.is_active(&session.data).await {
                        debug!(session = %session.id, stage = %stage_type, "Stage inactive, skipping");
                        session.skipped_stages.insert(stage_type.clone());
                    }
                }
            }
        }
        self.flows
            .iter()
            .map(|flow| {
                flow.iter()
                    .filter(|stage_type| !session.skipped_stages.contains(*stage_type))
                    .cloned()
                    .collect()
            })
            .collect()
    }

    /// Stage type → params for every stage that exposes parameters,
    /// memoized on the session.
    pub async fn get_params(&self, session: &mut Session) -> Map<String, Value> {
        let mut out = Map::new();
        for stage_type in self.stages.types() {
            if let Some(cached) = session.params.get(stage_type) {
                out.insert(stage_type.to_string(), cached.clone());
                continue;
            }
            let Some(stage) = self.stages.get(stage_type) else {
                continue;
            };
            if let Some(params) = stage.params(&session.data).await {
                session.params.insert(stage_type.to_string(), params.clone());
                out.insert(stage_type.to_string(), params);
            }
        }
        out
    }

    /// True iff `completed` equals some flow exactly, skipped stages
    /// removed.
    pub fn are_stages_complete(&self, session: &Session) -> bool {
        self.flows.iter().any(|flow| {
            let active: Vec<&String> = flow
                .iter()
                .filter(|stage_type| !session.skipped_stages.contains(*stage_type))
                .collect();
            active.len() == session.completed.len()
                && active.iter().zip(&session.completed).all(|(a, b)| *a == b)
        })
    }

    /// Stage types any flow permits as the immediate next step.
    pub fn get_next_stages(&self, session: &Session) -> HashSet<String> {
        let mut next = HashSet::new();
        for flow in &self.flows {
            let active: Vec<&String> = flow
                .iter()
                .filter(|stage_type| !session.skipped_stages.contains(*stage_type))
                .collect();
            let done = session.completed.len();
            let is_prefix = done <= active.len()
                && active.iter().take(done).zip(&session.completed).all(|(a, b)| *a == b);
            if is_prefix {
                if let Some(stage_type) = active.get(done) {
                    next.insert((*stage_type).to_string());
                }
            }
        }
        next
    }

    /// Run one stage's `auth` and fold a success into the session.
    pub async fn challenge_state(
        &self,
        stage_type: &str,
        session: &mut Session,
        auth: &Value,
    ) -> AuthResponse {
        let Some(stage) = self.stages.get(stage_type) else {
            return AuthResponse::failure("M_BAD_JSON", format!("Unknown stage '{stage_type}'"));
        };
        let params = match session.params.get(stage_type) {
            Some(cached) => Some(cached.clone()),
            None => match stage.params(&session.data).await {
                Some(params) => {
                    session.params.insert(stage_type.to_string(), params.clone());
                    Some(params)
                }
                None => None,
            },
        };
        let response = stage.auth(auth, params.as_ref()).await;
        if let AuthResponse::Success { data } = &response {
            session.data.merge(data);
            if !session.completed.iter().any(|t| t == stage_type) {
                session.completed.push(stage_type.to_string());
            }
            debug!(session = %session.id, stage = %stage_type, "Stage completed");
        }
        response
    }

    /// The middleware protocol: resolve the session, dispatch one stage,
    /// and either finish or answer with UIA progress.
    pub async fn handle(&self, body: &Value) -> Result<UiaOutcome, UiaError> {
        let auth = body.get("auth");

        let mut session = match auth.and_then(|a| a.get("session")).and_then(Value::as_str) {
            Some(id) => match self.store.get(id) {
                Some(session) if session.endpoint == self.endpoint => session,
                _ => return Err(UiaError::Unrecognized("Unknown session".to_string())),
            },
            None => self.store.create(self.endpoint),
        };

        let requested = auth.and_then(|a| a.get("type")).and_then(Value::as_str);
        let (Some(auth), Some(requested)) = (auth, requested) else {
            let body = self.progress_body(&mut session, None).await;
            self.persist(session);
            return Ok(UiaOutcome::Respond { status: 401, body });
        };

        let canonical = self.resolve(requested);
        if !self.stages.contains(&canonical) {
            return Err(UiaError::BadJson(format!("Unknown auth type '{requested}'")));
        }
        // Record inactive stages before deciding what may run next.
        self.get_flows(&mut session).await;
        if !self.get_next_stages(&session).contains(&canonical) {
            return Err(UiaError::BadJson(format!(
                "Auth type '{requested}' is not permitted at this point"
            )));
        }

        match self.challenge_state(&canonical, &mut session, auth).await {
            AuthResponse::Failure { errcode, error } => {
                debug!(session = %session.id, stage = %canonical, errcode, "Stage failed");
                let body = self.progress_body(&mut session, Some((errcode, &error))).await;
                self.persist(session);
                Ok(UiaOutcome::Respond { status: 401, body })
            }
            AuthResponse::Success { .. } => {
                if self.are_stages_complete(&session) {
                    self.persist(session.clone());
                    Ok(UiaOutcome::Complete(session))
                } else {
                    let body = self.progress_body(&mut session, None).await;
                    self.persist(session);
                    Ok(UiaOutcome::Respond { status: 401, body })
                }
            }
        }
    }

    /// The UIA progress envelope: `{session, flows, params, completed?}`
    /// plus the failing stage's error, if any.
    async fn progress_body(
        &self,
        session: &mut Session,
        failure: Option<(&'static str, &str)>,
    ) -> Value {
        let flows = self.get_flows(session).await;
        let params = self.get_params(session).await;
        let mut body = json!({
            "session": session.id,
            "flows": flows
                .into_iter()
                .map(|stages| json!({ "stages": stages }))
                .collect::<Vec<_>>(),
            "params": Value::Object(params),
        });
        if !session.completed.is_empty() {
            body["completed"] = json!(session.completed);
        }
        if let Some((errcode, error)) = failure {
            body["errcode"] = json!(errcode);
            body["error"] = json!(error);
        }
        body
    }

    fn persist(&self, session: Session) {
        if !self.store.save(session) {
            debug!("Session expired before save");
        }
    }
}
