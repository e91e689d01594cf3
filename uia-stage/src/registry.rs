use crate::stage::Stage;
use std::collections::HashMap;
use std::sync::Arc;

/// Stage instances for one endpoint, keyed by stage type.
///
/// Built once at startup from the endpoint's config, immutable thereafter.
pub struct StageSet {
    stages: HashMap<String, Arc<dyn Stage>>,
}

impl StageSet {
    pub fn new() -> Self {
        Self { stages: HashMap::new() }
    }

    pub fn register(&mut self, stage: Arc<dyn Stage>) {
        let stage_type = stage.stage_type().to_string();
        tracing::debug!(stage = %stage_type, "Registered stage");
        self.stages.insert(stage_type, stage);
    }

    pub fn get(&self, stage_type: &str) -> Option<&Arc<dyn Stage>> {
        self.stages.get(stage_type)
    }

    pub fn contains(&self, stage_type: &str) -> bool {
        self.stages.contains_key(stage_type)
    }

    pub fn types(&self) -> Vec<&str> {
        self.stages.keys().map(String::as_str).collect()
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }
}

impl Default for StageSet {
    fn default() -> Self {
        Self::new()
    }
}
