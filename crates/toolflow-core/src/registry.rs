//! Stage Registry: explicit StageId → Stage table, built once and injected
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::EngineError;
use crate::stage::{Stage, StageId, STAGE_ORDER};

#[derive(Default, Clone)]
pub struct StageRegistry {
    stages: HashMap<StageId, Arc<dyn Stage>>,
}

impl StageRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a stage under its own id. Each id may be registered once.
    pub fn register(&mut self, stage: Arc<dyn Stage>) -> Result<(), EngineError> {
        let id = stage.id();
        if self.stages.contains_key(&id) {
            return Err(EngineError::DuplicateStage(id));
        }
        self.stages.insert(id, stage);
        Ok(())
    }

    /// Builder form of [`register`](Self::register).
    pub fn with_stage(mut self, stage: impl Stage + 'static) -> Result<Self, EngineError> {
        self.register(Arc::new(stage))?;
        Ok(self)
    }

    pub fn get(&self, id: StageId) -> Option<&Arc<dyn Stage>> {
        self.stages.get(&id)
    }

    /// Registered ids, in pipeline order.
    pub fn ids(&self) -> Vec<StageId> {
        STAGE_ORDER
            .iter()
            .filter(|id| self.stages.contains_key(id))
            .copied()
            .collect()
    }

    /// Pipeline order ids with no registered stage.
    pub fn missing(&self) -> Vec<StageId> {
        STAGE_ORDER
            .iter()
            .filter(|id| !self.stages.contains_key(id))
            .copied()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }
}

impl std::fmt::Debug for StageRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageRegistry").field("stages", &self.ids()).finish()
    }
}
