//! Engine configuration: default ceilings and retry budget
use serde::{Deserialize, Serialize};

use crate::budget::{Budget, Scope};
use crate::error::EngineError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EngineConfig {
    pub default_budget: Budget,
    pub default_scope: Scope,
    /// Retries shared by all stages of one run.
    pub max_retries: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_budget: Budget::default(),
            default_scope: Scope::default(),
            max_retries: 2,
        }
    }
}

impl EngineConfig {
    pub fn from_yaml(yaml: &str) -> Result<Self, EngineError> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        if self.default_budget.time_ms == 0 {
            return Err(EngineError::Config("defaultBudget.timeMs must be > 0".into()));
        }
        if self.default_scope.max_files == 0 {
            return Err(EngineError::Config("defaultScope.maxFiles must be > 0".into()));
        }
        Ok(())
    }
}
