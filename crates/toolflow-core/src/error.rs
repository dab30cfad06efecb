//! Unified Error Model
use thiserror::Error;

use crate::stage::StageId;

/// Structural failures of the engine itself. Stage failures never surface
/// here; they are recorded in the run's error list instead.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("REGISTRY/empty: no stages registered")]
    EmptyRegistry,

    #[error("REGISTRY/duplicate: stage {0} registered twice")]
    DuplicateStage(StageId),

    #[error("CONFIG/{0}")]
    Config(String),

    #[error("CONFIG/yaml: {0}")]
    Yaml(#[from] serde_yaml::Error),
}
