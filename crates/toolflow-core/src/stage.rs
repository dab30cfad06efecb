//! Stage Trait: the single contract every pipeline stage implements
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

use crate::budget::BudgetUsage;
use crate::context::RunContext;

/// Metadata key a stage sets to `true` to end the run early (successfully).
pub const STOP_PIPELINE_KEY: &str = "stop_pipeline";

/// Stage identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum StageId {
    #[serde(rename = "AgentsMD")]
    AgentsMd,
    RepoFacts,
    Documentation,
    SemanticSearch,
    Snippet,
    Plan,
    Edit,
    Validate,
    Gate,
    Document,
    Learn,
}

/// The fixed execution order. The engine never reorders it.
pub const STAGE_ORDER: [StageId; 11] = [
    StageId::AgentsMd,
    StageId::RepoFacts,
    StageId::Documentation,
    StageId::SemanticSearch,
    StageId::Snippet,
    StageId::Plan,
    StageId::Edit,
    StageId::Validate,
    StageId::Gate,
    StageId::Document,
    StageId::Learn,
];

impl StageId {
    pub fn as_str(&self) -> &'static str {
        match self {
            StageId::AgentsMd => "AgentsMD",
            StageId::RepoFacts => "RepoFacts",
            StageId::Documentation => "Documentation",
            StageId::SemanticSearch => "SemanticSearch",
            StageId::Snippet => "Snippet",
            StageId::Plan => "Plan",
            StageId::Edit => "Edit",
            StageId::Validate => "Validate",
            StageId::Gate => "Gate",
            StageId::Document => "Document",
            StageId::Learn => "Learn",
        }
    }

    /// Position in [`STAGE_ORDER`].
    pub fn position(&self) -> usize {
        STAGE_ORDER.iter().position(|s| s == self).unwrap_or(STAGE_ORDER.len())
    }
}

impl fmt::Display for StageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for StageId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        STAGE_ORDER
            .iter()
            .find(|id| id.as_str().eq_ignore_ascii_case(s))
            .copied()
            .ok_or_else(|| format!("unknown stage: {}", s))
    }
}

/// Failure of an external collaborator call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceError {
    Timeout(String),
    RateLimited(String),
    Unavailable(String),
    /// The service understood the request and refused it.
    Rejected(String),
}

impl ServiceError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Timeout(_) | Self::RateLimited(_) | Self::Unavailable(_))
    }
}

impl fmt::Display for ServiceError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Timeout(msg) => write!(f, "timeout: {}", msg),
            Self::RateLimited(msg) => write!(f, "rate limited: {}", msg),
            Self::Unavailable(msg) => write!(f, "unavailable: {}", msg),
            Self::Rejected(msg) => write!(f, "rejected: {}", msg),
        }
    }
}

impl std::error::Error for ServiceError {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageError {
    /// A collaborator call failed.
    Service(ServiceError),
    /// The context did not hold what this stage needs.
    InvalidInput(String),
    /// A check the stage performs did not pass.
    ValidationFailed(String),
    /// Anything else that went wrong inside the stage.
    ExecutionFailed(String),
}

impl StageError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Service(e) if e.is_transient())
    }
}

impl fmt::Display for StageError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Service(e) => write!(f, "SERVICE/{}", e),
            Self::InvalidInput(msg) => write!(f, "INPUT/{}", msg),
            Self::ValidationFailed(msg) => write!(f, "VALIDATION/{}", msg),
            Self::ExecutionFailed(msg) => write!(f, "STAGE/EXEC: {}", msg),
        }
    }
}

impl std::error::Error for StageError {}

impl From<ServiceError> for StageError {
    fn from(e: ServiceError) -> Self {
        Self::Service(e)
    }
}

/// Partial context returned by a stage; shallow-merged by the engine.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StagePatch {
    pub data: BTreeMap<String, Value>,
    pub metadata: BTreeMap<String, Value>,
    /// Tokens, chunks and files the stage consumed.
    pub usage: BudgetUsage,
}

impl StagePatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn data(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }

    pub fn meta(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn usage(mut self, usage: BudgetUsage) -> Self {
        self.usage = usage;
        self
    }

    /// Ask the engine to end the run after this stage.
    pub fn stop_pipeline(self, reason: impl Into<String>) -> Self {
        self.meta(STOP_PIPELINE_KEY, true).meta("stop_reason", reason.into())
    }

    pub fn requests_stop(&self) -> bool {
        self.metadata
            .get(STOP_PIPELINE_KEY)
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }
}

/// Contract of one pipeline stage.
#[async_trait]
pub trait Stage: Send + Sync {
    /// Stable identifier; also the stage's slot in [`STAGE_ORDER`].
    fn id(&self) -> StageId;

    /// Runs the stage against a snapshot. The snapshot is borrowed
    /// immutably; everything the stage produces goes into the patch.
    async fn execute(&self, ctx: &RunContext) -> Result<StagePatch, StageError>;

    /// Whether retrying after `error` makes sense. Must be pure.
    fn can_retry(&self, error: &StageError) -> bool {
        error.is_transient()
    }

    /// Static cost declaration, used for bookkeeping only.
    fn cost_estimate(&self) -> BudgetUsage {
        BudgetUsage::default()
    }
}
