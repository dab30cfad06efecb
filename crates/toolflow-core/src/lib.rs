//! toolflow core: Stage trait, Pipeline Engine, and the run data model
//!
//! A request runs through a fixed, ordered list of stages. The engine checks
//! the run's budget before scheduling each stage, merges every stage's patch
//! into a fresh context, and retries failed stages in place while the shared
//! retry budget lasts.
//!
//! ```text
//! AgentsMD → RepoFacts → Documentation → SemanticSearch → Snippet
//!   → Plan → Edit → Validate → Gate → Document → Learn
//! ```

pub mod budget;
pub mod config;
pub mod context;
pub mod data_model;
pub mod error;
pub mod registry;
pub mod retry;
pub mod runner;
pub mod stage;

pub use budget::{Budget, BudgetOverride, BudgetResource, BudgetUsage, Scope, ScopeOverride};
pub use config::EngineConfig;
pub use context::{RunContext, RunError};
pub use data_model::{RunResult, StageOutcome, StageTrace, Termination};
pub use error::EngineError;
pub use registry::StageRegistry;
pub use retry::{RetryDecision, RetryPolicy};
pub use runner::PipelineEngine;
pub use stage::{ServiceError, Stage, StageError, StageId, StagePatch, STAGE_ORDER, STOP_PIPELINE_KEY};

/// Engine version
pub const TOOLFLOW_VERSION: &str = "1.0.0";
