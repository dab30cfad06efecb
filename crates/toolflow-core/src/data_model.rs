//! Data Model: RunResult, Termination, StageTrace
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::budget::{BudgetResource, BudgetUsage};
use crate::context::{RunContext, RunError};
use crate::stage::StageId;

/// Why the stage loop ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Termination {
    /// Every registered stage ran.
    Completed,
    /// A stage asked the pipeline to stop.
    EarlyStop { stage: StageId, reason: Option<String> },
    /// A ceiling was reached before `next_stage` could be scheduled.
    BudgetExhausted { resource: BudgetResource, next_stage: StageId },
    /// A stage failed and the retry policy declined to try again.
    StageFailed { stage: StageId },
    /// The engine could not run at all.
    Misconfigured,
}

impl Termination {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Completed | Self::EarlyStop { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageOutcome {
    Ok,
    Retried,
    Failed,
}

/// Bookkeeping for one stage attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageTrace {
    pub stage: StageId,
    pub attempt: u32,
    pub elapsed_ms: u64,
    /// What the stage declared up front.
    pub estimated: BudgetUsage,
    /// What the stage reported after running. Zero on failure.
    pub reported: BudgetUsage,
    pub outcome: StageOutcome,
    /// Digest of the context data after this attempt.
    pub data_hash: String,
}

/// Outcome of one pipeline execution. Built once, never mutated.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunResult {
    pub success: bool,
    pub termination: Termination,
    pub data: BTreeMap<String, Value>,
    pub final_context: RunContext,
    pub execution_time_ms: u64,
    pub stages_executed: Vec<StageId>,
    pub stage_traces: Vec<StageTrace>,
    pub errors: Vec<RunError>,
    pub budget_used: BudgetUsage,
}

impl RunResult {
    pub(crate) fn build(
        termination: Termination,
        context: RunContext,
        execution_time_ms: u64,
        stages_executed: Vec<StageId>,
        stage_traces: Vec<StageTrace>,
    ) -> Self {
        let mut budget_used = context.budget_used;
        budget_used.time_ms = execution_time_ms;
        Self {
            success: termination.is_success(),
            termination,
            data: context.data.clone(),
            errors: context.errors.clone(),
            final_context: context,
            execution_time_ms,
            stages_executed,
            stage_traces,
            budget_used,
        }
    }

    pub fn ran(&self, stage: StageId) -> bool {
        self.stages_executed.contains(&stage)
    }
}
