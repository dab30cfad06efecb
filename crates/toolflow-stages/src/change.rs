//! Edit, Validate and Gate: apply the plan, check the result, and stop the
//! run when the diff breaks the scope.

use async_trait::async_trait;
use std::sync::Arc;
use toolflow_core::{BudgetUsage, RunContext, ServiceError, Stage, StageError, StageId, StagePatch};
use toolflow_policy::{default_forbidden_patterns, validate_diff, ScopeConstraints};
use tracing::{info, warn};

use crate::collaborators::{AppliedDiff, Editor, ValidationReport, Validator};
use crate::plan::Plan;
use crate::{keys, to_value};

// ============================================================================
// EDIT
// ============================================================================

pub struct EditStage {
    editor: Arc<dyn Editor>,
}

impl EditStage {
    pub fn new(editor: Arc<dyn Editor>) -> Self {
        Self { editor }
    }
}

#[async_trait]
impl Stage for EditStage {
    fn id(&self) -> StageId {
        StageId::Edit
    }

    async fn execute(&self, ctx: &RunContext) -> Result<StagePatch, StageError> {
        let plan: Plan = ctx
            .get_as(keys::PLAN)
            .ok_or_else(|| StageError::InvalidInput("no plan to apply".into()))?;

        let diff = self.editor.apply(&plan).await?;
        Ok(StagePatch::new()
            .data(keys::DIFF, to_value(&diff)?)
            .usage(BudgetUsage::new().with_files(diff.files.len() as u64)))
    }

    /// Edits are not idempotent; only a timeout, where nothing was applied,
    /// is worth another attempt.
    fn can_retry(&self, error: &StageError) -> bool {
        matches!(error, StageError::Service(ServiceError::Timeout(_)))
    }
}

// ============================================================================
// VALIDATE
// ============================================================================

pub struct ValidateStage {
    validator: Arc<dyn Validator>,
}

impl ValidateStage {
    pub fn new(validator: Arc<dyn Validator>) -> Self {
        Self { validator }
    }
}

#[async_trait]
impl Stage for ValidateStage {
    fn id(&self) -> StageId {
        StageId::Validate
    }

    async fn execute(&self, ctx: &RunContext) -> Result<StagePatch, StageError> {
        let diff: AppliedDiff = ctx
            .get_as(keys::DIFF)
            .ok_or_else(|| StageError::InvalidInput("no diff to validate".into()))?;

        let report = self.validator.check(&diff).await?;
        if !report.passed {
            return Err(StageError::ValidationFailed(report.details.join("; ")));
        }
        Ok(StagePatch::new().data(keys::VALIDATION, to_value(&report)?))
    }
}

// ============================================================================
// GATE
// ============================================================================

/// Checks the applied diff against the run scope. A BLOCK verdict ends the
/// run early.
pub struct GateStage {
    forbidden_patterns: Vec<String>,
}

impl Default for GateStage {
    fn default() -> Self {
        Self {
            forbidden_patterns: default_forbidden_patterns(),
        }
    }
}

impl GateStage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_forbidden_patterns(mut self, patterns: Vec<String>) -> Self {
        self.forbidden_patterns = patterns;
        self
    }
}

#[async_trait]
impl Stage for GateStage {
    fn id(&self) -> StageId {
        StageId::Gate
    }

    async fn execute(&self, ctx: &RunContext) -> Result<StagePatch, StageError> {
        let diff: AppliedDiff = ctx.get_as(keys::DIFF).unwrap_or_default();
        let mut metrics = diff.metrics();
        metrics.validation_passed = ctx
            .get_as::<ValidationReport>(keys::VALIDATION)
            .map(|r| r.passed);

        let constraints = ScopeConstraints::from_scope(ctx.scope.clone())
            .with_forbidden_patterns(self.forbidden_patterns.clone());
        let verdict = validate_diff(&constraints, &metrics);
        info!(request_id = %ctx.request_id, %verdict, "scope gate evaluated");

        let patch = StagePatch::new().data(keys::VERDICT, to_value(&verdict)?);
        if verdict.is_blocked() {
            warn!(violations = verdict.violations().len(), "diff blocked by scope gate");
            return Ok(patch.stop_pipeline(verdict.to_string()));
        }
        Ok(patch)
    }
}
