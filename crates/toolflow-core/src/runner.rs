//! Pipeline Engine: runs the fixed stage order under budget and retry rules
use futures::FutureExt;
use serde_json::Value;
use std::panic::AssertUnwindSafe;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::budget::{BudgetOverride, ScopeOverride};
use crate::config::EngineConfig;
use crate::context::{RunContext, RunError};
use crate::data_model::{RunResult, StageOutcome, StageTrace, Termination};
use crate::error::EngineError;
use crate::registry::StageRegistry;
use crate::retry::{RetryDecision, RetryPolicy};
use crate::stage::{StageError, StageId, StagePatch, STAGE_ORDER};

pub struct PipelineEngine {
    registry: StageRegistry,
    config: EngineConfig,
    pipeline_id: String,
}

impl PipelineEngine {
    pub fn new(registry: StageRegistry, config: EngineConfig) -> Self {
        let pipeline_id = registry
            .ids()
            .iter()
            .map(StageId::as_str)
            .collect::<Vec<_>>()
            .join("→");

        let missing = registry.missing();
        if !missing.is_empty() {
            let names: Vec<&str> = missing.iter().map(StageId::as_str).collect();
            warn!(missing = ?names, "pipeline has unregistered stages, they will be skipped");
        }

        Self { registry, config, pipeline_id }
    }

    pub fn pipeline_id(&self) -> &str {
        &self.pipeline_id
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn registry(&self) -> &StageRegistry {
        &self.registry
    }

    /// Runs one request through the pipeline. Never fails: every outcome,
    /// including stage errors and budget exhaustion, is a [`RunResult`].
    pub async fn execute(
        &self,
        tool_name: &str,
        request: Value,
        budget_override: Option<&BudgetOverride>,
        scope_override: Option<&ScopeOverride>,
    ) -> RunResult {
        let started = Instant::now();

        let mut budget = self.config.default_budget;
        if let Some(o) = budget_override {
            budget = budget.merge(o);
        }
        let mut scope = self.config.default_scope.clone();
        if let Some(o) = scope_override {
            scope = scope.merge(o);
        }

        let mut ctx = RunContext::new(tool_name, request, budget, scope)
            .with_max_retries(self.config.max_retries);

        info!(
            request_id = %ctx.request_id,
            tool = tool_name,
            pipeline = %self.pipeline_id,
            time_budget_ms = ctx.budget.time_ms,
            "run started"
        );

        if self.registry.is_empty() {
            ctx.record_error(RunError::new("engine", EngineError::EmptyRegistry.to_string(), false));
            warn!(request_id = %ctx.request_id, "run aborted: empty stage registry");
            return RunResult::build(Termination::Misconfigured, ctx, elapsed_ms(started), Vec::new(), Vec::new());
        }

        let policy = RetryPolicy::new(ctx.max_retries);
        let mut executed = Vec::new();
        let mut traces = Vec::new();
        let mut termination = Termination::Completed;
        let mut index = 0;
        let mut attempt = 1;

        while index < STAGE_ORDER.len() {
            let id = STAGE_ORDER[index];

            let Some(stage) = self.registry.get(id) else {
                warn!(stage = %id, "no stage registered, skipping");
                index += 1;
                continue;
            };

            ctx.budget_used.time_ms = elapsed_ms(started);
            if let Some(resource) = ctx.budget.exhausted_by(&ctx.budget_used) {
                warn!(
                    request_id = %ctx.request_id,
                    stage = %id,
                    %resource,
                    "budget exhausted, not scheduling further stages"
                );
                ctx.record_error(
                    RunError::new(id.as_str(), format!("{} budget exhausted before stage", resource), false)
                        .with_attempt(attempt),
                );
                termination = Termination::BudgetExhausted { resource, next_stage: id };
                break;
            }

            debug!(stage = %id, attempt, "stage started");
            let stage_started = Instant::now();
            let result = run_guarded(stage.as_ref(), &ctx).await;
            let stage_ms = elapsed_ms(stage_started);

            match result {
                Ok(patch) => {
                    ctx = ctx.merged(&patch);
                    ctx.budget_used.time_ms = elapsed_ms(started);
                    executed.push(id);
                    traces.push(StageTrace {
                        stage: id,
                        attempt,
                        elapsed_ms: stage_ms,
                        estimated: stage.cost_estimate(),
                        reported: patch.usage,
                        outcome: StageOutcome::Ok,
                        data_hash: ctx.data_hash(),
                    });
                    debug!(stage = %id, elapsed_ms = stage_ms, tokens = patch.usage.tokens, "stage finished");

                    if patch.requests_stop() {
                        let reason = patch
                            .metadata
                            .get("stop_reason")
                            .and_then(Value::as_str)
                            .map(str::to_string);
                        info!(stage = %id, reason = ?reason, "stage requested early stop");
                        termination = Termination::EarlyStop { stage: id, reason };
                        break;
                    }

                    index += 1;
                    attempt = 1;
                }
                Err(error) => {
                    let retryable = stage.can_retry(&error);
                    ctx.record_error(
                        RunError::new(id.as_str(), error.to_string(), retryable).with_attempt(attempt),
                    );

                    let decision = policy.decide(ctx.retry_count, retryable);
                    traces.push(StageTrace {
                        stage: id,
                        attempt,
                        elapsed_ms: stage_ms,
                        estimated: stage.cost_estimate(),
                        reported: Default::default(),
                        outcome: match decision {
                            RetryDecision::Retry => StageOutcome::Retried,
                            RetryDecision::Stop => StageOutcome::Failed,
                        },
                        data_hash: ctx.data_hash(),
                    });

                    match decision {
                        RetryDecision::Retry => {
                            ctx.retry_count += 1;
                            attempt += 1;
                            warn!(
                                stage = %id,
                                error = %error,
                                retry = ctx.retry_count,
                                max_retries = ctx.max_retries,
                                "stage failed, retrying"
                            );
                        }
                        RetryDecision::Stop => {
                            warn!(stage = %id, error = %error, retryable, "stage failed, stopping run");
                            termination = Termination::StageFailed { stage: id };
                            break;
                        }
                    }
                }
            }
        }

        let execution_time_ms = elapsed_ms(started);
        let result = RunResult::build(termination, ctx, execution_time_ms, executed, traces);
        info!(
            request_id = %result.final_context.request_id,
            success = result.success,
            stages = result.stages_executed.len(),
            errors = result.errors.len(),
            execution_time_ms,
            "run finished"
        );
        result
    }
}

/// Executes a stage, turning a panic into a non-retryable stage error.
async fn run_guarded(
    stage: &dyn crate::stage::Stage,
    ctx: &RunContext,
) -> Result<StagePatch, StageError> {
    match AssertUnwindSafe(stage.execute(ctx)).catch_unwind().await {
        Ok(result) => result,
        Err(_) => Err(StageError::ExecutionFailed(format!("stage {} panicked", stage.id()))),
    }
}

fn elapsed_ms(since: Instant) -> u64 {
    u64::try_from(since.elapsed().as_millis()).unwrap_or(u64::MAX)
}
