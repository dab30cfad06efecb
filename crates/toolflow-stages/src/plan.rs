//! Plan stage: turns the goal and the read snippets into per-file edit
//! steps, keeping only targets the run's scope allows.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use toolflow_core::{BudgetUsage, RunContext, Stage, StageError, StageId, StagePatch};

use crate::retrieval::FileSnippet;
use crate::{estimate_tokens, keys, to_value};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plan {
    pub goal: String,
    pub steps: Vec<PlanStep>,
    /// Candidate paths dropped because the scope forbids them.
    #[serde(default)]
    pub skipped: Vec<String>,
    #[serde(default)]
    pub directives: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanStep {
    pub path: String,
    pub action: String,
    pub rationale: String,
}

#[derive(Debug, Default)]
pub struct PlanStage;

impl PlanStage {
    pub fn new() -> Self {
        Self
    }
}

/// Explicit `request.paths` first, then snippet paths, without repeats.
fn candidate_paths(ctx: &RunContext) -> Vec<String> {
    let explicit = ctx
        .request()
        .get("paths")
        .and_then(|v| v.as_array())
        .into_iter()
        .flatten()
        .filter_map(|p| p.as_str())
        .map(str::to_string);
    let snippets: Vec<FileSnippet> = ctx.get_as(keys::SNIPPETS).unwrap_or_default();

    let mut seen = HashSet::new();
    explicit
        .chain(snippets.into_iter().map(|s| s.path))
        .filter(|p| seen.insert(p.clone()))
        .collect()
}

pub fn build_plan(ctx: &RunContext) -> Result<Plan, StageError> {
    let goal = ctx
        .request_str("goal")
        .map(str::trim)
        .filter(|g| !g.is_empty())
        .ok_or_else(|| StageError::InvalidInput("request.goal is required to plan".into()))?;
    let action = ctx.request_str("action").unwrap_or("modify");

    let mut plan = Plan {
        goal: goal.to_string(),
        directives: ctx.get_as(keys::DIRECTIVES).unwrap_or_default(),
        ..Plan::default()
    };
    for path in candidate_paths(ctx) {
        if !ctx.scope.permits(&path) || plan.steps.len() >= ctx.scope.max_files as usize {
            plan.skipped.push(path);
            continue;
        }
        plan.steps.push(PlanStep {
            rationale: format!("{} in {}", goal, path),
            action: action.to_string(),
            path,
        });
    }
    Ok(plan)
}

#[async_trait]
impl Stage for PlanStage {
    fn id(&self) -> StageId {
        StageId::Plan
    }

    async fn execute(&self, ctx: &RunContext) -> Result<StagePatch, StageError> {
        let plan = build_plan(ctx)?;
        let value = to_value(&plan)?;
        let tokens = estimate_tokens(&value.to_string());

        Ok(StagePatch::new()
            .data(keys::PLAN, value)
            .usage(BudgetUsage::new().with_tokens(tokens)))
    }

    fn cost_estimate(&self) -> BudgetUsage {
        BudgetUsage::new().with_tokens(1_000)
    }
}
