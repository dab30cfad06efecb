//! Document and Learn: summarize the run, then hand its pattern to the
//! lesson store without waiting for it.

use async_trait::async_trait;
use std::fmt::Write as _;
use std::sync::Arc;
use toolflow_core::{RunContext, Stage, StageError, StageId, StagePatch};
use toolflow_policy::Verdict;
use tracing::{debug, warn};

use crate::collaborators::{AppliedDiff, LessonPattern, LessonStore};
use crate::docs::FrameworkDocs;
use crate::plan::Plan;
use crate::keys;

// ============================================================================
// DOCUMENT
// ============================================================================

#[derive(Debug, Default)]
pub struct DocumentStage;

impl DocumentStage {
    pub fn new() -> Self {
        Self
    }
}

/// Markdown summary of what the run found and changed.
pub fn render_summary(ctx: &RunContext) -> String {
    let mut out = String::new();
    let goal = ctx.request_str("goal").unwrap_or("(no goal)");
    let _ = writeln!(out, "## {}: {}\n", ctx.tool_name, goal);

    let directives: Vec<String> = ctx.get_as(keys::DIRECTIVES).unwrap_or_default();
    if !directives.is_empty() {
        let _ = writeln!(out, "### Directives\n");
        for directive in &directives {
            let _ = writeln!(out, "- {}", directive);
        }
        out.push('\n');
    }

    let docs: Vec<FrameworkDocs> = ctx.get_as(keys::DOCUMENTATION).unwrap_or_default();
    if !docs.is_empty() {
        let names: Vec<&str> = docs.iter().map(|d| d.framework.as_str()).collect();
        let _ = writeln!(out, "Documentation consulted: {}\n", names.join(", "));
    }

    if let Some(plan) = ctx.get_as::<Plan>(keys::PLAN) {
        let _ = writeln!(out, "### Plan\n");
        for step in &plan.steps {
            let _ = writeln!(out, "- {} `{}`", step.action, step.path);
        }
        if !plan.skipped.is_empty() {
            let _ = writeln!(out, "- skipped (out of scope): {}", plan.skipped.join(", "));
        }
        out.push('\n');
    }

    if let Some(diff) = ctx.get_as::<AppliedDiff>(keys::DIFF) {
        let _ = writeln!(out, "### Changes\n");
        if !diff.summary.is_empty() {
            let _ = writeln!(out, "{}\n", diff.summary);
        }
        for file in &diff.files {
            let _ = writeln!(
                out,
                "- `{}`: {} lines in {} hunks",
                file.path, file.lines_changed, file.hunks
            );
        }
        out.push('\n');
    }

    if let Some(verdict) = ctx.get_as::<Verdict>(keys::VERDICT) {
        let _ = writeln!(out, "Gate: {}", verdict);
    }
    if !ctx.errors.is_empty() {
        let _ = writeln!(out, "Recovered errors: {}", ctx.errors.len());
    }
    out
}

#[async_trait]
impl Stage for DocumentStage {
    fn id(&self) -> StageId {
        StageId::Document
    }

    async fn execute(&self, ctx: &RunContext) -> Result<StagePatch, StageError> {
        Ok(StagePatch::new().data(keys::SUMMARY, render_summary(ctx)))
    }
}

// ============================================================================
// LEARN
// ============================================================================

pub struct LearnStage {
    store: Arc<dyn LessonStore>,
}

impl LearnStage {
    pub fn new(store: Arc<dyn LessonStore>) -> Self {
        Self { store }
    }
}

fn lesson_pattern(ctx: &RunContext) -> LessonPattern {
    let diff: AppliedDiff = ctx.get_as(keys::DIFF).unwrap_or_default();
    let outcome = match ctx.get_as::<Verdict>(keys::VERDICT) {
        Some(verdict) => verdict.severity(),
        None => toolflow_policy::VerdictSeverity::Allow,
    };
    LessonPattern {
        tool_name: ctx.tool_name.clone(),
        request_id: ctx.request_id.clone(),
        goal: ctx.request_str("goal").unwrap_or_default().to_string(),
        files: diff.files.into_iter().map(|f| f.path).collect(),
        outcome: outcome.as_str().to_string(),
    }
}

#[async_trait]
impl Stage for LearnStage {
    fn id(&self) -> StageId {
        StageId::Learn
    }

    /// Queues the lesson and returns at once; store failures are only
    /// logged.
    async fn execute(&self, ctx: &RunContext) -> Result<StagePatch, StageError> {
        let pattern = lesson_pattern(ctx);
        let store = Arc::clone(&self.store);
        let request_id = pattern.request_id.clone();

        tokio::spawn(async move {
            match store.record(&pattern).await {
                Ok(id) => debug!(%request_id, lesson_id = %id, "lesson recorded"),
                Err(err) => warn!(%request_id, %err, "failed to record lesson"),
            }
        });

        Ok(StagePatch::new().data(keys::LESSON_QUEUED, true))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use toolflow_core::{Budget, Scope};

    #[test]
    fn test_summary_lists_plan_and_changes() {
        let plan = Plan {
            goal: "fix divide".into(),
            steps: vec![crate::plan::PlanStep {
                path: "src/lib.rs".into(),
                action: "modify".into(),
                rationale: "fix divide in src/lib.rs".into(),
            }],
            ..Plan::default()
        };
        let diff = AppliedDiff {
            summary: "guard zero divisor".into(),
            files: vec![crate::collaborators::FileDiff {
                path: "src/lib.rs".into(),
                hunks: 1,
                lines_changed: 4,
            }],
        };
        let ctx = RunContext::new("edit", json!({"goal": "fix divide"}), Budget::default(), Scope::default())
            .merged(
                &StagePatch::new()
                    .data(keys::PLAN, serde_json::to_value(&plan).unwrap())
                    .data(keys::DIFF, serde_json::to_value(&diff).unwrap())
                    .data(keys::VERDICT, serde_json::to_value(Verdict::allow()).unwrap()),
            );

        let summary = render_summary(&ctx);
        assert!(summary.starts_with("## edit: fix divide"));
        assert!(summary.contains("- modify `src/lib.rs`"));
        assert!(summary.contains("- `src/lib.rs`: 4 lines in 1 hunks"));
        assert!(summary.contains("Gate: ALLOW"));
    }

    #[test]
    fn test_lesson_pattern_outcome_names_blocked_verdict() {
        let verdict = Verdict::block("Too many files", vec![]);
        let ctx = RunContext::new("edit", json!({"goal": "g"}), Budget::default(), Scope::default())
            .merged(&StagePatch::new().data(keys::VERDICT, serde_json::to_value(&verdict).unwrap()));
        assert_eq!(lesson_pattern(&ctx).outcome, "block");
    }

    #[test]
    fn test_lesson_pattern_outcome() {
        let ctx = RunContext::new("edit", json!({"goal": "g"}), Budget::default(), Scope::default());
        let pattern = lesson_pattern(&ctx);
        assert_eq!(pattern.outcome, "allow");
        assert_eq!(pattern.goal, "g");
        assert!(pattern.files.is_empty());
    }
}
