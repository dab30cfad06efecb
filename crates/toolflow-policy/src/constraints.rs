//! Scope constraints for applied diffs
//!
//! Checks what an edit actually touched against the run's [`Scope`] plus a
//! list of forbidden file patterns.

use serde::{Deserialize, Serialize};
use toolflow_core::Scope;

use crate::verdict::{Verdict, Violation, ViolationSeverity};

/// A file over this share of its line limit draws a warning.
const NEAR_LIMIT_RATIO: f64 = 0.8;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScopeConstraints {
    pub scope: Scope,
    /// Simple globs: `*x*`, `*x`, `x*` or an exact path.
    #[serde(default)]
    pub forbidden_patterns: Vec<String>,
    /// Warn when a diff reaches the gate without a validation report.
    #[serde(default)]
    pub must_validate: bool,
}

impl ScopeConstraints {
    pub fn from_scope(scope: Scope) -> Self {
        Self {
            scope,
            forbidden_patterns: default_forbidden_patterns(),
            must_validate: true,
        }
    }

    pub fn with_forbidden_patterns(mut self, patterns: Vec<String>) -> Self {
        self.forbidden_patterns = patterns;
        self
    }
}

pub fn default_forbidden_patterns() -> Vec<String> {
    ["*.env*", "*secrets*", "*password*", "*.pem", "*id_rsa*"]
        .iter()
        .map(|p| p.to_string())
        .collect()
}

/// One file of an applied diff.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileChange {
    pub path: String,
    pub lines_changed: u32,
    pub hunks: u32,
}

impl FileChange {
    pub fn new(path: impl Into<String>, lines_changed: u32, hunks: u32) -> Self {
        Self {
            path: path.into(),
            lines_changed,
            hunks,
        }
    }
}

/// What the edit touched, as seen by the gate.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiffMetrics {
    pub files: Vec<FileChange>,
    pub validation_passed: Option<bool>,
}

impl DiffMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_file(mut self, change: FileChange) -> Self {
        self.files.push(change);
        self
    }

    pub fn validated(mut self, passed: bool) -> Self {
        self.validation_passed = Some(passed);
        self
    }
}

/// Validates a diff against scope constraints.
pub fn validate_diff(constraints: &ScopeConstraints, metrics: &DiffMetrics) -> Verdict {
    let scope = &constraints.scope;
    let mut violations = Vec::new();
    let mut warnings = Vec::new();

    if metrics.files.len() > scope.max_files as usize {
        violations.push(Violation::new(
            "max_files_exceeded",
            "Maximum Files Exceeded",
            format!(
                "Diff touches {} files, but maximum is {}",
                metrics.files.len(),
                scope.max_files
            ),
        ));
    }

    for file in &metrics.files {
        let path = file.path.as_str();

        if file.lines_changed > scope.max_lines_per_file {
            violations.push(
                Violation::new(
                    "max_lines_exceeded",
                    "Maximum Lines Per File Exceeded",
                    format!(
                        "{} changes {} lines, but maximum is {}",
                        path, file.lines_changed, scope.max_lines_per_file
                    ),
                )
                .with_location(path),
            );
        } else if f64::from(file.lines_changed) > f64::from(scope.max_lines_per_file) * NEAR_LIMIT_RATIO {
            warnings.push(format!("{} is close to the per-file line limit", path));
        }

        if file.hunks > scope.max_hunks_per_file {
            violations.push(
                Violation::new(
                    "max_hunks_exceeded",
                    "Maximum Hunks Per File Exceeded",
                    format!(
                        "{} has {} hunks, but maximum is {}",
                        path, file.hunks, scope.max_hunks_per_file
                    ),
                )
                .with_location(path),
            );
        }

        if scope.is_excluded(path) {
            violations.push(
                Violation::new("excluded_path", "Excluded Path", format!("{} is under an excluded path", path))
                    .with_severity(ViolationSeverity::Critical)
                    .with_location(path),
            );
        } else if !scope.type_allowed(path) {
            violations.push(
                Violation::new(
                    "file_type_not_allowed",
                    "File Type Not Allowed",
                    format!("{} does not have an allowed file type", path),
                )
                .with_location(path),
            );
        }

        for pattern in &constraints.forbidden_patterns {
            if matches_pattern(path, pattern) {
                violations.push(
                    Violation::new(
                        "forbidden_file",
                        "Forbidden File Pattern",
                        format!("File '{}' matches forbidden pattern '{}'", path, pattern),
                    )
                    .with_severity(ViolationSeverity::Critical)
                    .with_location(path),
                );
            }
        }
    }

    match metrics.validation_passed {
        Some(false) => violations.push(Violation::new(
            "validation_failed",
            "Validation Failed",
            "Validation must pass before the diff is accepted",
        )),
        None if constraints.must_validate => warnings.push("Validation was not run".to_string()),
        _ => {}
    }

    if !violations.is_empty() {
        let remediation = generate_remediation(&violations, scope);
        return Verdict::block_with_remediation("Scope violations detected", violations, remediation);
    }
    if warnings.is_empty() {
        Verdict::allow()
    } else {
        Verdict::warn("Diff passed with warnings", warnings)
    }
}

fn matches_pattern(path: &str, pattern: &str) -> bool {
    let file_name = path.rsplit('/').next().unwrap_or(path);
    match (pattern.strip_prefix('*'), pattern.strip_suffix('*')) {
        (Some(rest), Some(_)) if !rest.is_empty() => {
            let middle = &rest[..rest.len() - 1];
            path.contains(middle)
        }
        (Some(suffix), _) => file_name.ends_with(suffix),
        (None, Some(prefix)) => path.starts_with(prefix),
        (None, None) => path == pattern || file_name == pattern,
    }
}

fn generate_remediation(violations: &[Violation], scope: &Scope) -> Vec<String> {
    let mut steps: Vec<String> = Vec::new();

    for violation in violations {
        let step = match violation.rule_id.as_str() {
            "max_files_exceeded" => format!("Split the change so each run touches {} or fewer files", scope.max_files),
            "max_lines_exceeded" => format!("Keep each file's edit to {} or fewer lines", scope.max_lines_per_file),
            "max_hunks_exceeded" => format!("Consolidate edits into {} or fewer hunks per file", scope.max_hunks_per_file),
            "excluded_path" => "Drop edits under excluded paths".to_string(),
            "file_type_not_allowed" => "Limit the edit to allowed file types".to_string(),
            "forbidden_file" => "Remove sensitive files from the edit".to_string(),
            "validation_failed" => "Fix validation failures before proceeding".to_string(),
            _ => continue,
        };
        if !steps.contains(&step) {
            steps.push(step);
        }
    }
    steps
}
