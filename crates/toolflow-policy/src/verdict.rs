//! Gate verdicts: ALLOW, WARN or BLOCK with violations and remediation.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Outcome of checking an applied diff against the run scope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Verdict {
    Allow,

    /// The diff may proceed; the warnings travel with the run result.
    Warn { message: String, warnings: Vec<String> },

    /// The diff must not proceed.
    Block {
        reason: String,
        violations: Vec<Violation>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        remediation: Vec<String>,
    },
}

impl Verdict {
    pub fn allow() -> Self {
        Verdict::Allow
    }

    pub fn warn(message: impl Into<String>, warnings: Vec<String>) -> Self {
        Verdict::Warn {
            message: message.into(),
            warnings,
        }
    }

    pub fn block(reason: impl Into<String>, violations: Vec<Violation>) -> Self {
        Self::block_with_remediation(reason, violations, Vec::new())
    }

    pub fn block_with_remediation(
        reason: impl Into<String>,
        violations: Vec<Violation>,
        remediation: Vec<String>,
    ) -> Self {
        Verdict::Block {
            reason: reason.into(),
            violations,
            remediation,
        }
    }

    /// ALLOW and WARN both let the diff through.
    pub fn is_allowed(&self) -> bool {
        !self.is_blocked()
    }

    pub fn is_blocked(&self) -> bool {
        matches!(self, Verdict::Block { .. })
    }

    pub fn severity(&self) -> VerdictSeverity {
        match self {
            Verdict::Allow => VerdictSeverity::Allow,
            Verdict::Warn { .. } => VerdictSeverity::Warn,
            Verdict::Block { .. } => VerdictSeverity::Block,
        }
    }

    pub fn violations(&self) -> &[Violation] {
        match self {
            Verdict::Block { violations, .. } => violations,
            _ => &[],
        }
    }

    pub fn warnings(&self) -> &[String] {
        match self {
            Verdict::Warn { warnings, .. } => warnings,
            _ => &[],
        }
    }

    pub fn remediation(&self) -> &[String] {
        match self {
            Verdict::Block { remediation, .. } => remediation,
            _ => &[],
        }
    }
}

/// One broken rule, located at the file that broke it when known.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Violation {
    pub rule_id: String,
    pub rule_name: String,
    pub description: String,
    pub severity: ViolationSeverity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
}

impl Violation {
    pub fn new(
        rule_id: impl Into<String>,
        rule_name: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            rule_id: rule_id.into(),
            rule_name: rule_name.into(),
            description: description.into(),
            severity: ViolationSeverity::Error,
            location: None,
        }
    }

    pub fn with_severity(mut self, severity: ViolationSeverity) -> Self {
        self.severity = severity;
        self
    }

    pub fn with_location(mut self, location: impl Into<String>) -> Self {
        self.location = Some(location.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ViolationSeverity {
    Error,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VerdictSeverity {
    Allow,
    Warn,
    Block,
}

impl VerdictSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            VerdictSeverity::Allow => "allow",
            VerdictSeverity::Warn => "warn",
            VerdictSeverity::Block => "block",
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Verdict::Allow => write!(f, "ALLOW"),
            Verdict::Warn { message, warnings } if warnings.is_empty() => {
                write!(f, "WARN: {}", message)
            }
            Verdict::Warn { message, warnings } => {
                write!(f, "WARN: {} ({})", message, warnings.join(", "))
            }
            Verdict::Block { reason, violations, .. } => {
                write!(f, "BLOCK: {} ({} violations)", reason, violations.len())
            }
        }
    }
}

impl fmt::Display for ViolationSeverity {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ViolationSeverity::Error => write!(f, "error"),
            ViolationSeverity::Critical => write!(f, "critical"),
        }
    }
}
