//! toolflow policy: the gate between an applied diff and the rest of the run
//!
//! ```text
//! AppliedDiff → DiffMetrics → validate_diff(ScopeConstraints) → ALLOW / WARN / BLOCK
//! ```
//!
//! # Example
//!
//! ```
//! use toolflow_core::Scope;
//! use toolflow_policy::{validate_diff, DiffMetrics, FileChange, ScopeConstraints};
//!
//! let constraints = ScopeConstraints::from_scope(Scope::default());
//! let metrics = DiffMetrics::new()
//!     .with_file(FileChange::new("src/lib.rs", 12, 1))
//!     .validated(true);
//!
//! assert!(validate_diff(&constraints, &metrics).is_allowed());
//! ```

pub mod constraints;
pub mod verdict;

pub use constraints::{default_forbidden_patterns, validate_diff, DiffMetrics, FileChange, ScopeConstraints};
pub use verdict::{Verdict, VerdictSeverity, Violation, ViolationSeverity};
