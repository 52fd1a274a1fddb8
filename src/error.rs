//! The core's error taxonomy.
//!
//! Every kind named in the design's error table is a variant here; the
//! scheduler converts a `CoreError` into a terminal target state
//! instead of propagating it as a process-level failure, except for
//! the handful of kinds documented below as fatal.

use std::time::Duration;

use crate::label::BuildLabel;

/// Errors raised by the label model, the graph, the scheduler, and the
/// command expander.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("invalid build label `{text}`: {reason}")]
    ParseError { text: String, reason: String },

    #[error("target not found: {0}")]
    TargetNotFound(BuildLabel),

    #[error("dependency cycle detected, involving: {}", .0.iter().map(|l| l.to_string()).collect::<Vec<_>>().join(" -> "))]
    CycleDetected(Vec<BuildLabel>),

    #[error("{dependent} cannot see {dependency}: not visible from this package")]
    VisibilityError {
        dependent: BuildLabel,
        dependency: BuildLabel,
    },

    #[error("{target} and {other} both declare output `{path}`")]
    DuplicateOutput {
        path: String,
        target: BuildLabel,
        other: BuildLabel,
    },

    #[error("invalid $(...) substitution in {target}: {reason}")]
    CommandSubstError { target: BuildLabel, reason: String },

    #[error("build of {target} failed: {reason}")]
    BuildError { target: BuildLabel, reason: String },

    #[error("{target} timed out after {seconds:?}")]
    TimeoutError {
        target: BuildLabel,
        seconds: Duration,
    },

    #[error("could not acquire plz-out/.lock: {0}")]
    LockAcquireError(String),

    #[error("{label} already exists in the graph")]
    DuplicateLabel { label: BuildLabel },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type CoreResult<T> = Result<T, CoreError>;
