//! Typed errors surfaced at the daemon API boundary.

use thiserror::Error;

/// Errors the control surface reports with a dedicated kind.
///
/// Plumbing-level failures stay `anyhow`; these are the ones a client or the
/// startup sequence needs to tell apart.
#[derive(Error, Debug)]
pub enum FalconError {
    /// The requested path is not a node of the loaded graph.
    #[error("target not found: {0}")]
    TargetNotFound(String),

    /// The build description is not a valid DAG.
    #[error("graph inconsistency: {0}")]
    GraphInconsistent(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
