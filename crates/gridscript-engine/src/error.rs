use thiserror::Error;

use gridscript_core::GridError;

/// Errors surfaced by the engine's entry points
#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Grid(#[from] GridError),

    #[error("engine is shut down")]
    Closed,

    #[error("invalid structural edit: {0}")]
    InvalidEdit(String),

    #[error("persistence failed: {0}")]
    Persist(#[from] anyhow::Error),
}
