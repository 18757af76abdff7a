use thiserror::Error;

/// Errors raised by grid storage and structural edits
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GridError {
    #[error("sheet not found: {0}")]
    SheetNotFound(String),

    #[error("sheet already exists: {0}")]
    SheetExists(String),

    #[error("invalid row or column index: {0}")]
    InvalidIndex(String),

    #[error("cell {0} is locked")]
    CellLocked(String),
}
