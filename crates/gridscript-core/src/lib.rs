pub mod audit;
pub mod cell;
pub mod error;
pub mod label;
pub mod sheet;

pub use audit::{AuditAction, AuditEntry, MERGE_WINDOW_HOURS};
pub use cell::{Cell, CellId, LockOwner};
pub use error::GridError;
pub use label::{col_from_label, col_to_label, CellCoord, CellRange};
pub use sheet::{shift_for_move, Sheet};
