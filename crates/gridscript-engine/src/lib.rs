//! The recalculation engine: a single-owner actor tying together the grid
//! store, the dependency tracker, script execution, span output placement,
//! debounced JSON persistence and change notifications.

pub mod broadcast;
pub mod config;
pub mod engine;
pub mod error;
pub mod executor;
pub mod persist;
pub mod queue;
pub mod runtime;
pub mod snapshot;
pub mod span;
pub mod store;

pub use broadcast::{ChangeHub, SheetChange};
pub use config::EngineConfig;
pub use engine::{Engine, EngineHandle};
pub use error::EngineError;
pub use persist::{JsonFileStore, SnapshotStore};
pub use queue::{CellAddr, ChangeKind};
pub use runtime::{InterpreterRuntime, RuntimeOutput, ScriptRuntime};
pub use snapshot::{AuditView, SheetSnapshot};
pub use span::SpanWrite;
pub use store::Workbooks;
