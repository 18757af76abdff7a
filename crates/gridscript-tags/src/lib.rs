pub mod dependency;
pub mod parser;
pub mod rewriter;
pub mod tag;

pub use dependency::{extract, Dependency, DependencyTracker, ScriptId};
pub use parser::{find_tags, parse_body, parse_plain, range_from_str, rewrite_tags};
pub use rewriter::{
    rewrite_options_range, rewrite_script, shift_audit_entry, shift_index, shift_range, shift_tag,
    Axis, IndexShift, RangeShift, ShiftKind, ShiftOp,
};
pub use tag::{SheetKey, Tag, TagSpan};
