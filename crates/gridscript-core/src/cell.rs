use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Stable identifier of a script cell. Assigned once when a script is first
/// attached and never changed by row/column moves.
pub type CellId = Uuid;

/// Typed lock ownership record. A cell locked by `ScriptSpan` belongs to the
/// output area of the script cell with that id; a `User` lock is a plain
/// manual lock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "owner")]
pub enum LockOwner {
    #[serde(rename = "user")]
    User(String),
    #[serde(rename = "scriptSpan")]
    ScriptSpan(CellId),
}

/// A single cell of a sheet. Cells are created lazily on first write and
/// removed again when they become entirely empty.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Cell {
    /// Displayed value; also the stable value a self-referencing script reads.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub value: String,
    /// Script program text, with `{{...}}` tags still embedded.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub script: String,
    /// Shadow output written by a self-referencing script instead of `value`.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub script_output: String,
    /// Declared output span of the script result, anchor included.
    #[serde(default = "span_one", skip_serializing_if = "is_span_one")]
    pub output_row_span: u32,
    #[serde(default = "span_one", skip_serializing_if = "is_span_one")]
    pub output_col_span: u32,
    /// Stable script identity, present only once a script has been attached.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cell_id: Option<CellId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lock: Option<LockOwner>,
    /// Range feeding the combo/multi-select options, e.g. "A1:A10" or
    /// "project/sheet/A1:A10".
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub options_range: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options_selected: Vec<String>,
}

fn span_one() -> u32 {
    1
}

fn is_span_one(span: &u32) -> bool {
    *span == 1
}

impl Default for Cell {
    fn default() -> Self {
        Cell {
            value: String::new(),
            script: String::new(),
            script_output: String::new(),
            output_row_span: 1,
            output_col_span: 1,
            cell_id: None,
            lock: None,
            options_range: String::new(),
            options: Vec::new(),
            options_selected: Vec::new(),
        }
    }
}

impl Cell {
    /// Create a cell holding a plain value
    pub fn with_value(value: impl Into<String>) -> Self {
        Cell {
            value: value.into(),
            ..Cell::default()
        }
    }

    pub fn has_script(&self) -> bool {
        !self.script.is_empty()
    }

    pub fn is_locked(&self) -> bool {
        self.lock.is_some()
    }

    /// True when this cell is owned by the output span of the given script
    pub fn is_span_locked_by(&self, owner: CellId) -> bool {
        matches!(self.lock, Some(LockOwner::ScriptSpan(id)) if id == owner)
    }

    /// The value other cells see when they reference this one: the shadow
    /// output of a self-referencing script when present, else the main value.
    pub fn visible_value(&self) -> &str {
        if self.script_output.is_empty() {
            &self.value
        } else {
            &self.script_output
        }
    }

    /// A cell with no data at all can be dropped from the sparse grid
    pub fn is_empty(&self) -> bool {
        self.value.is_empty()
            && self.script.is_empty()
            && self.script_output.is_empty()
            && self.cell_id.is_none()
            && self.lock.is_none()
            && self.options_range.is_empty()
            && self.options.is_empty()
            && self.options_selected.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_cell_is_empty() {
        assert!(Cell::default().is_empty());
        assert!(!Cell::with_value("x").is_empty());
    }

    #[test]
    fn test_span_lock_ownership() {
        let owner = Uuid::new_v4();
        let other = Uuid::new_v4();

        let mut cell = Cell::default();
        cell.lock = Some(LockOwner::ScriptSpan(owner));

        assert!(cell.is_locked());
        assert!(cell.is_span_locked_by(owner));
        assert!(!cell.is_span_locked_by(other));

        cell.lock = Some(LockOwner::User("alice".to_string()));
        assert!(!cell.is_span_locked_by(owner));
    }

    #[test]
    fn test_visible_value_prefers_shadow_output() {
        let mut cell = Cell::with_value("5");
        assert_eq!(cell.visible_value(), "5");

        cell.script_output = "10".to_string();
        assert_eq!(cell.visible_value(), "10");
    }

    #[test]
    fn test_cell_serde_round_trip() {
        let mut cell = Cell::with_value("hello");
        cell.script = "{{A1}}".to_string();
        cell.output_row_span = 2;
        cell.cell_id = Some(Uuid::new_v4());

        let json = serde_json::to_string(&cell).unwrap();
        let back: Cell = serde_json::from_str(&json).unwrap();
        assert_eq!(back, cell);
    }
}
