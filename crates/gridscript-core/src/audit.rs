use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::label::col_to_label;

/// Window inside which consecutive edits of the same cell by the same user
/// are merged into one audit entry.
pub const MERGE_WINDOW_HOURS: i64 = 24;

/// What kind of change an audit entry records
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AuditAction {
    SetValue,
    SetScript,
    ClearScript,
    InsertRow,
    DeleteRow,
    MoveRow,
    InsertColumn,
    DeleteColumn,
    MoveColumn,
}

/// One entry of a sheet's audit trail. Coordinates are shifted in lockstep
/// with script tags whenever rows or columns move, so the history stays
/// spatially accurate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEntry {
    pub timestamp: DateTime<Utc>,
    pub user: String,
    pub action: AuditAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub row: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub col: Option<u32>,
    /// Secondary coordinate, e.g. the destination of a move
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub row2: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub col2: Option<u32>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub old_value: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub new_value: String,
    /// Set when a later entry undid this one
    #[serde(default)]
    pub reversed: bool,
}

impl AuditEntry {
    /// Entry for a value or script change at one cell
    pub fn cell_change(
        user: impl Into<String>,
        action: AuditAction,
        row: u32,
        col: u32,
        old_value: impl Into<String>,
        new_value: impl Into<String>,
    ) -> Self {
        AuditEntry {
            timestamp: Utc::now(),
            user: user.into(),
            action,
            row: Some(row),
            col: Some(col),
            row2: None,
            col2: None,
            old_value: old_value.into(),
            new_value: new_value.into(),
            reversed: false,
        }
    }

    /// Entry for a structural row/column edit
    pub fn structural(
        user: impl Into<String>,
        action: AuditAction,
        index: u32,
        dest: Option<u32>,
    ) -> Self {
        let row_axis = matches!(
            action,
            AuditAction::InsertRow | AuditAction::DeleteRow | AuditAction::MoveRow
        );
        AuditEntry {
            timestamp: Utc::now(),
            user: user.into(),
            action,
            row: row_axis.then_some(index),
            col: (!row_axis).then_some(index),
            row2: if row_axis { dest } else { None },
            col2: if row_axis { None } else { dest },
            old_value: String::new(),
            new_value: String::new(),
            reversed: false,
        }
    }

    /// Whether a newer entry can be merged into this one instead of being
    /// appended: same user, same cell, same action, inside the merge window.
    pub fn can_merge(&self, other: &AuditEntry) -> bool {
        self.user == other.user
            && self.action == other.action
            && self.row == other.row
            && self.col == other.col
            && self.row.is_some()
            && other.timestamp - self.timestamp < Duration::hours(MERGE_WINDOW_HOURS)
    }

    /// Fold a newer edit of the same cell into this entry, keeping the
    /// original old value.
    pub fn merge(&mut self, newer: AuditEntry) {
        self.timestamp = newer.timestamp;
        self.new_value = newer.new_value;
    }

    /// Human-readable description for client display
    pub fn describe(&self) -> String {
        let at = match (self.row, self.col) {
            (Some(r), Some(c)) => format!("{}{}", col_to_label(c), r),
            (Some(r), None) => format!("row {}", r),
            (None, Some(c)) => format!("column {}", col_to_label(c)),
            (None, None) => String::new(),
        };

        match self.action {
            AuditAction::SetValue => format!("{} set {} to \"{}\"", self.user, at, self.new_value),
            AuditAction::SetScript => format!("{} attached a script to {}", self.user, at),
            AuditAction::ClearScript => format!("{} cleared the script at {}", self.user, at),
            AuditAction::InsertRow => format!("{} inserted {}", self.user, at),
            AuditAction::DeleteRow => format!("{} deleted {}", self.user, at),
            AuditAction::MoveRow => format!(
                "{} moved row {} to {}",
                self.user,
                self.row.unwrap_or(0),
                self.row2.unwrap_or(0)
            ),
            AuditAction::InsertColumn => format!("{} inserted {}", self.user, at),
            AuditAction::DeleteColumn => format!("{} deleted {}", self.user, at),
            AuditAction::MoveColumn => format!(
                "{} moved column {} to {}",
                self.user,
                self.col.map(col_to_label).unwrap_or_default(),
                self.col2.map(col_to_label).unwrap_or_default()
            ),
        }
    }
}
