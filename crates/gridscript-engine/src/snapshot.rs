//! Read-only sheet views handed to clients for synchronization.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

use gridscript_core::{Cell, Sheet};

/// One audit entry rendered for display
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditView {
    pub timestamp: DateTime<Utc>,
    pub user: String,
    pub description: String,
    pub reversed: bool,
}

/// Snapshot of a sheet: the sparse cell grid keyed by A1 labels plus the
/// audit trail with human-readable descriptions.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SheetSnapshot {
    pub project: String,
    pub name: String,
    pub cells: BTreeMap<String, Cell>,
    pub audit: Vec<AuditView>,
}

impl SheetSnapshot {
    pub fn of(sheet: &Sheet) -> Self {
        SheetSnapshot {
            project: sheet.project.clone(),
            name: sheet.name.clone(),
            cells: sheet
                .cells()
                .map(|(coord, cell)| (coord.to_a1(), cell.clone()))
                .collect(),
            audit: sheet
                .audit_log
                .iter()
                .map(|entry| AuditView {
                    timestamp: entry.timestamp,
                    user: entry.user.clone(),
                    description: entry.describe(),
                    reversed: entry.reversed,
                })
                .collect(),
        }
    }

    /// Visible value at an A1 address, empty when the cell does not exist
    pub fn value(&self, a1: &str) -> &str {
        self.cells.get(a1).map(Cell::visible_value).unwrap_or("")
    }

    /// Script text at an A1 address
    pub fn script(&self, a1: &str) -> &str {
        self.cells.get(a1).map(|c| c.script.as_str()).unwrap_or("")
    }
}
