use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::audit::AuditEntry;
use crate::cell::{Cell, CellId, LockOwner};
use crate::label::CellCoord;

/// A single sheet: a sparse grid of cells plus its audit trail. All mutation
/// happens through the engine actor that owns the sheet registry, so the
/// struct itself carries no locking.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Sheet {
    /// Project path this sheet belongs to; may contain `/`-separated
    /// subfolder segments.
    pub project: String,
    /// Sheet name (unique within its project)
    pub name: String,
    /// Sparse grid: 1-indexed row -> 1-indexed column -> cell
    #[serde(default, with = "grid_serde")]
    rows: BTreeMap<u32, BTreeMap<u32, Cell>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub audit_log: Vec<AuditEntry>,
}

/// Serialize the grid with row/column label keys ("1" -> "A" -> cell) so the
/// JSON snapshot matches the on-disk format clients already consume.
mod grid_serde {
    use super::*;
    use crate::label::{col_from_label, col_to_label};
    use serde::de;
    use serde::ser::SerializeMap;
    use serde::{Deserializer, Serializer};
    use std::fmt;

    pub fn serialize<S>(
        rows: &BTreeMap<u32, BTreeMap<u32, Cell>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut map = serializer.serialize_map(Some(rows.len()))?;
        for (row, cells) in rows {
            let labeled: BTreeMap<String, &Cell> = cells
                .iter()
                .map(|(col, cell)| (col_to_label(*col), cell))
                .collect();
            map.serialize_entry(&row.to_string(), &labeled)?;
        }
        map.end()
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<BTreeMap<u32, BTreeMap<u32, Cell>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct GridVisitor;

        impl<'de> de::Visitor<'de> for GridVisitor {
            type Value = BTreeMap<u32, BTreeMap<u32, Cell>>;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str("a map of row labels to column-label maps")
            }

            fn visit_map<M>(self, mut map: M) -> Result<Self::Value, M::Error>
            where
                M: de::MapAccess<'de>,
            {
                let mut rows = BTreeMap::new();

                while let Some(row_label) = map.next_key::<String>()? {
                    let cells: BTreeMap<String, Cell> = map.next_value()?;
                    let row: u32 = row_label
                        .parse()
                        .map_err(|_| de::Error::custom(format!("bad row label {row_label:?}")))?;

                    let mut row_cells = BTreeMap::new();
                    for (col_label, cell) in cells {
                        let col = col_from_label(&col_label).ok_or_else(|| {
                            de::Error::custom(format!("bad column label {col_label:?}"))
                        })?;
                        row_cells.insert(col, cell);
                    }
                    rows.insert(row, row_cells);
                }

                Ok(rows)
            }
        }

        deserializer.deserialize_map(GridVisitor)
    }
}

impl Sheet {
    /// Create a new empty sheet
    pub fn new(project: impl Into<String>, name: impl Into<String>) -> Self {
        Sheet {
            project: project.into(),
            name: name.into(),
            rows: BTreeMap::new(),
            audit_log: Vec::new(),
        }
    }

    /// The "project/sheet" key used by the dependency index and queues
    pub fn key(&self) -> String {
        format!("{}/{}", self.project, self.name)
    }

    /// Get a reference to a cell
    pub fn cell(&self, coord: CellCoord) -> Option<&Cell> {
        self.rows.get(&coord.row).and_then(|r| r.get(&coord.col))
    }

    /// Get a mutable reference to a cell, creating it lazily
    pub fn cell_mut(&mut self, coord: CellCoord) -> &mut Cell {
        self.rows
            .entry(coord.row)
            .or_default()
            .entry(coord.col)
            .or_default()
    }

    /// Drop the cell (and its row) again if it holds no data
    pub fn prune(&mut self, coord: CellCoord) {
        if let Some(row) = self.rows.get_mut(&coord.row) {
            if row.get(&coord.col).is_some_and(Cell::is_empty) {
                row.remove(&coord.col);
            }
            if row.is_empty() {
                self.rows.remove(&coord.row);
            }
        }
    }

    /// Set a cell's value, returning the previous one
    pub fn set_value(&mut self, coord: CellCoord, value: impl Into<String>) -> String {
        let cell = self.cell_mut(coord);
        let old = std::mem::replace(&mut cell.value, value.into());
        self.prune(coord);
        old
    }

    /// The value visible to tag references at the coordinate, empty when the
    /// cell does not exist.
    pub fn value_at(&self, coord: CellCoord) -> &str {
        self.cell(coord).map(Cell::visible_value).unwrap_or("")
    }

    /// Iterate over all cells, row-major
    pub fn cells(&self) -> impl Iterator<Item = (CellCoord, &Cell)> {
        self.rows.iter().flat_map(|(row, cells)| {
            cells
                .iter()
                .map(|(col, cell)| (CellCoord::new(*row, *col), cell))
        })
    }

    /// Iterate mutably over all cells, row-major
    pub fn cells_mut(&mut self) -> impl Iterator<Item = (CellCoord, &mut Cell)> {
        self.rows.iter_mut().flat_map(|(row, cells)| {
            cells
                .iter_mut()
                .map(|(col, cell)| (CellCoord::new(*row, *col), cell))
        })
    }

    /// Coordinates of every cell carrying a script
    pub fn script_cells(&self) -> Vec<(CellCoord, CellId, String)> {
        self.cells()
            .filter(|(_, cell)| cell.has_script())
            .filter_map(|(coord, cell)| cell.cell_id.map(|id| (coord, id, cell.script.clone())))
            .collect()
    }

    /// Locate a script cell by its stable id. O(cells); ids are sparse and
    /// sheets are small enough that no index is kept.
    pub fn find_by_id(&self, id: CellId) -> Option<CellCoord> {
        self.cells()
            .find(|(_, cell)| cell.cell_id == Some(id))
            .map(|(coord, _)| coord)
    }

    /// Ensure the cell at `coord` has a stable id, assigning one on first use
    pub fn assign_cell_id(&mut self, coord: CellCoord) -> CellId {
        let cell = self.cell_mut(coord);
        *cell.cell_id.get_or_insert_with(CellId::new_v4)
    }

    /// Release every cell owned by the given script's output span, clearing
    /// its value. Returns the released coordinates with their old values.
    pub fn release_span_locks(&mut self, owner: CellId) -> Vec<(CellCoord, String)> {
        let coords: Vec<CellCoord> = self
            .cells()
            .filter(|(_, cell)| cell.is_span_locked_by(owner))
            .map(|(coord, _)| coord)
            .collect();

        let mut released = Vec::with_capacity(coords.len());
        for coord in coords {
            let cell = self.cell_mut(coord);
            let old = std::mem::take(&mut cell.value);
            cell.lock = None;
            self.prune(coord);
            released.push((coord, old));
        }
        released
    }

    /// Unlock span-locked cells whose owning script cell no longer exists
    /// anywhere in the sheet. Returns the swept coordinates.
    pub fn sweep_zombie_span_locks(&mut self) -> Vec<CellCoord> {
        let live: std::collections::HashSet<CellId> =
            self.cells().filter_map(|(_, cell)| cell.cell_id).collect();

        let zombies: Vec<CellCoord> = self
            .cells()
            .filter(|(_, cell)| {
                matches!(cell.lock, Some(LockOwner::ScriptSpan(id)) if !live.contains(&id))
            })
            .map(|(coord, _)| coord)
            .collect();

        for coord in &zombies {
            let cell = self.cell_mut(*coord);
            cell.lock = None;
            cell.value.clear();
            self.prune(*coord);
        }
        zombies
    }

    /// Append an audit entry, merging it into the previous entry for the
    /// same user and cell inside the merge window.
    pub fn log_audit(&mut self, entry: AuditEntry) {
        if let Some(last) = self
            .audit_log
            .iter_mut()
            .rev()
            .find(|e| e.user == entry.user && e.row == entry.row && e.col == entry.col)
        {
            if last.can_merge(&entry) {
                last.merge(entry);
                return;
            }
        }
        self.audit_log.push(entry);
    }

    // ---------------------------------------------------------------------
    // Structural edits on the grid itself. Tag/options/audit rewriting is a
    // separate pass driven by the engine.
    // ---------------------------------------------------------------------

    /// Shift all rows at or below `at` down by one
    pub fn insert_row(&mut self, at: u32) {
        let rows = std::mem::take(&mut self.rows);
        self.rows = rows
            .into_iter()
            .map(|(r, cells)| (if r >= at { r + 1 } else { r }, cells))
            .collect();
    }

    /// Remove row `at` and shift everything below it up by one
    pub fn delete_row(&mut self, at: u32) {
        let rows = std::mem::take(&mut self.rows);
        self.rows = rows
            .into_iter()
            .filter(|(r, _)| *r != at)
            .map(|(r, cells)| (if r > at { r - 1 } else { r }, cells))
            .collect();
    }

    /// Move row `from` so it ends up at index `to`
    pub fn move_row(&mut self, from: u32, to: u32) {
        if from == to {
            return;
        }
        let moved = self.rows.remove(&from);
        let rows = std::mem::take(&mut self.rows);
        self.rows = rows
            .into_iter()
            .map(|(r, cells)| (shift_for_move(r, from, to), cells))
            .collect();
        if let Some(cells) = moved {
            self.rows.insert(to, cells);
        }
    }

    /// Shift all columns at or right of `at` right by one
    pub fn insert_col(&mut self, at: u32) {
        for cells in self.rows.values_mut() {
            let row = std::mem::take(cells);
            *cells = row
                .into_iter()
                .map(|(c, cell)| (if c >= at { c + 1 } else { c }, cell))
                .collect();
        }
    }

    /// Remove column `at` and shift everything right of it left by one
    pub fn delete_col(&mut self, at: u32) {
        for cells in self.rows.values_mut() {
            let row = std::mem::take(cells);
            *cells = row
                .into_iter()
                .filter(|(c, _)| *c != at)
                .map(|(c, cell)| (if c > at { c - 1 } else { c }, cell))
                .collect();
        }
        self.rows.retain(|_, cells| !cells.is_empty());
    }

    /// Move column `from` so it ends up at index `to`
    pub fn move_col(&mut self, from: u32, to: u32) {
        if from == to {
            return;
        }
        for cells in self.rows.values_mut() {
            let moved = cells.remove(&from);
            let row = std::mem::take(cells);
            *cells = row
                .into_iter()
                .map(|(c, cell)| (shift_for_move(c, from, to), cell))
                .collect();
            if let Some(cell) = moved {
                cells.insert(to, cell);
            }
        }
    }

    /// Number of non-empty cells
    pub fn cell_count(&self) -> usize {
        self.rows.values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Index mapping for a move edit: `from` lands at `to`, everything between
/// shifts by one toward the gap the move opened.
pub fn shift_for_move(idx: u32, from: u32, to: u32) -> u32 {
    if idx == from {
        to
    } else if from < to && idx > from && idx <= to {
        idx - 1
    } else if from > to && idx >= to && idx < from {
        idx + 1
    } else {
        idx
    }
}
