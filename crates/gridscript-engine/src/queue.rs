use std::collections::{HashMap, HashSet, VecDeque};

use gridscript_core::{CellCoord, CellId};
use gridscript_tags::SheetKey;

/// A single cell addressed system-wide: a work item for the scheduler
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CellAddr {
    pub key: SheetKey,
    pub coord: CellCoord,
}

impl CellAddr {
    pub fn new(key: SheetKey, coord: CellCoord) -> Self {
        CellAddr { key, coord }
    }
}

/// What kind of change a broadcast notification announces
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    /// Cell contents changed
    Cells,
    /// Rows or columns were inserted, deleted or moved
    Structure,
}

/// All scheduler work state, owned privately by the engine actor. No locks:
/// only the actor task touches this.
#[derive(Debug, Default)]
pub struct WorkQueues {
    /// Cells changed directly by users, FIFO
    manual: VecDeque<CellAddr>,
    /// Cells changed by script output, FIFO
    script: VecDeque<CellAddr>,
    /// Sheets waiting for a client notification, deduplicated by key; a
    /// structural change outranks a plain cell change.
    pending_broadcast: HashMap<SheetKey, ChangeKind>,
    /// Scripts already run in the current manual-edit cycle (cycle guard)
    executed: HashSet<(SheetKey, CellId)>,
}

impl WorkQueues {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_manual(&mut self, addr: CellAddr) {
        self.manual.push_back(addr);
    }

    pub fn pop_manual(&mut self) -> Option<CellAddr> {
        self.manual.pop_front()
    }

    pub fn push_script(&mut self, addr: CellAddr) {
        self.script.push_back(addr);
    }

    pub fn pop_script(&mut self) -> Option<CellAddr> {
        self.script.pop_front()
    }

    pub fn has_work(&self) -> bool {
        !self.manual.is_empty() || !self.script.is_empty()
    }

    /// Mark a sheet as needing a client notification
    pub fn mark_broadcast(&mut self, key: SheetKey, kind: ChangeKind) {
        let entry = self.pending_broadcast.entry(key).or_insert(kind);
        if kind == ChangeKind::Structure {
            *entry = ChangeKind::Structure;
        }
    }

    /// Take all pending notifications, at most one per sheet
    pub fn drain_broadcasts(&mut self) -> Vec<(SheetKey, ChangeKind)> {
        self.pending_broadcast.drain().collect()
    }

    /// Record a script execution in the current cycle. Returns false when
    /// the script already ran this cycle (a cycle was cut).
    pub fn mark_executed(&mut self, key: &SheetKey, cell_id: CellId) -> bool {
        self.executed.insert((key.clone(), cell_id))
    }

    /// A new manual edit starts a fresh recalculation cycle
    pub fn start_cycle(&mut self) {
        self.executed.clear();
    }
}
