//! Reverse dependency index: referenced sheet -> scripts that read from it.
//!
//! Rebuilt by a full scan on load (O(cells), a deliberate simplicity
//! trade-off) and patched incrementally whenever a script's text changes.

use std::collections::{HashMap, HashSet};

use gridscript_core::{CellCoord, CellId, CellRange};

use crate::parser::find_tags;
use crate::tag::{SheetKey, Tag};

/// One script instance and one range it depends on. Several entries may
/// share the same `(project, sheet, cell_id)` when a script references
/// multiple ranges.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ScriptId {
    /// The sheet the script lives on
    pub home: SheetKey,
    /// Stable id of the script cell
    pub cell_id: CellId,
    /// The range this entry depends on, within the indexed sheet
    pub range: CellRange,
}

/// A dependency extracted from script text: which sheet it reads and where
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Dependency {
    pub target: SheetKey,
    pub range: CellRange,
}

/// Scan script text for dependencies. Cross-sheet tags are collected first,
/// then same-sheet tags, de-duplicated by `(target, range)`. A script with
/// no tags at all depends on its own cell, so it is still reachable when its
/// own output range changes.
pub fn extract(script: &str, home: &SheetKey, own: CellCoord) -> Vec<Dependency> {
    let mut seen = HashSet::new();
    let mut remote = Vec::new();
    let mut local = Vec::new();

    for span in find_tags(script) {
        let dep = Dependency {
            target: span.tag.target(home),
            range: span.tag.range(),
        };
        if !seen.insert(dep.clone()) {
            continue;
        }
        match span.tag {
            Tag::Remote { .. } => remote.push(dep),
            Tag::Local(_) => local.push(dep),
        }
    }

    remote.extend(local);
    if remote.is_empty() {
        remote.push(Dependency {
            target: home.clone(),
            range: CellRange::single(own),
        });
    }
    remote
}

/// The reverse index from referenced sheet to the scripts reading it
#[derive(Debug, Default)]
pub struct DependencyTracker {
    index: HashMap<SheetKey, Vec<ScriptId>>,
}

impl DependencyTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace every record for `(home, cell_id)` with freshly extracted
    /// ones. An empty script removes the records outright.
    pub fn update(&mut self, home: &SheetKey, cell_id: CellId, script: &str, own: CellCoord) {
        self.remove_script(home, cell_id);

        if script.trim().is_empty() {
            return;
        }

        for dep in extract(script, home, own) {
            self.index.entry(dep.target).or_default().push(ScriptId {
                home: home.clone(),
                cell_id,
                range: dep.range,
            });
        }
    }

    /// Remove every record of one script across the whole index
    pub fn remove_script(&mut self, home: &SheetKey, cell_id: CellId) {
        self.index
            .values_mut()
            .for_each(|ids| ids.retain(|id| !(id.home == *home && id.cell_id == cell_id)));
        self.index.retain(|_, ids| !ids.is_empty());
    }

    /// Drop a whole sheet: its index bucket and every script homed there
    pub fn remove_sheet(&mut self, key: &SheetKey) {
        self.index.remove(key);
        self.index
            .values_mut()
            .for_each(|ids| ids.retain(|id| id.home != *key));
        self.index.retain(|_, ids| !ids.is_empty());
    }

    /// Scripts that depend on the changed cell, de-duplicated by script
    /// identity. A script living in the changed cell itself comes first, so
    /// self-referencing scripts settle before propagating outward.
    pub fn resolve(
        &self,
        changed: &SheetKey,
        coord: CellCoord,
        changed_cell_id: Option<CellId>,
    ) -> Vec<ScriptId> {
        let Some(candidates) = self.index.get(changed) else {
            return Vec::new();
        };

        let mut seen = HashSet::new();
        let mut own = Vec::new();
        let mut others = Vec::new();

        for id in candidates {
            if !id.range.contains(coord) {
                continue;
            }
            if !seen.insert((id.home.clone(), id.cell_id)) {
                continue;
            }
            let is_self = id.home == *changed && changed_cell_id == Some(id.cell_id);
            if is_self {
                own.push(id.clone());
            } else {
                others.push(id.clone());
            }
        }

        own.extend(others);
        own
    }

    /// Every script record that reads from the given sheet (used to find
    /// cross-sheet references that need rewriting after a structural edit).
    pub fn scripts_reading(&self, key: &SheetKey) -> Vec<ScriptId> {
        self.index.get(key).cloned().unwrap_or_default()
    }

    /// Rewrite every key and record matching the renamed project
    pub fn rename_project(&mut self, old: &str, new: &str) {
        let index = std::mem::take(&mut self.index);
        self.index = index
            .into_iter()
            .map(|(mut key, mut ids)| {
                if key.project == old {
                    key.project = new.to_string();
                }
                for id in &mut ids {
                    if id.home.project == old {
                        id.home.project = new.to_string();
                    }
                }
                (key, ids)
            })
            .collect();
    }

    /// Rewrite every key and record matching the renamed sheet
    pub fn rename_sheet(&mut self, project: &str, old: &str, new: &str) {
        let index = std::mem::take(&mut self.index);
        self.index = index
            .into_iter()
            .map(|(mut key, mut ids)| {
                if key.project == project && key.sheet == old {
                    key.sheet = new.to_string();
                }
                for id in &mut ids {
                    if id.home.project == project && id.home.sheet == old {
                        id.home.sheet = new.to_string();
                    }
                }
                (key, ids)
            })
            .collect();
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Total number of dependency records
    pub fn record_count(&self) -> usize {
        self.index.values().map(Vec::len).sum()
    }

    pub fn clear(&mut self) {
        self.index.clear();
    }
}
