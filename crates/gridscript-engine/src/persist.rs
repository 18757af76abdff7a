//! Debounced per-sheet JSON snapshot persistence.
//!
//! The engine tracks dirty sheets and their last-mutation instant; once a
//! sheet has been quiet for the debounce window it is handed to the store.
//! Durability is eventual by design: a crash inside the window loses the
//! unflushed mutations.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;

use gridscript_core::Sheet;
use gridscript_tags::SheetKey;

/// Where sheet snapshots go and come from
pub trait SnapshotStore: Send + Sync {
    fn save(&self, sheet: &Sheet) -> anyhow::Result<()>;
    fn load_all(&self) -> anyhow::Result<Vec<Sheet>>;
    fn remove(&self, key: &SheetKey) -> anyhow::Result<()>;
}

/// Stores each sheet as `<root>/<project path>/<sheet>.json`
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    root: PathBuf,
}

impl JsonFileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        JsonFileStore { root: root.into() }
    }

    fn sheet_path(&self, project: &str, sheet: &str) -> PathBuf {
        let mut path = self.root.clone();
        for segment in project.split('/') {
            path.push(segment);
        }
        path.push(format!("{sheet}.json"));
        path
    }

    fn collect_json_files(dir: &Path, out: &mut Vec<PathBuf>) -> anyhow::Result<()> {
        for entry in fs::read_dir(dir).with_context(|| format!("reading {}", dir.display()))? {
            let path = entry?.path();
            if path.is_dir() {
                Self::collect_json_files(&path, out)?;
            } else if path.extension().is_some_and(|ext| ext == "json") {
                out.push(path);
            }
        }
        Ok(())
    }
}

impl SnapshotStore for JsonFileStore {
    fn save(&self, sheet: &Sheet) -> anyhow::Result<()> {
        let path = self.sheet_path(&sheet.project, &sheet.name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let json = serde_json::to_string_pretty(sheet)?;
        fs::write(&path, json).with_context(|| format!("writing {}", path.display()))?;
        tracing::debug!("persisted {}/{}", sheet.project, sheet.name);
        Ok(())
    }

    fn load_all(&self) -> anyhow::Result<Vec<Sheet>> {
        if !self.root.exists() {
            return Ok(Vec::new());
        }

        let mut files = Vec::new();
        Self::collect_json_files(&self.root, &mut files)?;

        let mut sheets = Vec::with_capacity(files.len());
        for path in files {
            let json =
                fs::read_to_string(&path).with_context(|| format!("reading {}", path.display()))?;
            let sheet: Sheet = serde_json::from_str(&json)
                .with_context(|| format!("parsing {}", path.display()))?;
            sheets.push(sheet);
        }
        Ok(sheets)
    }

    fn remove(&self, key: &SheetKey) -> anyhow::Result<()> {
        let path = self.sheet_path(&key.project, &key.sheet);
        if path.exists() {
            fs::remove_file(&path).with_context(|| format!("removing {}", path.display()))?;
        }
        Ok(())
    }
}
