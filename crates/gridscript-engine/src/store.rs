use std::collections::HashMap;

use gridscript_core::Sheet;
use gridscript_tags::SheetKey;

/// In-memory registry of every loaded sheet, keyed by project/sheet. Owned
/// exclusively by the engine actor.
#[derive(Debug, Default)]
pub struct Workbooks {
    sheets: HashMap<SheetKey, Sheet>,
}

impl Workbooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &SheetKey) -> Option<&Sheet> {
        self.sheets.get(key)
    }

    pub fn get_mut(&mut self, key: &SheetKey) -> Option<&mut Sheet> {
        self.sheets.get_mut(key)
    }

    /// Get the sheet, creating an empty one on first touch
    pub fn open(&mut self, key: &SheetKey) -> &mut Sheet {
        self.sheets
            .entry(key.clone())
            .or_insert_with(|| Sheet::new(key.project.clone(), key.sheet.clone()))
    }

    pub fn insert(&mut self, sheet: Sheet) {
        let key = SheetKey::new(sheet.project.clone(), sheet.name.clone());
        self.sheets.insert(key, sheet);
    }

    pub fn contains(&self, key: &SheetKey) -> bool {
        self.sheets.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &SheetKey> {
        self.sheets.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&SheetKey, &Sheet)> {
        self.sheets.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&SheetKey, &mut Sheet)> {
        self.sheets.iter_mut()
    }

    pub fn len(&self) -> usize {
        self.sheets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sheets.is_empty()
    }

    /// Re-key every sheet in a renamed project
    pub fn rename_project(&mut self, old: &str, new: &str) {
        let sheets = std::mem::take(&mut self.sheets);
        self.sheets = sheets
            .into_iter()
            .map(|(mut key, mut sheet)| {
                if key.project == old {
                    key.project = new.to_string();
                    sheet.project = new.to_string();
                }
                (key, sheet)
            })
            .collect();
    }

    /// Re-key one renamed sheet
    pub fn rename_sheet(&mut self, project: &str, old: &str, new: &str) {
        let from = SheetKey::new(project, old);
        if let Some(mut sheet) = self.sheets.remove(&from) {
            sheet.name = new.to_string();
            self.sheets.insert(SheetKey::new(project, new), sheet);
        }
    }
}
