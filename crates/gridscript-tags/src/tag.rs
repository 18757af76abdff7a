use serde::{Deserialize, Serialize};
use std::fmt;

use gridscript_core::CellRange;

/// Identifies one sheet system-wide: the dependency index key and the
/// addressing unit of cross-sheet tags.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SheetKey {
    pub project: String,
    pub sheet: String,
}

impl SheetKey {
    pub fn new(project: impl Into<String>, sheet: impl Into<String>) -> Self {
        SheetKey {
            project: project.into(),
            sheet: sheet.into(),
        }
    }
}

impl fmt::Display for SheetKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.project, self.sheet)
    }
}

/// A parsed `{{...}}` reference found inside a script or options-range field
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Tag {
    /// `{{A1}}` or `{{A1:B3}}`: a range on the sheet the script lives on
    Local(CellRange),
    /// `{{path/sheet/A1}}` or `{{path/sheet/A1:B3}}`: a range on another
    /// sheet; `project` may contain `/`-separated subfolder segments.
    Remote {
        project: String,
        sheet: String,
        range: CellRange,
    },
}

impl Tag {
    pub fn range(&self) -> CellRange {
        match self {
            Tag::Local(range) => *range,
            Tag::Remote { range, .. } => *range,
        }
    }

    pub fn with_range(&self, range: CellRange) -> Tag {
        match self {
            Tag::Local(_) => Tag::Local(range),
            Tag::Remote { project, sheet, .. } => Tag::Remote {
                project: project.clone(),
                sheet: sheet.clone(),
                range,
            },
        }
    }

    /// The sheet this tag reads from, resolving a local tag against the
    /// sheet its script lives on.
    pub fn target(&self, home: &SheetKey) -> SheetKey {
        match self {
            Tag::Local(_) => home.clone(),
            Tag::Remote { project, sheet, .. } => SheetKey::new(project.clone(), sheet.clone()),
        }
    }

    /// Render without the surrounding braces, the form options-range fields
    /// use ("A1:A10" or "project/sheet/A1:A10").
    pub fn to_plain(&self) -> String {
        match self {
            Tag::Local(range) => range.to_a1(),
            Tag::Remote {
                project,
                sheet,
                range,
            } => format!("{}/{}/{}", project, sheet, range.to_a1()),
        }
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Tag::Local(range) => write!(f, "{{{{{}}}}}", range.to_a1()),
            Tag::Remote {
                project,
                sheet,
                range,
            } => write!(f, "{{{{{}/{}/{}}}}}", project, sheet, range.to_a1()),
        }
    }
}

/// A tag found in text, with the byte span of the whole `{{...}}` token so
/// rewrites can splice precisely.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagSpan {
    pub start: usize,
    pub end: usize,
    pub tag: Tag,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tag_display() {
        let local = Tag::Local(CellRange::from_a1("A1").unwrap());
        assert_eq!(local.to_string(), "{{A1}}");

        let local_range = Tag::Local(CellRange::from_a1("A1:B3").unwrap());
        assert_eq!(local_range.to_string(), "{{A1:B3}}");

        let remote = Tag::Remote {
            project: "folder/proj".to_string(),
            sheet: "Sheet1".to_string(),
            range: CellRange::from_a1("C2").unwrap(),
        };
        assert_eq!(remote.to_string(), "{{folder/proj/Sheet1/C2}}");
    }

    #[test]
    fn test_target_resolution() {
        let home = SheetKey::new("p1", "S1");

        let local = Tag::Local(CellRange::from_a1("A1").unwrap());
        assert_eq!(local.target(&home), home);

        let remote = Tag::Remote {
            project: "p2".to_string(),
            sheet: "S2".to_string(),
            range: CellRange::from_a1("A1").unwrap(),
        };
        assert_eq!(remote.target(&home), SheetKey::new("p2", "S2"));
    }
}
