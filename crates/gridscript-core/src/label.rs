use serde::{Deserialize, Serialize};
use std::fmt;

/// Cell coordinate. Rows and columns are both 1-indexed: row 1 carries the
/// label "1" and column 1 carries the label "A".
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct CellCoord {
    pub row: u32,
    pub col: u32,
}

impl CellCoord {
    pub const fn new(row: u32, col: u32) -> Self {
        CellCoord { row, col }
    }

    /// Parse A1 notation (e.g., "A1" -> row 1, col 1; "AA100" -> row 100, col 27)
    pub fn from_a1(notation: &str) -> Option<Self> {
        let notation = notation.trim();
        let mut col_str = String::new();
        let mut row_str = String::new();

        for c in notation.chars() {
            if c.is_ascii_alphabetic() {
                if !row_str.is_empty() {
                    return None; // letters after digits
                }
                col_str.push(c.to_ascii_uppercase());
            } else if c.is_ascii_digit() {
                row_str.push(c);
            } else {
                return None;
            }
        }

        if col_str.is_empty() || row_str.is_empty() {
            return None;
        }

        let col = col_from_label(&col_str)?;
        let row: u32 = row_str.parse().ok()?;
        if row == 0 {
            return None;
        }

        Some(CellCoord { row, col })
    }

    /// Render as A1 notation
    pub fn to_a1(&self) -> String {
        format!("{}{}", col_to_label(self.col), self.row)
    }
}

impl fmt::Display for CellCoord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_a1())
    }
}

/// Convert a 1-indexed column number to its letter label (1 -> A, 26 -> Z, 27 -> AA)
pub fn col_to_label(col: u32) -> String {
    let mut label = String::new();
    let mut n = col;

    while n > 0 {
        n -= 1;
        label.insert(0, char::from(b'A' + (n % 26) as u8));
        n /= 26;
    }

    label
}

/// Convert a column letter label to its 1-indexed number (A -> 1, Z -> 26, AA -> 27)
pub fn col_from_label(label: &str) -> Option<u32> {
    let mut col: u32 = 0;

    for c in label.chars() {
        if !c.is_ascii_alphabetic() {
            return None;
        }
        col = col * 26 + (c.to_ascii_uppercase() as u32 - 'A' as u32 + 1);
    }

    if col == 0 {
        None
    } else {
        Some(col)
    }
}

/// A rectangular range of cells (e.g., A1:B10). Stored normalized so `start`
/// is the top-left corner and `end` the bottom-right.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CellRange {
    pub start: CellCoord,
    pub end: CellCoord,
}

impl CellRange {
    pub fn new(start: CellCoord, end: CellCoord) -> Self {
        CellRange {
            start: CellCoord::new(start.row.min(end.row), start.col.min(end.col)),
            end: CellCoord::new(start.row.max(end.row), start.col.max(end.col)),
        }
    }

    pub fn single(coord: CellCoord) -> Self {
        CellRange {
            start: coord,
            end: coord,
        }
    }

    /// Parse "A1" or "A1:B10" notation
    pub fn from_a1(notation: &str) -> Option<Self> {
        match notation.split_once(':') {
            None => {
                let coord = CellCoord::from_a1(notation)?;
                Some(CellRange::single(coord))
            }
            Some((first, second)) => {
                let start = CellCoord::from_a1(first)?;
                let end = CellCoord::from_a1(second)?;
                Some(CellRange::new(start, end))
            }
        }
    }

    /// Render as "A1" or "A1:B10" notation
    pub fn to_a1(&self) -> String {
        if self.start == self.end {
            self.start.to_a1()
        } else {
            format!("{}:{}", self.start.to_a1(), self.end.to_a1())
        }
    }

    /// Inclusive rectangular containment test
    pub fn contains(&self, coord: CellCoord) -> bool {
        coord.row >= self.start.row
            && coord.row <= self.end.row
            && coord.col >= self.start.col
            && coord.col <= self.end.col
    }

    pub fn is_single_cell(&self) -> bool {
        self.start == self.end
    }

    pub fn row_count(&self) -> u32 {
        self.end.row - self.start.row + 1
    }

    pub fn col_count(&self) -> u32 {
        self.end.col - self.start.col + 1
    }

    /// Iterate over all coordinates in the range, row-major
    pub fn iter(&self) -> CellRangeIter {
        CellRangeIter {
            range: *self,
            current_row: self.start.row,
            current_col: self.start.col,
        }
    }
}

impl fmt::Display for CellRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_a1())
    }
}

impl IntoIterator for CellRange {
    type Item = CellCoord;
    type IntoIter = CellRangeIter;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// Iterator over coordinates in a range
pub struct CellRangeIter {
    range: CellRange,
    current_row: u32,
    current_col: u32,
}

impl Iterator for CellRangeIter {
    type Item = CellCoord;

    fn next(&mut self) -> Option<Self::Item> {
        if self.current_row > self.range.end.row {
            return None;
        }

        let coord = CellCoord::new(self.current_row, self.current_col);

        self.current_col += 1;
        if self.current_col > self.range.end.col {
            self.current_col = self.range.start.col;
            self.current_row += 1;
        }

        Some(coord)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_col_to_label() {
        assert_eq!(col_to_label(1), "A");
        assert_eq!(col_to_label(26), "Z");
        assert_eq!(col_to_label(27), "AA");
        assert_eq!(col_to_label(28), "AB");
        assert_eq!(col_to_label(702), "ZZ");
        assert_eq!(col_to_label(703), "AAA");
    }

    #[test]
    fn test_col_from_label() {
        assert_eq!(col_from_label("A"), Some(1));
        assert_eq!(col_from_label("Z"), Some(26));
        assert_eq!(col_from_label("AA"), Some(27));
        assert_eq!(col_from_label("ZZ"), Some(702));
        assert_eq!(col_from_label(""), None);
        assert_eq!(col_from_label("A1"), None);
    }

    #[test]
    fn test_coord_a1_round_trip() {
        let coord = CellCoord::from_a1("A1").unwrap();
        assert_eq!(coord, CellCoord::new(1, 1));

        let coord = CellCoord::from_a1("B2").unwrap();
        assert_eq!(coord, CellCoord::new(2, 2));

        let coord = CellCoord::from_a1("AA100").unwrap();
        assert_eq!(coord, CellCoord::new(100, 27));
        assert_eq!(coord.to_a1(), "AA100");

        assert_eq!(CellCoord::from_a1("A0"), None);
        assert_eq!(CellCoord::from_a1("1A"), None);
        assert_eq!(CellCoord::from_a1("A 1"), None);
    }

    #[test]
    fn test_range_normalization_and_contains() {
        let range = CellRange::from_a1("B3:A2").unwrap();
        assert_eq!(range.start, CellCoord::new(2, 1));
        assert_eq!(range.end, CellCoord::new(3, 2));

        assert!(range.contains(CellCoord::new(2, 1)));
        assert!(range.contains(CellCoord::new(3, 2)));
        assert!(!range.contains(CellCoord::new(4, 1)));
        assert!(!range.contains(CellCoord::new(2, 3)));
    }

    #[test]
    fn test_single_cell_range_renders_without_colon() {
        let range = CellRange::from_a1("C7").unwrap();
        assert!(range.is_single_cell());
        assert_eq!(range.to_a1(), "C7");
    }

    #[test]
    fn test_range_iteration_row_major() {
        let range = CellRange::from_a1("A1:B2").unwrap();
        let coords: Vec<_> = range.iter().collect();

        assert_eq!(coords.len(), 4);
        assert_eq!(coords[0], CellCoord::new(1, 1));
        assert_eq!(coords[1], CellCoord::new(1, 2));
        assert_eq!(coords[2], CellCoord::new(2, 1));
        assert_eq!(coords[3], CellCoord::new(2, 2));
    }
}
