//! Reference rewriting for structural edits.
//!
//! One row/column insert, delete or move rewrites three classes of
//! references in the same pass: script tags, options-range strings, and
//! audit-log coordinates. The rules are identical for all three:
//!
//! - insert at `i`: indices >= `i` shift by +1
//! - delete at `d`: indices > `d` shift by -1; an index exactly at `d` is
//!   left dangling rather than silently remapped; a range straddling `d`
//!   shrinks by clamping its near edge
//! - move `from` -> `to`: indices between the bounds shift by one toward
//!   the gap the move closes, and `from` itself relocates to `to`

use gridscript_core::{shift_for_move, AuditEntry, CellCoord, CellRange};

use crate::parser::{parse_plain, rewrite_tags};
use crate::tag::{SheetKey, Tag};

/// Which axis a structural edit works on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Axis {
    Row,
    Col,
}

/// What the edit does to indices on that axis
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShiftKind {
    Insert(u32),
    Delete(u32),
    Move { from: u32, to: u32 },
}

/// A structural edit, as seen by the rewriter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShiftOp {
    pub axis: Axis,
    pub kind: ShiftKind,
}

impl ShiftOp {
    pub fn insert_row(at: u32) -> Self {
        ShiftOp {
            axis: Axis::Row,
            kind: ShiftKind::Insert(at),
        }
    }

    pub fn delete_row(at: u32) -> Self {
        ShiftOp {
            axis: Axis::Row,
            kind: ShiftKind::Delete(at),
        }
    }

    pub fn move_row(from: u32, to: u32) -> Self {
        ShiftOp {
            axis: Axis::Row,
            kind: ShiftKind::Move { from, to },
        }
    }

    pub fn insert_col(at: u32) -> Self {
        ShiftOp {
            axis: Axis::Col,
            kind: ShiftKind::Insert(at),
        }
    }

    pub fn delete_col(at: u32) -> Self {
        ShiftOp {
            axis: Axis::Col,
            kind: ShiftKind::Delete(at),
        }
    }

    pub fn move_col(from: u32, to: u32) -> Self {
        ShiftOp {
            axis: Axis::Col,
            kind: ShiftKind::Move { from, to },
        }
    }

    /// True when the edit cannot change anything (move onto itself)
    pub fn is_noop(&self) -> bool {
        matches!(self.kind, ShiftKind::Move { from, to } if from == to)
    }
}

/// Result of shifting one index
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexShift {
    Unchanged,
    To(u32),
    /// The referenced index was deleted; the reference is left as-is
    Dangling,
}

/// Apply a shift to a single 1-based index
pub fn shift_index(kind: ShiftKind, idx: u32) -> IndexShift {
    match kind {
        ShiftKind::Insert(at) => {
            if idx >= at {
                IndexShift::To(idx + 1)
            } else {
                IndexShift::Unchanged
            }
        }
        ShiftKind::Delete(at) => {
            if idx == at {
                IndexShift::Dangling
            } else if idx > at {
                IndexShift::To(idx - 1)
            } else {
                IndexShift::Unchanged
            }
        }
        ShiftKind::Move { from, to } => {
            let new = shift_for_move(idx, from, to);
            if new == idx {
                IndexShift::Unchanged
            } else {
                IndexShift::To(new)
            }
        }
    }
}

/// Result of shifting a range
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeShift {
    Unchanged,
    To(CellRange),
    Dangling,
}

/// Apply a shift to a range. Single cells follow the index rules; wider
/// ranges clamp their near edge on delete instead of going dangling.
pub fn shift_range(op: ShiftOp, range: CellRange) -> RangeShift {
    let (start, end) = match op.axis {
        Axis::Row => (range.start.row, range.end.row),
        Axis::Col => (range.start.col, range.end.col),
    };

    let (new_start, new_end) = if start == end {
        match shift_index(op.kind, start) {
            IndexShift::Unchanged => return RangeShift::Unchanged,
            IndexShift::Dangling => return RangeShift::Dangling,
            IndexShift::To(idx) => (idx, idx),
        }
    } else {
        match op.kind {
            ShiftKind::Insert(at) => (
                if start >= at { start + 1 } else { start },
                if end >= at { end + 1 } else { end },
            ),
            ShiftKind::Delete(at) => {
                let s = if start > at { start - 1 } else { start };
                let e = if end >= at { end - 1 } else { end };
                if e < s {
                    return RangeShift::Dangling;
                }
                (s, e)
            }
            ShiftKind::Move { from, to } => {
                let s = shift_for_move(start, from, to);
                let e = shift_for_move(end, from, to);
                (s.min(e), s.max(e))
            }
        }
    };

    if (new_start, new_end) == (start, end) {
        return RangeShift::Unchanged;
    }

    let shifted = match op.axis {
        Axis::Row => CellRange::new(
            CellCoord::new(new_start, range.start.col),
            CellCoord::new(new_end, range.end.col),
        ),
        Axis::Col => CellRange::new(
            CellCoord::new(range.start.row, new_start),
            CellCoord::new(range.end.row, new_end),
        ),
    };
    RangeShift::To(shifted)
}

/// Shift one tag belonging to a script on `home`, for an edit on `edited`.
/// Tags pointing at other sheets are untouched; dangling references keep
/// their original text.
pub fn shift_tag(op: ShiftOp, tag: &Tag, home: &SheetKey, edited: &SheetKey) -> Option<Tag> {
    if &tag.target(home) != edited {
        return None;
    }
    match shift_range(op, tag.range()) {
        RangeShift::To(range) => Some(tag.with_range(range)),
        RangeShift::Unchanged | RangeShift::Dangling => None,
    }
}

/// Rewrite every affected tag in a script. Returns the new text only when
/// something changed.
pub fn rewrite_script(
    script: &str,
    op: ShiftOp,
    home: &SheetKey,
    edited: &SheetKey,
) -> Option<String> {
    rewrite_tags(script, |tag| shift_tag(op, tag, home, edited))
}

/// Rewrite an options-range string ("A1:A10" or "project/sheet/A1:A10")
pub fn rewrite_options_range(
    text: &str,
    op: ShiftOp,
    home: &SheetKey,
    edited: &SheetKey,
) -> Option<String> {
    let tag = parse_plain(text)?;
    shift_tag(op, &tag, home, edited).map(|t| t.to_plain())
}

/// Shift the coordinates of an audit entry in place. Returns true when the
/// entry changed. Dangling coordinates are kept, the history entry simply
/// points at history.
pub fn shift_audit_entry(entry: &mut AuditEntry, op: ShiftOp) -> bool {
    let mut changed = false;
    {
        let coords: [&mut Option<u32>; 2] = match op.axis {
            Axis::Row => [&mut entry.row, &mut entry.row2],
            Axis::Col => [&mut entry.col, &mut entry.col2],
        };
        for coord in coords {
            if let Some(idx) = *coord {
                if let IndexShift::To(new) = shift_index(op.kind, idx) {
                    *coord = Some(new);
                    changed = true;
                }
            }
        }
    }
    changed
}

#[cfg(test)]
mod tests {
    use super::*;
    use gridscript_core::AuditAction;

    fn home() -> SheetKey {
        SheetKey::new("p", "S")
    }

    #[test]
    fn test_insert_shifts_tags_at_and_below() {
        let op = ShiftOp::insert_row(1);
        let out = rewrite_script("={{A1}}*2", op, &home(), &home()).unwrap();
        assert_eq!(out, "={{A2}}*2");

        // Above the insertion point nothing moves
        let op = ShiftOp::insert_row(5);
        assert_eq!(rewrite_script("={{A1}}*2", op, &home(), &home()), None);
    }

    #[test]
    fn test_delete_leaves_exact_hit_dangling() {
        let op = ShiftOp::delete_row(2);

        // Below the deleted row shifts up
        assert_eq!(
            rewrite_script("{{A3}}", op, &home(), &home()).unwrap(),
            "{{A2}}"
        );
        // The deleted row itself stays as a dangling reference
        assert_eq!(rewrite_script("{{A2}}", op, &home(), &home()), None);
        // Above is untouched
        assert_eq!(rewrite_script("{{A1}}", op, &home(), &home()), None);
    }

    #[test]
    fn test_delete_clamps_straddling_range() {
        let op = ShiftOp::delete_row(2);
        assert_eq!(
            rewrite_script("{{A1:A3}}", op, &home(), &home()).unwrap(),
            "{{A1:A2}}"
        );
        // Near edge exactly at the deleted row
        assert_eq!(
            rewrite_script("{{A2:A4}}", op, &home(), &home()).unwrap(),
            "{{A2:A3}}"
        );
    }

    #[test]
    fn test_insert_then_delete_is_identity() {
        let scripts = ["{{A1}}", "{{A3}}", "{{A5}}", "{{A1:A5}}", "{{B3:C4}}"];
        for script in scripts {
            let inserted = rewrite_script(script, ShiftOp::insert_row(3), &home(), &home())
                .unwrap_or_else(|| script.to_string());
            let restored = rewrite_script(&inserted, ShiftOp::delete_row(3), &home(), &home())
                .unwrap_or(inserted);
            assert_eq!(restored, script, "round trip failed for {script}");
        }
    }

    #[test]
    fn test_move_relocates_and_closes_gap() {
        let op = ShiftOp::move_row(1, 3);
        assert_eq!(
            rewrite_script("{{A1}}", op, &home(), &home()).unwrap(),
            "{{A3}}"
        );
        assert_eq!(
            rewrite_script("{{A2}}", op, &home(), &home()).unwrap(),
            "{{A1}}"
        );
        assert_eq!(rewrite_script("{{A4}}", op, &home(), &home()), None);

        let op = ShiftOp::move_row(3, 1);
        assert_eq!(
            rewrite_script("{{A1}}", op, &home(), &home()).unwrap(),
            "{{A2}}"
        );
    }

    #[test]
    fn test_move_onto_itself_is_noop() {
        let op = ShiftOp::move_row(2, 2);
        assert!(op.is_noop());
        assert_eq!(rewrite_script("{{A2}}", op, &home(), &home()), None);
    }

    #[test]
    fn test_column_shifts() {
        let op = ShiftOp::insert_col(2);
        assert_eq!(
            rewrite_script("{{B1}}+{{A1}}", op, &home(), &home()).unwrap(),
            "{{C1}}+{{A1}}"
        );

        let op = ShiftOp::delete_col(1);
        assert_eq!(
            rewrite_script("{{B1:C2}}", op, &home(), &home()).unwrap(),
            "{{A1:B2}}"
        );
    }

    #[test]
    fn test_only_tags_targeting_edited_sheet_shift() {
        let op = ShiftOp::insert_row(1);
        let edited = SheetKey::new("other", "Sheet1");

        // Local tag on an unedited sheet: untouched
        assert_eq!(rewrite_script("{{A1}}", op, &home(), &edited), None);

        // Remote tag pointing into the edited sheet: shifted
        let out = rewrite_script("{{other/Sheet1/A1}}", op, &home(), &edited).unwrap();
        assert_eq!(out, "{{other/Sheet1/A2}}");

        // Remote tag pointing elsewhere: untouched
        assert_eq!(
            rewrite_script("{{third/Sheet1/A1}}", op, &home(), &edited),
            None
        );
    }

    #[test]
    fn test_options_range_rewrite() {
        let op = ShiftOp::insert_row(1);
        assert_eq!(
            rewrite_options_range("A1:A10", op, &home(), &home()).unwrap(),
            "A2:A11"
        );
        assert_eq!(
            rewrite_options_range("p/S/A1:A10", op, &home(), &home()).unwrap(),
            "p/S/A2:A11"
        );
        assert_eq!(rewrite_options_range("garbage", op, &home(), &home()), None);
    }

    #[test]
    fn test_audit_entry_shift() {
        let mut entry = AuditEntry::cell_change("u", AuditAction::SetValue, 3, 2, "", "x");
        assert!(shift_audit_entry(&mut entry, ShiftOp::insert_row(2)));
        assert_eq!(entry.row, Some(4));
        assert_eq!(entry.col, Some(2));

        // Delete of the exact row leaves the coordinate dangling
        assert!(!shift_audit_entry(&mut entry, ShiftOp::delete_row(4)));
        assert_eq!(entry.row, Some(4));
    }
}
