//! Placement of script output into the sheet.
//!
//! A script cell may declare an output span larger than 1x1. The writer
//! releases the previous span, checks the target rectangle, locks the
//! covered cells, then distributes the parsed output: scalars into the
//! anchor, flat arrays along the single open axis, matrices row-major.

use std::collections::BTreeMap;

use gridscript_core::{Cell, CellCoord, CellId, CellRange, LockOwner, Sheet};
use serde_json::Value;

/// One observable cell change produced by writing script output. Dependents
/// of these cells are what the scheduler re-queues.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpanWrite {
    pub coord: CellCoord,
    pub old: String,
    pub new: String,
}

/// Structured form of a script's stdout
#[derive(Debug, Clone, PartialEq)]
enum Shape {
    Scalar(String),
    Flat(Vec<String>),
    Matrix(Vec<Vec<String>>),
}

fn value_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        other => other.to_string(),
    }
}

/// Translate a Python literal (repr-style output) into JSON text: single
/// quotes become double quotes, `True`/`False`/`None` become their JSON
/// spellings. Anything this cannot express simply fails the later parse.
fn pythonish_to_json(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars().peekable();
    let mut in_single = false;
    let mut in_double = false;

    while let Some(c) = chars.next() {
        if in_single {
            match c {
                '\\' => {
                    match chars.next() {
                        Some('\'') => out.push('\''),
                        Some(next) => {
                            out.push('\\');
                            out.push(next);
                        }
                        None => out.push('\\'),
                    }
                }
                '\'' => {
                    in_single = false;
                    out.push('"');
                }
                '"' => out.push_str("\\\""),
                _ => out.push(c),
            }
        } else if in_double {
            if c == '\\' {
                out.push(c);
                if let Some(next) = chars.next() {
                    out.push(next);
                }
            } else {
                if c == '"' {
                    in_double = false;
                }
                out.push(c);
            }
        } else {
            match c {
                '\'' => {
                    in_single = true;
                    out.push('"');
                }
                '"' => {
                    in_double = true;
                    out.push(c);
                }
                'A'..='Z' | 'a'..='z' => {
                    let mut word = String::new();
                    word.push(c);
                    while chars.peek().is_some_and(|n| n.is_ascii_alphanumeric() || *n == '_') {
                        word.push(chars.next().unwrap_or_default());
                    }
                    match word.as_str() {
                        "True" => out.push_str("true"),
                        "False" => out.push_str("false"),
                        "None" => out.push_str("null"),
                        other => out.push_str(other),
                    }
                }
                _ => out.push(c),
            }
        }
    }
    out
}

/// Parse stdout as JSON, then as a Python literal; anything unparseable is
/// a scalar carrying the raw text.
fn classify(raw: &str) -> Shape {
    let trimmed = raw.trim();

    let parsed = serde_json::from_str::<Value>(trimmed)
        .or_else(|_| serde_json::from_str::<Value>(&pythonish_to_json(trimmed)));

    let value = match parsed {
        Ok(v) => v,
        Err(_) => return Shape::Scalar(raw.to_string()),
    };

    match value {
        Value::Array(items) => {
            let all_arrays = !items.is_empty() && items.iter().all(Value::is_array);
            let no_arrays = !items.iter().any(Value::is_array);

            if all_arrays {
                let rows = items
                    .into_iter()
                    .filter_map(|row| match row {
                        Value::Array(cols) => Some(cols.iter().map(value_text).collect()),
                        _ => None,
                    })
                    .collect();
                Shape::Matrix(rows)
            } else if no_arrays {
                Shape::Flat(items.iter().map(value_text).collect())
            } else {
                // Ragged mix of scalars and arrays stays raw text
                Shape::Scalar(raw.to_string())
            }
        }
        other => Shape::Scalar(value_text(&other)),
    }
}

fn occupies(cell: &Cell) -> bool {
    !cell.value.is_empty() || cell.has_script() || cell.is_locked()
}

/// Write a script's output into its sheet and return every cell whose
/// visible value changed.
///
/// A self-referencing script writes its anchor result into the shadow
/// `script_output` field so the stable `value` it reads stays intact.
pub fn write_output(
    sheet: &mut Sheet,
    anchor: CellCoord,
    owner: CellId,
    raw: &str,
    self_ref: bool,
) -> Vec<SpanWrite> {
    // Coord -> (old, new); releases and writes to the same cell collapse
    // into a single record keeping the original old value.
    let mut changes: BTreeMap<CellCoord, (String, String)> = BTreeMap::new();

    for (coord, old) in sheet.release_span_locks(owner) {
        changes.insert(coord, (old, String::new()));
    }

    let (mut row_span, mut col_span) = sheet
        .cell(anchor)
        .map(|c| (c.output_row_span.max(1), c.output_col_span.max(1)))
        .unwrap_or((1, 1));

    let rect = CellRange::new(
        anchor,
        CellCoord::new(anchor.row + row_span - 1, anchor.col + col_span - 1),
    );

    if (row_span > 1 || col_span > 1)
        && rect
            .iter()
            .filter(|c| *c != anchor)
            .any(|c| sheet.cell(c).is_some_and(occupies))
    {
        tracing::debug!("span at {anchor} collapsed to 1x1: target area occupied");
        row_span = 1;
        col_span = 1;
    }

    if row_span > 1 || col_span > 1 {
        for coord in rect.iter().filter(|c| *c != anchor) {
            sheet.cell_mut(coord).lock = Some(LockOwner::ScriptSpan(owner));
        }
    }

    let mut fills: Vec<(CellCoord, String)> = Vec::new();
    let anchor_text = match classify(raw) {
        Shape::Scalar(text) => text,
        Shape::Matrix(rows) => {
            let fits = rows.len() as u32 <= row_span
                && rows.iter().map(Vec::len).max().unwrap_or(0) as u32 <= col_span;
            if fits {
                let mut first = String::new();
                for (r, cols) in rows.into_iter().enumerate() {
                    for (c, text) in cols.into_iter().enumerate() {
                        let coord =
                            CellCoord::new(anchor.row + r as u32, anchor.col + c as u32);
                        if coord == anchor {
                            first = text;
                        } else {
                            fills.push((coord, text));
                        }
                    }
                }
                first
            } else {
                raw.to_string()
            }
        }
        Shape::Flat(items) => {
            let len = items.len() as u32;
            if row_span == 1 && len <= col_span {
                let mut first = String::new();
                for (c, text) in items.into_iter().enumerate() {
                    if c == 0 {
                        first = text;
                    } else {
                        fills.push((CellCoord::new(anchor.row, anchor.col + c as u32), text));
                    }
                }
                first
            } else if col_span == 1 && len <= row_span {
                let mut first = String::new();
                for (r, text) in items.into_iter().enumerate() {
                    if r == 0 {
                        first = text;
                    } else {
                        fills.push((CellCoord::new(anchor.row + r as u32, anchor.col), text));
                    }
                }
                first
            } else {
                raw.to_string()
            }
        }
    };

    {
        let cell = sheet.cell_mut(anchor);
        let old = if self_ref {
            std::mem::replace(&mut cell.script_output, anchor_text.clone())
        } else {
            std::mem::replace(&mut cell.value, anchor_text.clone())
        };
        changes
            .entry(anchor)
            .and_modify(|c| c.1 = anchor_text.clone())
            .or_insert((old, anchor_text));
    }

    for (coord, text) in fills {
        let cell = sheet.cell_mut(coord);
        let old = std::mem::replace(&mut cell.value, text.clone());
        changes
            .entry(coord)
            .and_modify(|c| c.1 = text.clone())
            .or_insert((old, text));
    }

    changes
        .into_iter()
        .filter(|(_, (old, new))| old != new)
        .map(|(coord, (old, new))| SpanWrite { coord, old, new })
        .collect()
}
