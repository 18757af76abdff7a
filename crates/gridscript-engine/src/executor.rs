//! Tag substitution: turns script text with `{{...}}` references into a
//! concrete program the runtime can execute.

use gridscript_core::{CellCoord, Sheet};
use gridscript_tags::{extract, find_tags, SheetKey, Tag};

use crate::store::Workbooks;

/// Render one cell value as a program literal: numeric text stays unquoted,
/// everything else is JSON-quoted so arbitrary content cannot break out of
/// the substituted program. The digit filter keeps float-parseable words
/// like "inf" and "NaN" quoted.
fn literal(text: &str) -> String {
    let numeric = !text.is_empty()
        && text
            .chars()
            .all(|c| c.is_ascii_digit() || c == '.' || c == '-')
        && text.parse::<f64>().is_ok();
    if numeric {
        text.to_string()
    } else {
        serde_json::to_string(text).unwrap_or_else(|_| "\"\"".to_string())
    }
}

/// The value a tag substitution reads from a cell. A script reading its own
/// cell gets the stable `value`, never the shadow output it is about to
/// overwrite; every other reader sees the shadow when present.
fn read_cell(sheet: &Sheet, coord: CellCoord, is_self: bool) -> String {
    match sheet.cell(coord) {
        Some(cell) if is_self => cell.value.clone(),
        Some(cell) => cell.visible_value().to_string(),
        None => String::new(),
    }
}

/// Literal text for one tag: a single value for a single cell, a row-major
/// array of arrays for a range. Missing sheets and cells resolve to the
/// empty string.
fn tag_literal(
    tag: &Tag,
    home: &SheetKey,
    anchor: CellCoord,
    books: &Workbooks,
) -> String {
    let target = tag.target(home);
    let range = tag.range();
    let sheet = books.get(&target);

    if range.is_single_cell() {
        let value = sheet
            .map(|s| read_cell(s, range.start, target == *home && range.start == anchor))
            .unwrap_or_default();
        return literal(&value);
    }

    let mut rows = Vec::with_capacity(range.row_count() as usize);
    for row in range.start.row..=range.end.row {
        let mut cols = Vec::with_capacity(range.col_count() as usize);
        for col in range.start.col..=range.end.col {
            let coord = CellCoord::new(row, col);
            let value = sheet
                .map(|s| read_cell(s, coord, target == *home && coord == anchor))
                .unwrap_or_default();
            cols.push(literal(&value));
        }
        rows.push(format!("[{}]", cols.join(", ")));
    }
    format!("[{}]", rows.join(", "))
}

/// Replace every tag in the script with its literal value. Cross-sheet tags
/// substitute exactly like local ones; malformed tags stay literal text.
pub fn substitute_tags(
    script: &str,
    home: &SheetKey,
    anchor: CellCoord,
    books: &Workbooks,
) -> String {
    let spans = find_tags(script);
    let mut out = String::with_capacity(script.len());
    let mut last = 0;

    for span in &spans {
        out.push_str(&script[last..span.start]);
        out.push_str(&tag_literal(&span.tag, home, anchor, books));
        last = span.end;
    }
    out.push_str(&script[last..]);
    out
}

/// Shape the substituted text into a runnable program. A leading `=` is
/// stripped; a single-line script with no print call is treated as an
/// expression and wrapped so its result lands on stdout. Multi-line
/// programs are passed through and must print their own result.
pub fn prepare_program(substituted: &str) -> String {
    let body = substituted.trim().strip_prefix('=').unwrap_or(substituted.trim());
    let body = body.trim();

    if !body.is_empty() && !body.contains('\n') && !body.contains("print") {
        format!("print({}, end='')", body)
    } else {
        body.to_string()
    }
}

/// Whether the script depends on its own cell, directly or via a range
/// containing it. Tagless scripts carry an implicit self-dependency.
pub fn is_self_referencing(script: &str, home: &SheetKey, anchor: CellCoord) -> bool {
    extract(script, home, anchor)
        .iter()
        .any(|dep| dep.target == *home && dep.range.contains(anchor))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn coord(a1: &str) -> CellCoord {
        CellCoord::from_a1(a1).unwrap()
    }

    fn books_with(values: &[(&str, &str)]) -> (Workbooks, SheetKey) {
        let key = SheetKey::new("p", "S");
        let mut books = Workbooks::new();
        let sheet = books.open(&key);
        for (a1, value) in values {
            sheet.set_value(coord(a1), *value);
        }
        (books, key)
    }

    #[test]
    fn test_numeric_values_substitute_unquoted() {
        let (books, key) = books_with(&[("A1", "5")]);
        let out = substitute_tags("{{A1}}*2", &key, coord("B1"), &books);
        assert_eq!(out, "5*2");
    }

    #[test]
    fn test_text_values_substitute_quoted() {
        let (books, key) = books_with(&[("A1", "he said \"hi\"")]);
        let out = substitute_tags("{{A1}}", &key, coord("B1"), &books);
        assert_eq!(out, "\"he said \\\"hi\\\"\"");
    }

    #[test]
    fn test_float_like_words_substitute_quoted() {
        let (books, key) = books_with(&[
            ("A1", "inf"),
            ("A2", "NaN"),
            ("A3", "+5"),
            ("A4", "-2.5"),
        ]);
        assert_eq!(substitute_tags("{{A1}}", &key, coord("B1"), &books), "\"inf\"");
        assert_eq!(substitute_tags("{{A2}}", &key, coord("B1"), &books), "\"NaN\"");
        assert_eq!(substitute_tags("{{A3}}", &key, coord("B1"), &books), "\"+5\"");
        assert_eq!(substitute_tags("{{A4}}", &key, coord("B1"), &books), "-2.5");
    }

    #[test]
    fn test_missing_reference_substitutes_empty_string() {
        let (books, key) = books_with(&[]);
        assert_eq!(
            substitute_tags("{{A9}}", &key, coord("B1"), &books),
            "\"\""
        );
        assert_eq!(
            substitute_tags("{{nope/Nowhere/A1}}", &key, coord("B1"), &books),
            "\"\""
        );
    }

    #[test]
    fn test_range_substitutes_row_major_matrix() {
        let (books, key) = books_with(&[("A1", "1"), ("B1", "x"), ("A2", "3")]);
        let out = substitute_tags("{{A1:B2}}", &key, coord("C1"), &books);
        assert_eq!(out, "[[1, \"x\"], [3, \"\"]]");
    }

    #[test]
    fn test_cross_sheet_tags_substitute() {
        let mut books = Workbooks::new();
        let other = SheetKey::new("proj2", "Sheet1");
        books.open(&other).set_value(coord("A1"), "7");

        let home = SheetKey::new("proj1", "SheetX");
        let out = substitute_tags("{{proj2/Sheet1/A1}}+1", &home, coord("A1"), &books);
        assert_eq!(out, "7+1");
    }

    #[test]
    fn test_self_reference_reads_stable_value_not_shadow() {
        let key = SheetKey::new("p", "S");
        let mut books = Workbooks::new();
        {
            let sheet = books.open(&key);
            let cell = sheet.cell_mut(coord("A1"));
            cell.value = "5".to_string();
            cell.script_output = "999".to_string();
        }

        // The script in A1 reading A1 sees the stable value
        let out = substitute_tags("{{A1}}+1", &key, coord("A1"), &books);
        assert_eq!(out, "5+1");

        // A script elsewhere sees the shadow output
        let out = substitute_tags("{{A1}}+1", &key, coord("B1"), &books);
        assert_eq!(out, "999+1");
    }

    #[test]
    fn test_prepare_program() {
        assert_eq!(prepare_program("=5*2"), "print(5*2, end='')");
        assert_eq!(prepare_program("5*2"), "print(5*2, end='')");
        assert_eq!(prepare_program("print(42)"), "print(42)");
        assert_eq!(
            prepare_program("x = 1\nprint(x)"),
            "x = 1\nprint(x)"
        );
        assert_eq!(prepare_program(""), "");
    }

    #[test]
    fn test_is_self_referencing() {
        let key = SheetKey::new("p", "S");
        assert!(is_self_referencing("{{A1}}", &key, coord("A1")));
        assert!(is_self_referencing("{{A1:A5}}", &key, coord("A3")));
        assert!(!is_self_referencing("{{A1}}", &key, coord("B1")));
        assert!(!is_self_referencing("{{q/T/B1}}", &key, coord("B1")));
        // Tagless scripts implicitly depend on their own cell
        assert!(is_self_referencing("print(42)", &key, coord("B1")));
    }
}
