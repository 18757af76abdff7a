//! Nom-based parser for the `{{...}}` tag grammar.
//!
//! Grammar, bit-exact with the wire syntax:
//!   `{{COL ROW}}` / `{{COL ROW:COL ROW}}`            same-sheet
//!   `{{path/.../sheet/COL ROW[:COL ROW]}}`            cross-sheet
//!
//! The cross-sheet body is resolved from the end: the last `/`-separated
//! segment is the range, the one before it the sheet name, and everything
//! remaining is the project path (which may itself contain `/`).

use nom::{
    bytes::complete::take_while1,
    character::complete::char,
    combinator::{all_consuming, opt},
    sequence::preceded,
    IResult,
};

use gridscript_core::{col_from_label, CellCoord, CellRange};

use crate::tag::{Tag, TagSpan};

/// Parse a single coordinate like "A1" or "AA100"
fn parse_coord(input: &str) -> IResult<&str, CellCoord> {
    let (input, col_letters) = take_while1(|c: char| c.is_ascii_uppercase())(input)?;
    let (input, row_digits) = take_while1(|c: char| c.is_ascii_digit())(input)?;

    let col = col_from_label(col_letters).ok_or_else(|| {
        nom::Err::Error(nom::error::Error::new(input, nom::error::ErrorKind::Fail))
    })?;
    let row: u32 = row_digits.parse().map_err(|_| {
        nom::Err::Error(nom::error::Error::new(input, nom::error::ErrorKind::Digit))
    })?;
    if row == 0 {
        return Err(nom::Err::Error(nom::error::Error::new(
            input,
            nom::error::ErrorKind::Verify,
        )));
    }

    Ok((input, CellCoord::new(row, col)))
}

/// Parse "A1" or "A1:B3"
fn parse_range(input: &str) -> IResult<&str, CellRange> {
    let (input, start) = parse_coord(input)?;
    let (input, end) = opt(preceded(char(':'), parse_coord))(input)?;
    Ok((input, CellRange::new(start, end.unwrap_or(start))))
}

/// Parse a complete range string, rejecting trailing garbage
pub fn range_from_str(input: &str) -> Option<CellRange> {
    all_consuming(parse_range)(input).ok().map(|(_, r)| r)
}

/// Parse the text between `{{` and `}}` into a tag
pub fn parse_body(body: &str) -> Option<Tag> {
    if let Some(range) = range_from_str(body) {
        return Some(Tag::Local(range));
    }

    // Cross-sheet form, resolved from the end
    let (rest, range_part) = body.rsplit_once('/')?;
    let range = range_from_str(range_part)?;
    let (project, sheet) = rest.rsplit_once('/')?;
    if project.is_empty() || sheet.is_empty() {
        return None;
    }

    Some(Tag::Remote {
        project: project.to_string(),
        sheet: sheet.to_string(),
        range,
    })
}

/// Parse a bare reference without braces, the options-range form
pub fn parse_plain(text: &str) -> Option<Tag> {
    parse_body(text.trim())
}

/// Find every well-formed tag in the text, with byte spans. Malformed
/// `{{...}}` tokens are skipped and stay literal text.
pub fn find_tags(text: &str) -> Vec<TagSpan> {
    let mut tags = Vec::new();
    let mut pos = 0;

    while let Some(open) = text[pos..].find("{{") {
        let start = pos + open;
        let Some(close) = text[start + 2..].find("}}") else {
            break;
        };
        let body_start = start + 2;
        let body_end = body_start + close;

        match parse_body(&text[body_start..body_end]) {
            Some(tag) => {
                tags.push(TagSpan {
                    start,
                    end: body_end + 2,
                    tag,
                });
                pos = body_end + 2;
            }
            // Not a tag; step past the braces so nested opens are still seen
            None => pos = start + 2,
        }
    }

    tags
}

/// Rewrite tags in place: `f` returns the replacement for each tag, or
/// `None` to leave it untouched. Returns the new text only when something
/// actually changed, so untouched scripts stay byte-identical.
pub fn rewrite_tags<F>(text: &str, mut f: F) -> Option<String>
where
    F: FnMut(&Tag) -> Option<Tag>,
{
    let spans = find_tags(text);
    let mut out = String::with_capacity(text.len());
    let mut last = 0;
    let mut changed = false;

    for span in &spans {
        if let Some(new_tag) = f(&span.tag) {
            if new_tag != span.tag {
                out.push_str(&text[last..span.start]);
                out.push_str(&new_tag.to_string());
                last = span.end;
                changed = true;
            }
        }
    }

    if changed {
        out.push_str(&text[last..]);
        Some(out)
    } else {
        None
    }
}
