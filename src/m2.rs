//! Reader for the M2 annotation format.
//!
//! Each block starts with an `S` line holding the tokenized source sentence
//! and is followed by `A` lines of the form
//! `start end|||type|||correction|||required|||comment|||annotator`.
//! Blocks are separated by blank lines.

use std::fs;
use std::path::Path;

use crate::error::{Error, Result};

const SKIPPED_TYPES: [&str; 3] = ["noop", "UNK", "Um"];

#[derive(Debug, Clone, PartialEq)]
struct Edit {
    start: usize,
    end: usize,
    kind: String,
    correction: String,
    annotator: u32,
}

/// Reads an M2 file and returns the corrected sentence of every block, in
/// file order, using the edits of annotator 0.
pub fn read_raw(path: impl AsRef<Path>) -> Result<Vec<String>> {
    let content = fs::read_to_string(path)?;
    parse(&content)
}

pub(crate) fn parse(content: &str) -> Result<Vec<String>> {
    let mut sentences = Vec::new();
    let mut source: Option<Vec<&str>> = None;
    let mut edits = Vec::new();

    for (index, line) in content.lines().enumerate() {
        let line_no = index + 1;
        let line = line.trim_end();

        if let Some(rest) = line.strip_prefix("S ") {
            if let Some(tokens) = source.take() {
                sentences.push(apply_edits(tokens, &edits));
                edits.clear();
            }
            source = Some(rest.split_whitespace().collect());
        } else if line == "S" {
            if let Some(tokens) = source.take() {
                sentences.push(apply_edits(tokens, &edits));
                edits.clear();
            }
            source = Some(Vec::new());
        } else if let Some(rest) = line.strip_prefix("A ") {
            if source.is_none() {
                return Err(Error::M2Parse {
                    line: line_no,
                    message: "edit line before any source sentence".to_string(),
                });
            }
            edits.push(parse_edit(rest, line_no)?);
        } else if line.is_empty() {
            if let Some(tokens) = source.take() {
                sentences.push(apply_edits(tokens, &edits));
                edits.clear();
            }
        } else {
            return Err(Error::M2Parse {
                line: line_no,
                message: format!("unexpected line {:?}", line),
            });
        }
    }
    if let Some(tokens) = source.take() {
        sentences.push(apply_edits(tokens, &edits));
    }
    Ok(sentences)
}

fn parse_edit(rest: &str, line: usize) -> Result<Edit> {
    let malformed = |message: &str| Error::M2Parse {
        line,
        message: message.to_string(),
    };

    let fields: Vec<&str> = rest.split("|||").collect();
    if fields.len() < 3 {
        return Err(malformed("edit line needs span, type and correction"));
    }
    let mut span = fields[0].split_whitespace();
    let (start, end) = match (span.next(), span.next()) {
        (Some(s), Some(e)) => (
            s.parse::<i64>().map_err(|_| malformed("invalid span start"))?,
            e.parse::<i64>().map_err(|_| malformed("invalid span end"))?,
        ),
        _ => return Err(malformed("edit span needs start and end")),
    };
    let annotator = match fields.last() {
        Some(a) if fields.len() >= 6 => a.trim().parse().map_err(|_| malformed("invalid annotator id"))?,
        _ => 0,
    };

    // noop edits carry a `-1 -1` span.
    let (start, end) = if start < 0 || end < 0 {
        (0, 0)
    } else if end < start {
        return Err(malformed("edit span ends before it starts"));
    } else {
        (start as usize, end as usize)
    };

    Ok(Edit {
        start,
        end,
        kind: fields[1].to_string(),
        correction: fields[2].to_string(),
        annotator,
    })
}

fn apply_edits<'a>(mut tokens: Vec<&'a str>, edits: &'a [Edit]) -> String {
    let mut selected: Vec<&Edit> = edits
        .iter()
        .filter(|e| e.annotator == 0 && !SKIPPED_TYPES.contains(&e.kind.as_str()))
        .collect();
    // Right to left so earlier spans keep their offsets.
    selected.sort_by(|a, b| b.start.cmp(&a.start).then(b.end.cmp(&a.end)));

    for edit in selected {
        let end = edit.end.min(tokens.len());
        let start = edit.start.min(end);
        let replacement: Vec<&str> = edit.correction.split_whitespace().collect();
        tokens.splice(start..end, replacement);
    }
    tokens.join(" ")
}
