//! Comment stripping and line continuation.

use kiln_core::error::{KilnError, Result};

/// A Dockerfile instruction after continuation lines have been joined.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogicalLine {
    pub begin: usize,
    pub end: usize,
    /// Upper-cased instruction word
    pub command: String,
    /// Trimmed remainder of the instruction
    pub raw: String,
}

/// Split Dockerfile text into logical lines.
///
/// Blank lines and `#` comments are dropped (this also swallows directive
/// comments). A line ending in `escape` is joined with the following
/// line, with only the escape token removed.
pub fn preprocess(content: &str, escape: char) -> Result<Vec<LogicalLine>> {
    let mut lines = Vec::new();
    let mut pending: Option<(usize, String)> = None;
    let mut last = 0;

    for (idx, physical) in content.lines().enumerate() {
        let number = idx + 1;
        let trimmed = physical.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        last = number;

        let (begin, mut text) = pending.take().unwrap_or((number, String::new()));
        match trimmed.strip_suffix(escape) {
            Some(head) => {
                text.push_str(head);
                pending = Some((begin, text));
            }
            None => {
                text.push_str(trimmed);
                lines.push(split_command(begin, number, &text)?);
            }
        }
    }

    // A trailing continuation still forms an instruction.
    if let Some((begin, text)) = pending {
        lines.push(split_command(begin, last, &text)?);
    }

    Ok(lines)
}

fn split_command(begin: usize, end: usize, text: &str) -> Result<LogicalLine> {
    let text = text.trim();
    let mut fields = text.splitn(2, char::is_whitespace);
    let command = fields.next().unwrap_or_default();
    let raw = fields.next().map(str::trim).unwrap_or_default();
    if command.is_empty() || raw.is_empty() {
        return Err(KilnError::syntax(
            begin,
            format!("instruction {:?} has no arguments", text),
        ));
    }

    Ok(LogicalLine {
        begin,
        end,
        command: command.to_ascii_uppercase(),
        raw: raw.to_string(),
    })
}
