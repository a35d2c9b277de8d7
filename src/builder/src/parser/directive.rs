//! Parser directives at the top of a Dockerfile.

use kiln_core::error::{KilnError, Result};
use once_cell::sync::Lazy;
use regex::Regex;

/// Escape token used when no `# escape=` directive is present.
pub const DEFAULT_ESCAPE: char = '\\';

static DIRECTIVE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^#\s*([A-Za-z][A-Za-z0-9_-]*)\s*=\s*(.*?)\s*$").expect("valid directive regex")
});

/// Scan the leading directive comments and return the escape token.
///
/// Scanning stops at the first line that is not an `escape` directive,
/// including blank lines, ordinary comments and other directives such as
/// `# syntax=`.
pub fn new_directive(content: &str) -> Result<char> {
    let mut escape: Option<char> = None;

    for line in content.lines() {
        let Some(caps) = DIRECTIVE_RE.captures(line.trim()) else {
            break;
        };
        if !caps[1].eq_ignore_ascii_case("escape") {
            break;
        }
        if escape.is_some() {
            return Err(KilnError::Directive(
                "only one escape directive supported".to_string(),
            ));
        }
        escape = Some(match &caps[2] {
            "\\" => '\\',
            "`" => '`',
            other => {
                return Err(KilnError::Directive(format!(
                    "invalid escape token {:?}, must be \\ or `",
                    other
                )))
            }
        });
    }

    Ok(escape.unwrap_or(DEFAULT_ESCAPE))
}
