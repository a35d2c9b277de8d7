//! Shell-style word expansion: `$name`, `${name}`, `${name:-word}` and
//! `${name:+word}`.
//!
//! Quotes are removed from the result. Single quotes suppress expansion,
//! `\$` produces a literal dollar sign. In strict mode (FROM arguments and
//! `COPY --from`) a variable that expands to nothing is an error.

use std::iter::Peekable;
use std::str::Chars;

use kiln_core::error::{KilnError, Result};

#[derive(Clone, Copy, PartialEq, Eq)]
enum Quote {
    None,
    Single,
    Double,
}

/// Expand `input`, looking variables up by name through `lookup`.
///
/// `lookup` returns `None` for an undefined variable and `Some("")` for a
/// variable defined as empty; only `${name:+word}` tells the two apart.
pub fn resolve_param<F>(input: &str, strict: bool, lookup: &F) -> Result<String>
where
    F: Fn(&str) -> Option<String>,
{
    let mut out = String::with_capacity(input.len());
    let mut quote = Quote::None;
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        match (quote, c) {
            (Quote::Single, '\'') => quote = Quote::None,
            (Quote::Single, c) => out.push(c),
            (_, '\\') => match chars.next() {
                Some(next @ ('$' | '"' | '\'' | '\\')) => out.push(next),
                Some(next) => {
                    out.push('\\');
                    out.push(next);
                }
                None if quote != Quote::None => {
                    return Err(KilnError::Expansion(format!(
                        "trailing escape inside quotes in {:?}",
                        input
                    )))
                }
                None => out.push('\\'),
            },
            (Quote::None, '\'') => quote = Quote::Single,
            (Quote::None, '"') => quote = Quote::Double,
            (Quote::Double, '"') => quote = Quote::None,
            (_, '$') => expand_variable(&mut chars, input, strict, lookup, &mut out)?,
            (_, c) => out.push(c),
        }
    }

    if quote != Quote::None {
        return Err(KilnError::Expansion(format!(
            "unterminated quote in {:?}",
            input
        )));
    }
    Ok(out)
}

fn is_name_start(c: char) -> bool {
    c.is_ascii_alphabetic()
}

fn is_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '-'
}

fn take_name(chars: &mut Peekable<Chars<'_>>) -> String {
    let mut name = String::new();
    while let Some(&c) = chars.peek() {
        if (name.is_empty() && !is_name_start(c)) || (!name.is_empty() && !is_name_char(c)) {
            break;
        }
        name.push(c);
        chars.next();
    }
    name
}

/// Handle the text after a `$`.
fn expand_variable<F>(
    chars: &mut Peekable<Chars<'_>>,
    input: &str,
    strict: bool,
    lookup: &F,
    out: &mut String,
) -> Result<()>
where
    F: Fn(&str) -> Option<String>,
{
    match chars.peek() {
        Some('{') => {
            chars.next();
            let body = take_braced(chars, input)?;
            out.push_str(&expand_braced(&body, input, strict, lookup)?);
        }
        Some(&c) if is_name_start(c) => {
            let name = take_name(chars);
            let value = lookup(&name).unwrap_or_default();
            if strict && value.is_empty() {
                return Err(unresolved(&name, input));
            }
            out.push_str(&value);
        }
        _ if strict => {
            return Err(KilnError::Expansion(format!(
                "unexpected '$' in {:?}",
                input
            )))
        }
        _ => out.push('$'),
    }
    Ok(())
}

/// Collect the text of a `${...}` up to its matching brace.
fn take_braced(chars: &mut Peekable<Chars<'_>>, input: &str) -> Result<String> {
    let mut body = String::new();
    let mut depth = 1;
    for c in chars.by_ref() {
        match c {
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Ok(body);
                }
            }
            _ => {}
        }
        body.push(c);
    }
    Err(KilnError::Expansion(format!(
        "missing '}}' in {:?}",
        input
    )))
}

fn expand_braced<F>(body: &str, input: &str, strict: bool, lookup: &F) -> Result<String>
where
    F: Fn(&str) -> Option<String>,
{
    let mut chars = body.chars().peekable();
    let name = take_name(&mut chars);
    if name.is_empty() {
        return Err(bad_substitution(input));
    }
    let modifier: String = chars.collect();

    if modifier.is_empty() {
        let value = lookup(&name).unwrap_or_default();
        if strict && value.is_empty() {
            return Err(unresolved(&name, input));
        }
        return Ok(value);
    }

    if let Some(word) = modifier.strip_prefix(":-") {
        let value = match lookup(&name) {
            Some(v) if !v.is_empty() => v,
            _ => resolve_param(word, false, lookup)?,
        };
        if strict && value.is_empty() {
            return Err(unresolved(&name, input));
        }
        return Ok(value);
    }

    if let Some(word) = modifier.strip_prefix(":+") {
        return match lookup(&name) {
            Some(_) => resolve_param(word, false, lookup),
            None => Ok(String::new()),
        };
    }

    Err(bad_substitution(input))
}

fn unresolved(name: &str, input: &str) -> KilnError {
    KilnError::Expansion(format!("variable {} in {:?} resolves to empty", name, input))
}

fn bad_substitution(input: &str) -> KilnError {
    KilnError::Expansion(format!("bad substitution in {:?}", input))
}
