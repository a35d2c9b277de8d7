//! Per-instruction argument grammar.

use kiln_core::error::{KilnError, Result};
use once_cell::sync::Lazy;
use regex::Regex;

use super::flags::extract_flags;
use super::preprocess::LogicalLine;
use super::{Cell, Keyword, Line, ATTRIBUTE_FLAG};

static JSON_ARRAY_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)^\s*\[.*\]\s*$").expect("valid json array regex"));

static ARG_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?s)^([A-Za-z_][A-Za-z0-9_]*)(?:=(.*))?$").expect("valid arg regex")
});

/// Parse one logical line into a structured [`Line`].
pub(crate) fn parse_line(logical: &LogicalLine) -> Result<Line> {
    let keyword = Keyword::lookup(&logical.command).ok_or_else(|| {
        KilnError::syntax(
            logical.begin,
            format!("unknown instruction {}", logical.command),
        )
    })?;
    parse_instruction(keyword, &logical.raw, logical.begin, logical.end)
}

fn parse_instruction(keyword: Keyword, raw: &str, begin: usize, end: usize) -> Result<Line> {
    let mut line = Line::new(keyword, raw, begin, end);
    let (flags, rest) = extract_flags(keyword, raw, begin)?;
    line.flags = flags;

    match keyword {
        Keyword::Add | Keyword::Copy => parse_copy(&mut line, &rest)?,
        Keyword::Arg => parse_arg(&mut line, &rest)?,
        Keyword::Cmd | Keyword::Entrypoint | Keyword::Run => parse_command(&mut line, &rest)?,
        Keyword::Env | Keyword::Label => parse_key_values(&mut line, &rest)?,
        Keyword::Expose => parse_fields(&mut line, &rest, 1, None)?,
        Keyword::From => parse_from(&mut line, &rest)?,
        Keyword::Healthcheck => parse_healthcheck(&mut line, &rest)?,
        Keyword::Maintainer | Keyword::Workdir => line.cells = vec![Cell::new(rest)],
        Keyword::Onbuild => parse_onbuild(&mut line, &rest)?,
        Keyword::Shell => {
            if !is_json_form(&rest) {
                return Err(syntax(&line, "SHELL requires the JSON array form"));
            }
            parse_json_cells(&mut line, &rest)?;
            require_cells(&line, 1, None)?;
        }
        Keyword::Stopsignal | Keyword::User => parse_fields(&mut line, &rest, 1, Some(1))?,
        Keyword::Volume => {
            if is_json_form(&rest) {
                parse_json_cells(&mut line, &rest)?;
                require_cells(&line, 1, None)?;
            } else {
                parse_fields(&mut line, &rest, 1, None)?;
            }
        }
    }

    Ok(line)
}

fn syntax(line: &Line, message: impl Into<String>) -> KilnError {
    KilnError::syntax(line.begin, message)
}

fn is_json_form(text: &str) -> bool {
    JSON_ARRAY_RE.is_match(text)
}

fn require_cells(line: &Line, min: usize, max: Option<usize>) -> Result<()> {
    let n = line.cells.len();
    if n < min || max.is_some_and(|max| n > max) {
        let expected = match max {
            Some(max) if max == min => format!("exactly {}", min),
            Some(max) => format!("between {} and {}", min, max),
            None => format!("at least {}", min),
        };
        return Err(syntax(
            line,
            format!("{} requires {} argument(s), got {}", line.command, expected, n),
        ));
    }
    Ok(())
}

/// Decode a JSON array of strings and tag the line as JSON form.
fn parse_json_cells(line: &mut Line, text: &str) -> Result<()> {
    let value: serde_json::Value = serde_json::from_str(text.trim())
        .map_err(|e| syntax(line, format!("invalid JSON array {:?}: {}", text, e)))?;
    let serde_json::Value::Array(items) = value else {
        return Err(syntax(line, format!("expected a JSON array, got {:?}", text)));
    };

    let mut cells = Vec::with_capacity(items.len());
    for item in items {
        match item {
            serde_json::Value::String(s) => cells.push(Cell::new(s)),
            other => {
                return Err(syntax(
                    line,
                    format!("only string type allowed in JSON array, got {}", other),
                ))
            }
        }
    }
    line.cells = cells;
    line.flags
        .insert(ATTRIBUTE_FLAG.to_string(), "json".to_string());
    Ok(())
}

fn parse_fields(line: &mut Line, text: &str, min: usize, max: Option<usize>) -> Result<()> {
    line.cells = text.split_whitespace().map(Cell::new).collect();
    require_cells(line, min, max)
}

fn parse_copy(line: &mut Line, text: &str) -> Result<()> {
    if is_json_form(text) {
        parse_json_cells(line, text)?;
    } else {
        line.cells = text.split_whitespace().map(Cell::new).collect();
    }
    require_cells(line, 2, None)
}

fn parse_arg(line: &mut Line, text: &str) -> Result<()> {
    let caps = ARG_RE
        .captures(text)
        .ok_or_else(|| syntax(line, format!("invalid ARG {:?}, expected name[=value]", text)))?;
    line.cells = vec![Cell::new(&caps[1])];
    if let Some(value) = caps.get(2) {
        line.cells.push(Cell::new(value.as_str()));
    }
    Ok(())
}

/// CMD, ENTRYPOINT and RUN: a JSON argv, or one shell-form string.
fn parse_command(line: &mut Line, text: &str) -> Result<()> {
    if is_json_form(text) {
        return parse_json_cells(line, text);
    }
    if text.is_empty() {
        return Err(syntax(line, format!("{} requires a command", line.command)));
    }
    line.cells = vec![Cell::new(text)];
    Ok(())
}

fn parse_from(line: &mut Line, text: &str) -> Result<()> {
    let fields: Vec<&str> = text.split_whitespace().collect();
    match fields.as_slice() {
        [_] => {}
        [_, as_word, _] if as_word.eq_ignore_ascii_case("AS") => {}
        _ => {
            return Err(syntax(
                line,
                format!("FROM requires \"image [AS name]\", got {:?}", text),
            ))
        }
    }
    line.cells = fields.into_iter().map(Cell::new).collect();
    Ok(())
}

fn parse_healthcheck(line: &mut Line, text: &str) -> Result<()> {
    let (word, rest) = split_first_word(text);
    if word.eq_ignore_ascii_case("NONE") {
        if !rest.is_empty() {
            return Err(syntax(line, "HEALTHCHECK NONE takes no arguments"));
        }
        if !line.flags.is_empty() {
            return Err(syntax(line, "HEALTHCHECK NONE takes no flags"));
        }
        line.cells = vec![Cell::new("NONE")];
        return Ok(());
    }
    if !word.eq_ignore_ascii_case("CMD") || rest.is_empty() {
        return Err(syntax(
            line,
            format!("HEALTHCHECK requires \"CMD command\" or \"NONE\", got {:?}", text),
        ));
    }

    let command = parse_instruction(Keyword::Cmd, rest, line.begin, line.end)?;
    line.cells = command.cells.clone();
    if command.is_json() {
        line.flags
            .insert(ATTRIBUTE_FLAG.to_string(), "json".to_string());
    }
    line.embedded = Some(Box::new(command));
    Ok(())
}

fn parse_onbuild(line: &mut Line, text: &str) -> Result<()> {
    let (word, rest) = split_first_word(text);
    let trigger = Keyword::lookup(word)
        .ok_or_else(|| syntax(line, format!("unknown ONBUILD trigger instruction {}", word)))?;
    if !trigger.allowed_in_onbuild() {
        return Err(KilnError::Semantic(format!(
            "line {}: {} is not allowed as an ONBUILD trigger",
            line.begin, trigger
        )));
    }
    if rest.is_empty() {
        return Err(syntax(line, format!("ONBUILD {} requires arguments", trigger)));
    }

    let parsed = parse_instruction(trigger, rest, line.begin, line.end)?;
    line.cells = vec![Cell::new(text)];
    line.embedded = Some(Box::new(parsed));
    Ok(())
}

/// ENV and LABEL: `key value` or one or more `key=value` pairs.
///
/// Cells alternate key and value. Quotes are kept for word expansion.
fn parse_key_values(line: &mut Line, text: &str) -> Result<()> {
    let words = split_quoted_words(text).map_err(|msg| syntax(line, msg))?;
    let Some(first) = words.first() else {
        return Err(syntax(line, format!("{} requires arguments", line.command)));
    };

    if find_unquoted_eq(first).is_none() {
        let (key, value) = split_first_word(text);
        if value.is_empty() {
            return Err(syntax(
                line,
                format!("{} {} is missing a value", line.command, key),
            ));
        }
        line.cells = vec![Cell::new(key), Cell::new(value)];
        return Ok(());
    }

    let mut cells = Vec::with_capacity(words.len() * 2);
    for word in &words {
        let Some(pos) = find_unquoted_eq(word) else {
            return Err(syntax(
                line,
                format!("{} expects key=value pairs, got {:?}", line.command, word),
            ));
        };
        let (key, value) = (&word[..pos], &word[pos + 1..]);
        if key.is_empty() {
            return Err(syntax(line, format!("{} has an empty key in {:?}", line.command, word)));
        }
        cells.push(Cell::new(key));
        cells.push(Cell::new(value));
    }
    line.cells = cells;
    Ok(())
}

/// Split on unquoted whitespace, keeping quotes and backslashes.
fn split_quoted_words(text: &str) -> std::result::Result<Vec<String>, String> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;
    let mut chars = text.chars();

    while let Some(c) = chars.next() {
        match (quote, c) {
            (Some('\''), '\'') => {
                quote = None;
                current.push(c);
            }
            (Some('\''), _) => current.push(c),
            (_, '\\') => {
                current.push(c);
                if let Some(next) = chars.next() {
                    current.push(next);
                }
            }
            (Some('"'), '"') => {
                quote = None;
                current.push(c);
            }
            (None, '"' | '\'') => {
                quote = Some(c);
                current.push(c);
            }
            (None, c) if c.is_whitespace() => {
                if !current.is_empty() {
                    words.push(std::mem::take(&mut current));
                }
            }
            _ => current.push(c),
        }
    }

    if let Some(q) = quote {
        return Err(format!("unterminated {} quote in {:?}", q, text));
    }
    if !current.is_empty() {
        words.push(current);
    }
    Ok(words)
}

/// Position of the first `=` outside quotes and not escaped.
fn find_unquoted_eq(word: &str) -> Option<usize> {
    let mut quote: Option<char> = None;
    let mut escaped = false;
    for (i, c) in word.char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match (quote, c) {
            (Some('\''), '\'') | (Some('"'), '"') => quote = None,
            (Some('\''), _) => {}
            (_, '\\') => escaped = true,
            (None, '"' | '\'') => quote = Some(c),
            (None, '=') => return Some(i),
            _ => {}
        }
    }
    None
}

fn split_first_word(s: &str) -> (&str, &str) {
    let s = s.trim();
    match s.find(char::is_whitespace) {
        Some(pos) => (&s[..pos], s[pos..].trim_start()),
        None => (s, ""),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(command: &str, raw: &str) -> Result<Line> {
        parse_line(&LogicalLine {
            begin: 1,
            end: 1,
            command: command.to_string(),
            raw: raw.to_string(),
        })
    }

    fn values(line: &Line) -> Vec<&str> {
        line.cells.iter().map(|c| c.value.as_str()).collect()
    }

    #[test]
    fn test_unknown_instruction() {
        assert!(matches!(parse("FORM", "alpine"), Err(KilnError::Syntax { .. })));
    }

    // --- FROM ---

    #[test]
    fn test_parse_from_simple() {
        let line = parse("FROM", "alpine:3.19").unwrap();
        assert_eq!(values(&line), vec!["alpine:3.19"]);
    }

    #[test]
    fn test_parse_from_with_alias() {
        let line = parse("FROM", "rust:1.75 as builder").unwrap();
        assert_eq!(values(&line), vec!["rust:1.75", "as", "builder"]);
    }

    #[test]
    fn test_parse_from_bad_arity() {
        assert!(parse("FROM", "a b").is_err());
        assert!(parse("FROM", "a AS").is_err());
        assert!(parse("FROM", "a IS b").is_err());
        assert!(parse("FROM", "a AS b c").is_err());
    }

    // --- RUN / CMD / ENTRYPOINT ---

    #[test]
    fn test_parse_run_shell() {
        let line = parse("RUN", "apt-get update && apt-get install -y curl").unwrap();
        assert_eq!(values(&line), vec!["apt-get update && apt-get install -y curl"]);
        assert!(!line.is_json());
    }

    #[test]
    fn test_parse_cmd_json() {
        let line = parse("CMD", r#"["sleep", "1"]"#).unwrap();
        assert_eq!(values(&line), vec!["sleep", "1"]);
        assert!(line.is_json());
    }

    #[test]
    fn test_parse_json_non_string_rejected() {
        let err = parse("ENTRYPOINT", r#"["sleep", 1]"#).unwrap_err();
        assert!(err.to_string().contains("only string type allowed"));
    }

    #[test]
    fn test_parse_json_invalid() {
        assert!(parse("CMD", r#"["sleep", ]"#).is_err());
    }

    // --- ADD / COPY ---

    #[test]
    fn test_parse_copy_simple() {
        let line = parse("COPY", "--chown=app a.txt b.txt /dst/").unwrap();
        assert_eq!(values(&line), vec!["a.txt", "b.txt", "/dst/"]);
        assert_eq!(line.flag("chown"), Some("app"));
        assert_eq!(line.raw, "--chown=app a.txt b.txt /dst/");
    }

    #[test]
    fn test_parse_copy_json() {
        let line = parse("COPY", r#"["my file", "/dst"]"#).unwrap();
        assert_eq!(values(&line), vec!["my file", "/dst"]);
    }

    #[test]
    fn test_parse_copy_single_arg() {
        assert!(parse("COPY", "only").is_err());
        assert!(parse("ADD", "--chown=1 only").is_err());
    }

    // --- ARG ---

    #[test]
    fn test_parse_arg() {
        assert_eq!(values(&parse("ARG", "VERSION").unwrap()), vec!["VERSION"]);
        assert_eq!(values(&parse("ARG", "VERSION=1.0").unwrap()), vec!["VERSION", "1.0"]);
        assert_eq!(values(&parse("ARG", "EMPTY=").unwrap()), vec!["EMPTY", ""]);
        assert!(parse("ARG", "1BAD").is_err());
        assert!(parse("ARG", "A B").is_err());
    }

    // --- ENV / LABEL ---

    #[test]
    fn test_parse_env_pairs() {
        let line = parse("ENV", r#"A=1 B="two words" C=x=y"#).unwrap();
        assert_eq!(values(&line), vec!["A", "1", "B", "\"two words\"", "C", "x=y"]);
    }

    #[test]
    fn test_parse_env_legacy() {
        let line = parse("ENV", "PATH /usr/local/bin:/usr/bin").unwrap();
        assert_eq!(values(&line), vec!["PATH", "/usr/local/bin:/usr/bin"]);

        let line = parse("ENV", "GREETING hello world").unwrap();
        assert_eq!(values(&line), vec!["GREETING", "hello world"]);
    }

    #[test]
    fn test_parse_env_errors() {
        assert!(parse("ENV", "KEY").is_err());
        assert!(parse("ENV", "A=1 B").is_err());
        assert!(parse("ENV", "=1").is_err());
        assert!(parse("ENV", r#"A="open"#).is_err());
    }

    #[test]
    fn test_parse_label_quoted_key() {
        let line = parse("LABEL", r#""com.example.key=x"=1 version=2"#).unwrap();
        assert_eq!(values(&line), vec!["\"com.example.key=x\"", "1", "version", "2"]);
    }

    #[test]
    fn test_parse_label_escaped_space() {
        let line = parse("LABEL", r"desc=a\ b").unwrap();
        assert_eq!(values(&line), vec!["desc", r"a\ b"]);
    }

    // --- EXPOSE / VOLUME / USER / STOPSIGNAL / SHELL ---

    #[test]
    fn test_parse_expose() {
        let line = parse("EXPOSE", "80/tcp 443 53/udp").unwrap();
        assert_eq!(values(&line), vec!["80/tcp", "443", "53/udp"]);
    }

    #[test]
    fn test_parse_volume_forms() {
        assert_eq!(values(&parse("VOLUME", "/a /b").unwrap()), vec!["/a", "/b"]);
        assert_eq!(values(&parse("VOLUME", r#"["/data"]"#).unwrap()), vec!["/data"]);
        assert!(parse("VOLUME", "[]").is_err());
    }

    #[test]
    fn test_parse_user_exactly_one() {
        assert_eq!(values(&parse("USER", "app:app").unwrap()), vec!["app:app"]);
        assert!(parse("USER", "a b").is_err());
        assert!(parse("STOPSIGNAL", "SIGTERM SIGKILL").is_err());
    }

    #[test]
    fn test_parse_shell_requires_json() {
        let line = parse("SHELL", r#"["/bin/bash", "-c"]"#).unwrap();
        assert_eq!(values(&line), vec!["/bin/bash", "-c"]);
        assert!(parse("SHELL", "/bin/bash -c").is_err());
        assert!(parse("SHELL", "[]").is_err());
    }

    #[test]
    fn test_parse_workdir_keeps_spaces() {
        let line = parse("WORKDIR", "/my app").unwrap();
        assert_eq!(values(&line), vec!["/my app"]);
    }

    // --- HEALTHCHECK ---

    #[test]
    fn test_parse_healthcheck_cmd_shell() {
        let line = parse("HEALTHCHECK", "--interval=5s --retries=2 CMD curl -f http://localhost/").unwrap();
        assert_eq!(line.command, Keyword::Healthcheck);
        assert_eq!(values(&line), vec!["curl -f http://localhost/"]);
        assert_eq!(line.flag("interval"), Some("5s"));
        assert_eq!(line.flag("retries"), Some("2"));
        assert!(!line.is_json());
        let embedded = line.embedded.as_deref().unwrap();
        assert_eq!(embedded.command, Keyword::Cmd);
    }

    #[test]
    fn test_parse_healthcheck_cmd_json() {
        let line = parse("HEALTHCHECK", r#"cmd ["curl", "-f", "localhost"]"#).unwrap();
        assert_eq!(values(&line), vec!["curl", "-f", "localhost"]);
        assert!(line.is_json());
    }

    #[test]
    fn test_parse_healthcheck_none() {
        let line = parse("HEALTHCHECK", "NONE").unwrap();
        assert_eq!(values(&line), vec!["NONE"]);
        assert!(line.embedded.is_none());
        assert!(parse("HEALTHCHECK", "NONE extra").is_err());
    }

    #[test]
    fn test_parse_healthcheck_invalid() {
        assert!(parse("HEALTHCHECK", "CMD").is_err());
        assert!(parse("HEALTHCHECK", "curl localhost").is_err());
        assert!(parse("HEALTHCHECK", "--retries=0 CMD true").is_err());
    }

    // --- ONBUILD ---

    #[test]
    fn test_parse_onbuild() {
        let line = parse("ONBUILD", "COPY --chown=1:1 . /app").unwrap();
        assert_eq!(line.command, Keyword::Onbuild);
        assert_eq!(line.raw, "COPY --chown=1:1 . /app");
        assert_eq!(values(&line), vec!["COPY --chown=1:1 . /app"]);
        let trigger = line.embedded.as_deref().unwrap();
        assert_eq!(trigger.command, Keyword::Copy);
        assert_eq!(trigger.flag("chown"), Some("1:1"));
        assert_eq!(values(trigger), vec![".", "/app"]);
    }

    #[test]
    fn test_parse_onbuild_disallowed() {
        for raw in ["ONBUILD RUN x", "FROM alpine", "MAINTAINER me"] {
            assert!(matches!(parse("ONBUILD", raw), Err(KilnError::Semantic(_))));
        }
        assert!(matches!(parse("ONBUILD", "BOGUS x"), Err(KilnError::Syntax { .. })));
        assert!(parse("ONBUILD", "RUN").is_err());
    }
}
