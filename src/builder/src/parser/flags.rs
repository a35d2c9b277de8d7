//! `--name=value` instruction flags.

use std::collections::HashMap;
use std::time::Duration;

use kiln_core::error::{KilnError, Result};
use once_cell::sync::Lazy;
use regex::Regex;

use super::Keyword;

static CHOWN_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z0-9_.${}-]+(:[A-Za-z0-9_.${}-]+)?$").expect("valid chown regex")
});

/// Flags each instruction accepts. Instructions not listed take none and
/// keep a leading `--` in their arguments.
fn allowed_flags(keyword: Keyword) -> Option<&'static [&'static str]> {
    match keyword {
        Keyword::Add => Some(&["chown"]),
        Keyword::Copy => Some(&["chown", "from"]),
        Keyword::Healthcheck => Some(&["interval", "timeout", "start-period", "retries"]),
        _ => None,
    }
}

/// Consume the leading `--flag=value` tokens of `raw`.
///
/// Returns the validated flags and the remaining argument text.
pub(crate) fn extract_flags(
    keyword: Keyword,
    raw: &str,
    line: usize,
) -> Result<(HashMap<String, String>, String)> {
    let mut flags = HashMap::new();
    let Some(allowed) = allowed_flags(keyword) else {
        return Ok((flags, raw.trim().to_string()));
    };

    let mut rest = raw.trim_start();
    while let Some(after) = rest.strip_prefix("--") {
        let end = after.find(char::is_whitespace).unwrap_or(after.len());
        let token = &after[..end];
        rest = after[end..].trim_start();

        let Some((name, value)) = token.split_once('=') else {
            return Err(KilnError::syntax(
                line,
                format!("{} flag --{} is missing a value", keyword, token),
            ));
        };
        if !allowed.contains(&name) {
            return Err(KilnError::syntax(
                line,
                format!("unknown flag --{} for {}", name, keyword),
            ));
        }
        if flags.contains_key(name) {
            return Err(KilnError::syntax(
                line,
                format!("duplicate flag --{} for {}", name, keyword),
            ));
        }
        validate_flag(name, value).map_err(|msg| KilnError::syntax(line, msg))?;
        flags.insert(name.to_string(), value.to_string());
    }

    Ok((flags, rest.trim_end().to_string()))
}

fn validate_flag(name: &str, value: &str) -> std::result::Result<(), String> {
    match name {
        "chown" => {
            if !CHOWN_RE.is_match(value) {
                return Err(format!("invalid --chown value {:?}, expected user[:group]", value));
            }
        }
        "from" => {
            if value.is_empty() {
                return Err("--from requires a stage or image".to_string());
            }
        }
        "retries" => match value.parse::<i64>() {
            Ok(n) if n >= 1 => {}
            _ => return Err(format!("--retries must be an integer >= 1, got {:?}", value)),
        },
        "interval" | "timeout" | "start-period" => {
            let d = parse_duration(value).map_err(|e| format!("--{}: {}", name, e))?;
            if !d.is_zero() && d < Duration::from_millis(1) {
                return Err(format!("--{} must be at least 1ms", name));
            }
        }
        _ => {}
    }
    Ok(())
}

/// Parse a Go-style duration string such as `1h30m`, `500ms` or `1.5s`.
pub fn parse_duration(input: &str) -> std::result::Result<Duration, String> {
    let s = input.strip_prefix('+').unwrap_or(input);
    if s.starts_with('-') {
        return Err(format!("negative duration {:?}", input));
    }
    if s == "0" {
        return Ok(Duration::ZERO);
    }
    if s.is_empty() {
        return Err("empty duration".to_string());
    }

    let mut total_ns: f64 = 0.0;
    let mut rest = s;
    while !rest.is_empty() {
        let num_len = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(rest.len());
        let number = &rest[..num_len];
        if number.is_empty() || number == "." {
            return Err(format!("invalid duration {:?}", input));
        }
        let value: f64 = number
            .parse()
            .map_err(|_| format!("invalid duration {:?}", input))?;
        rest = &rest[num_len..];

        let unit_len = rest
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(rest.len());
        let scale = match &rest[..unit_len] {
            "ns" => 1.0,
            "us" | "µs" | "μs" => 1e3,
            "ms" => 1e6,
            "s" => 1e9,
            "m" => 60e9,
            "h" => 3600e9,
            "" => return Err(format!("missing unit in duration {:?}", input)),
            unit => return Err(format!("unknown unit {:?} in duration {:?}", unit, input)),
        };
        rest = &rest[unit_len..];
        total_ns += value * scale;
    }

    if total_ns > i64::MAX as f64 {
        return Err(format!("duration {:?} out of range", input));
    }
    Ok(Duration::from_nanos(total_ns.round() as u64))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_copy_flags() {
        let (flags, rest) =
            extract_flags(Keyword::Copy, "--from=build --chown=app:app /out /app", 3).unwrap();
        assert_eq!(flags.get("from").map(String::as_str), Some("build"));
        assert_eq!(flags.get("chown").map(String::as_str), Some("app:app"));
        assert_eq!(rest, "/out /app");
    }

    #[test]
    fn test_flags_stop_at_first_argument() {
        let (flags, rest) = extract_flags(Keyword::Copy, "src --chown=1 dst", 1).unwrap();
        assert!(flags.is_empty());
        assert_eq!(rest, "src --chown=1 dst");
    }

    #[test]
    fn test_unknown_flag() {
        let err = extract_flags(Keyword::Add, "--from=x a b", 7).unwrap_err();
        assert!(matches!(err, KilnError::Syntax { line: 7, .. }));
    }

    #[test]
    fn test_duplicate_flag() {
        assert!(extract_flags(Keyword::Copy, "--from=a --from=b x y", 1).is_err());
    }

    #[test]
    fn test_flag_without_value() {
        assert!(extract_flags(Keyword::Copy, "--from x y", 1).is_err());
    }

    #[test]
    fn test_chown_validation() {
        assert!(extract_flags(Keyword::Copy, "--chown=1000:1000 a b", 1).is_ok());
        assert!(extract_flags(Keyword::Copy, "--chown=${UID} a b", 1).is_ok());
        assert!(extract_flags(Keyword::Copy, "--chown=a:b:c a b", 1).is_err());
    }

    #[test]
    fn test_retries_validation() {
        assert!(extract_flags(Keyword::Healthcheck, "--retries=2 CMD true", 1).is_ok());
        assert!(extract_flags(Keyword::Healthcheck, "--retries=0 CMD true", 1).is_err());
        assert!(extract_flags(Keyword::Healthcheck, "--retries=x CMD true", 1).is_err());
    }

    #[test]
    fn test_duration_flag_validation() {
        assert!(extract_flags(Keyword::Healthcheck, "--interval=5s CMD true", 1).is_ok());
        assert!(extract_flags(Keyword::Healthcheck, "--timeout=0 CMD true", 1).is_ok());
        assert!(extract_flags(Keyword::Healthcheck, "--timeout=10 CMD true", 1).is_err());
        assert!(extract_flags(Keyword::Healthcheck, "--interval=10ns CMD true", 1).is_err());
    }

    #[test]
    fn test_commands_without_flags_keep_dashes() {
        let (flags, rest) = extract_flags(Keyword::Run, "--version", 1).unwrap();
        assert!(flags.is_empty());
        assert_eq!(rest, "--version");
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("1h2m3s").unwrap(), Duration::from_secs(3723));
        assert_eq!(parse_duration("1.5s").unwrap(), Duration::from_millis(1500));
        assert_eq!(parse_duration("250ms").unwrap(), Duration::from_millis(250));
        assert_eq!(parse_duration("3us").unwrap(), Duration::from_micros(3));
        assert_eq!(parse_duration("0").unwrap(), Duration::ZERO);
        assert!(parse_duration("-1s").is_err());
        assert!(parse_duration("5").is_err());
        assert!(parse_duration("5d").is_err());
        assert!(parse_duration("").is_err());
    }
}
