//! Linux signal table for STOPSIGNAL validation.

use kiln_core::error::{KilnError, Result};

/// Highest real-time signal number on Linux.
const MAX_SIGNAL: i32 = 64;

const SIGNALS: &[(&str, i32)] = &[
    ("ABRT", 6),
    ("ALRM", 14),
    ("BUS", 7),
    ("CHLD", 17),
    ("CLD", 17),
    ("CONT", 18),
    ("FPE", 8),
    ("HUP", 1),
    ("ILL", 4),
    ("INT", 2),
    ("IO", 29),
    ("IOT", 6),
    ("KILL", 9),
    ("PIPE", 13),
    ("POLL", 29),
    ("PROF", 27),
    ("PWR", 30),
    ("QUIT", 3),
    ("SEGV", 11),
    ("STKFLT", 16),
    ("STOP", 19),
    ("SYS", 31),
    ("TERM", 15),
    ("TRAP", 5),
    ("TSTP", 20),
    ("TTIN", 21),
    ("TTOU", 22),
    ("URG", 23),
    ("USR1", 10),
    ("USR2", 12),
    ("VTALRM", 26),
    ("WINCH", 28),
    ("XCPU", 24),
    ("XFSZ", 25),
    ("RTMIN", 34),
    ("RTMAX", 64),
];

/// Parse `SIGTERM`, `TERM`, `RTMIN+3` or `15` into a signal number.
pub fn parse_signal(value: &str) -> Result<i32> {
    let invalid = || KilnError::Semantic(format!("invalid signal: {}", value));

    if let Ok(number) = value.parse::<i32>() {
        return (1..=MAX_SIGNAL)
            .contains(&number)
            .then_some(number)
            .ok_or_else(invalid);
    }

    let upper = value.to_ascii_uppercase();
    let name = upper.strip_prefix("SIG").unwrap_or(&upper);

    // RTMIN+n / RTMAX-n
    if let Some((base, offset, sign)) = name
        .split_once('+')
        .map(|(b, o)| (b, o, 1))
        .or_else(|| name.split_once('-').map(|(b, o)| (b, o, -1)))
    {
        let base = lookup(base).ok_or_else(invalid)?;
        let offset: i32 = offset.parse().map_err(|_| invalid())?;
        let number = base + sign * offset;
        return (lookup("RTMIN").unwrap_or(34)..=MAX_SIGNAL)
            .contains(&number)
            .then_some(number)
            .ok_or_else(invalid);
    }

    lookup(name).ok_or_else(invalid)
}

fn lookup(name: &str) -> Option<i32> {
    SIGNALS
        .iter()
        .find(|(n, _)| *n == name)
        .map(|(_, number)| *number)
}
