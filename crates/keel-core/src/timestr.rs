use std::time::Duration;

use crate::error::{Error, Result};

/// Format a duration as the compact wire grammar: `1d2h3m4s`, `500ms`.
///
/// Zero durations format as `0s`. Sub-millisecond precision is dropped.
pub fn format_duration(duration: Duration) -> String {
    let total_ms = duration.as_millis();
    if total_ms == 0 {
        return "0s".to_string();
    }

    let mut out = String::new();
    let mut rest = total_ms;

    const DAY: u128 = 24 * 60 * 60 * 1000;
    const HOUR: u128 = 60 * 60 * 1000;
    const MINUTE: u128 = 60 * 1000;
    const SECOND: u128 = 1000;

    for (unit, suffix) in [(DAY, "d"), (HOUR, "h"), (MINUTE, "m"), (SECOND, "s")] {
        let count = rest / unit;
        if count > 0 {
            out.push_str(&format!("{count}{suffix}"));
            rest %= unit;
        }
    }
    if rest > 0 {
        out.push_str(&format!("{rest}ms"));
    }
    out
}

/// Parse the compact wire grammar back into a duration.
///
/// Accepts `d`, `h`, `m`, `s` and `ms` units in any combination, e.g.
/// `90s`, `1h30m`, `250ms`.
pub fn parse_duration(input: &str) -> Result<Duration> {
    let input = input.trim();
    if input.is_empty() {
        return Err(Error::Validation("empty duration string".to_string()));
    }

    let mut total_ms: u64 = 0;
    let mut digits = String::new();
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c.is_ascii_digit() {
            digits.push(c);
            continue;
        }
        if digits.is_empty() {
            return Err(Error::Validation(format!(
                "invalid duration string '{input}'"
            )));
        }
        let value: u64 = digits
            .parse()
            .map_err(|_| Error::Validation(format!("invalid duration string '{input}'")))?;
        digits.clear();

        let unit_ms = match c {
            'd' => 24 * 60 * 60 * 1000,
            'h' => 60 * 60 * 1000,
            's' => 1000,
            'm' => {
                if chars.peek() == Some(&'s') {
                    chars.next();
                    1
                } else {
                    60 * 1000
                }
            }
            other => {
                return Err(Error::Validation(format!(
                    "unknown duration unit '{other}' in '{input}'"
                )))
            }
        };
        total_ms = total_ms.saturating_add(value.saturating_mul(unit_ms));
    }

    if !digits.is_empty() {
        return Err(Error::Validation(format!(
            "duration '{input}' is missing a unit"
        )));
    }

    Ok(Duration::from_millis(total_ms))
}
