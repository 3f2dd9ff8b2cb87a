//! Duration strings.
//!
//! Two textual forms are understood:
//!
//! - The shorthand used in rule metadata: `[Xd] [Xh] [Xm] [Xs] [Xms]`, e.g.
//!   `1h 30m`, `2d8h5m20s`, `0.5s`. Units must appear in that order, each at
//!   most once, and any amount may be fractional. `z` is accepted as an alias
//!   for `ms`.
//! - ISO-8601 durations limited to days and time components: `PT1H30M`,
//!   `P1DT12H`, `PT0.5S`.

use std::sync::LazyLock;
use std::time::Duration;

use regex::{Captures, Regex};

use crate::error::{Error, Result};

const SECS_PER_MINUTE: f64 = 60.0;
const SECS_PER_HOUR: f64 = 60.0 * SECS_PER_MINUTE;
const SECS_PER_DAY: f64 = 24.0 * SECS_PER_HOUR;

static SHORTHAND: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?ix)^\s*
        (?:(?P<days>[\d.]+)\s*d)?\s*
        (?:(?P<hours>[\d.]+)\s*h)?\s*
        (?:(?P<minutes>[\d.]+)\s*m)?\s*
        (?:(?P<seconds>[\d.]+)\s*s)?\s*
        (?:(?P<millis>[\d.]+)\s*(?:ms|z))?\s*$",
    )
    .expect("shorthand duration pattern is valid")
});

static ISO8601: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)^P(?:(?P<days>[\d.]+)D)?(?:T(?:(?P<hours>[\d.]+)H)?(?:(?P<minutes>[\d.]+)M)?(?:(?P<seconds>[\d.]+)S)?)?$",
    )
    .expect("ISO-8601 duration pattern is valid")
});

/// Parse a shorthand duration such as `1h 30m` or `2.5s`.
pub fn parse_duration(input: &str) -> Result<Duration> {
    SHORTHAND
        .captures(input)
        .ok_or_else(|| invalid(input))
        .and_then(|caps| from_captures(input, &caps))
}

/// Parse an ISO-8601 duration such as `PT1H30M`.
pub fn parse_iso_duration(input: &str) -> Result<Duration> {
    // `P` and `PT` alone match the pattern but carry no amount
    let trimmed = input.trim();
    if trimmed.eq_ignore_ascii_case("P") || trimmed.eq_ignore_ascii_case("PT") {
        return Err(invalid(input));
    }
    if trimmed.to_ascii_uppercase().ends_with('T') {
        return Err(invalid(input));
    }

    ISO8601
        .captures(trimmed)
        .ok_or_else(|| invalid(input))
        .and_then(|caps| from_captures(input, &caps))
}

fn from_captures(input: &str, caps: &Captures<'_>) -> Result<Duration> {
    let units = [
        ("days", SECS_PER_DAY),
        ("hours", SECS_PER_HOUR),
        ("minutes", SECS_PER_MINUTE),
        ("seconds", 1.0),
        ("millis", 0.001),
    ];

    let mut seen = false;
    let mut total = 0.0_f64;
    for (name, scale) in units {
        let Some(amount) = caps.name(name) else {
            continue;
        };
        let amount: f64 = amount.as_str().parse().map_err(|_| invalid(input))?;
        seen = true;
        total += amount * scale;
    }

    if !seen {
        return Err(invalid(input));
    }

    Duration::try_from_secs_f64(total).map_err(|_| invalid(input))
}

fn invalid(input: &str) -> Error {
    Error::InvalidTimeFormat(format!(
        "{input:?} is not a duration; examples of valid durations: '8h', '2d8h5m20s', '2m 4s', 'PT1H30M'"
    ))
}

/// Format a remaining duration as `[D day[s], ]H:MM:SS`, rounded to the
/// nearest second.
pub fn format_remaining(remaining: Duration) -> String {
    let total = remaining.as_secs_f64().round() as u64;
    let days = total / 86_400;
    let hours = (total % 86_400) / 3_600;
    let minutes = (total % 3_600) / 60;
    let seconds = total % 60;

    match days {
        0 => format!("{hours}:{minutes:02}:{seconds:02}"),
        1 => format!("1 day, {hours}:{minutes:02}:{seconds:02}"),
        n => format!("{n} days, {hours}:{minutes:02}:{seconds:02}"),
    }
}

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::*;

    #[test_case("8h", Duration::from_secs(8 * 3600); "hours")]
    #[test_case("2d8h5m20s", Duration::from_secs(2 * 86_400 + 8 * 3600 + 5 * 60 + 20); "all units packed")]
    #[test_case("2m 4s", Duration::from_secs(124); "spaced")]
    #[test_case("1h 05s", Duration::from_secs(3605); "skipped unit")]
    #[test_case("0.5s", Duration::from_millis(500); "fractional seconds")]
    #[test_case("1.5d", Duration::from_secs(36 * 3600); "fractional days")]
    #[test_case("250ms", Duration::from_millis(250); "milliseconds")]
    #[test_case("1s 250z", Duration::from_millis(1250); "z alias")]
    #[test_case("5M", Duration::from_secs(300); "upper case")]
    fn parses_shorthand(input: &str, expected: Duration) {
        assert_eq!(parse_duration(input).unwrap(), expected);
    }

    #[test_case(""; "empty")]
    #[test_case("   "; "blank")]
    #[test_case("soon"; "word")]
    #[test_case("5"; "no unit")]
    #[test_case("5s 1h"; "units out of order")]
    #[test_case("1.2.3s"; "malformed number")]
    #[test_case("5w"; "unknown unit")]
    fn rejects_bad_shorthand(input: &str) {
        assert!(matches!(
            parse_duration(input),
            Err(Error::InvalidTimeFormat(_))
        ));
    }

    #[test_case("PT1S", Duration::from_secs(1); "seconds")]
    #[test_case("PT1H30M", Duration::from_secs(5400); "hours and minutes")]
    #[test_case("P1DT12H", Duration::from_secs(36 * 3600); "days and hours")]
    #[test_case("P2D", Duration::from_secs(2 * 86_400); "days only")]
    #[test_case("pt0.5s", Duration::from_millis(500); "lower case fractional")]
    fn parses_iso(input: &str, expected: Duration) {
        assert_eq!(parse_iso_duration(input).unwrap(), expected);
    }

    #[test_case("P"; "bare p")]
    #[test_case("PT"; "bare pt")]
    #[test_case("P1DT"; "dangling t")]
    #[test_case("1H"; "missing p")]
    fn rejects_bad_iso(input: &str) {
        assert!(parse_iso_duration(input).is_err());
    }

    #[test_case(Duration::ZERO, "0:00:00"; "zero")]
    #[test_case(Duration::from_millis(1_600), "0:00:02"; "rounds up")]
    #[test_case(Duration::from_secs(3_725), "1:02:05"; "hours")]
    #[test_case(Duration::from_secs(86_400 + 61), "1 day, 0:01:01"; "one day")]
    #[test_case(Duration::from_secs(3 * 86_400 + 36_000), "3 days, 10:00:00"; "days")]
    fn formats_remaining(remaining: Duration, expected: &str) {
        assert_eq!(format_remaining(remaining), expected);
    }
}
