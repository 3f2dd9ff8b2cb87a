//! Conversion of "when" expressions into absolute times.
//!
//! Rules describe deadlines in many shapes: a delay (`5m`, `PT30S`, a raw
//! millisecond count), an absolute timestamp, or a wall-clock time of day.
//! [`When`] captures each shape as a variant; parsing happens once at the
//! boundary (see [`When::from_str`]) and [`When::resolve`] turns any variant
//! into an [`OffsetDateTime`] against a clock reading.

mod duration;

pub use duration::{format_remaining, parse_duration, parse_iso_duration};

use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use time::format_description::well_known::Iso8601;
use time::{OffsetDateTime, PrimitiveDateTime, Time};

use crate::error::{Error, Result};

static ISO_DATE_TIME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^(-?(?:[1-9][0-9]*)?[0-9]{4})-(1[0-2]|0[1-9])-(3[01]|0[1-9]|[12][0-9])T(2[0-3]|[01][0-9]):([0-5][0-9]):([0-5][0-9])(\.[0-9]+)?(Z|[+-](?:2[0-3]|[01][0-9]):[0-5][0-9])?$",
    )
    .expect("ISO-8601 date-time pattern is valid")
});

static CLOCK_24H: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?P<hour>[01]?[0-9]|2[0-3]):(?P<minute>[0-5][0-9])(?::(?P<second>[0-5][0-9]))?$")
        .expect("24-hour clock pattern is valid")
});

static CLOCK_12H: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)^(?P<hour>0?[1-9]|1[0-2]):(?P<minute>[0-5][0-9]) ?(?P<meridiem>[ap])\.?m\.?$",
    )
    .expect("12-hour clock pattern is valid")
});

static MILLIS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\d+$").expect("millisecond pattern is valid"));

/// A point in time, possibly relative to "now".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum When {
    /// This long after now.
    Delay(Duration),

    /// A fixed instant.
    At(OffsetDateTime),

    /// A date and time without an offset, read in the clock's offset.
    Local(PrimitiveDateTime),

    /// This time of day on the clock's current date. Already-passed times
    /// are not moved to tomorrow.
    Today(Time),
}

impl When {
    /// A delay given in whole milliseconds.
    pub fn millis(ms: u64) -> Self {
        Self::Delay(Duration::from_millis(ms))
    }

    /// Resolve against a clock reading.
    pub fn resolve(self, now: OffsetDateTime) -> Result<OffsetDateTime> {
        match self {
            When::Delay(delay) => {
                let delay = time::Duration::try_from(delay).map_err(|_| out_of_range(self))?;
                now.checked_add(delay).ok_or_else(|| out_of_range(self))
            }
            When::At(at) => Ok(at),
            When::Local(local) => Ok(local.assume_offset(now.offset())),
            When::Today(time_of_day) => Ok(now.replace_time(time_of_day)),
        }
    }

    /// Resolve, then move the result onto the clock's current date, keeping
    /// its time of day.
    pub fn to_today(self, now: OffsetDateTime) -> Result<OffsetDateTime> {
        let resolved = self.resolve(now)?.to_offset(now.offset());
        Ok(resolved.replace_date(now.date()))
    }
}

fn out_of_range(when: When) -> Error {
    Error::InvalidTimeFormat(format!("{when} is out of range"))
}

impl From<Duration> for When {
    fn from(delay: Duration) -> Self {
        When::Delay(delay)
    }
}

impl From<OffsetDateTime> for When {
    fn from(at: OffsetDateTime) -> Self {
        When::At(at)
    }
}

impl From<PrimitiveDateTime> for When {
    fn from(local: PrimitiveDateTime) -> Self {
        When::Local(local)
    }
}

impl From<Time> for When {
    fn from(time_of_day: Time) -> Self {
        When::Today(time_of_day)
    }
}

impl FromStr for When {
    type Err = Error;

    /// Parse, trying in order: ISO-8601 date-time, ISO-8601 duration,
    /// 24-hour and 12-hour clock times, bare milliseconds, and finally the
    /// shorthand duration syntax.
    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.is_empty() {
            return Err(Error::InvalidTimeFormat("empty time expression".into()));
        }

        if ISO_DATE_TIME.is_match(s) {
            return parse_date_time(s);
        }

        if s.starts_with(['P', 'p']) {
            return parse_iso_duration(s).map(When::Delay);
        }

        if let Some(caps) = CLOCK_24H.captures(s) {
            let hour = caps["hour"].parse().map_err(|_| bad_clock(s))?;
            let minute = caps["minute"].parse().map_err(|_| bad_clock(s))?;
            let second = caps
                .name("second")
                .map_or(Ok(0), |m| m.as_str().parse())
                .map_err(|_| bad_clock(s))?;
            return Time::from_hms(hour, minute, second)
                .map(When::Today)
                .map_err(|_| bad_clock(s));
        }

        if let Some(caps) = CLOCK_12H.captures(s) {
            let hour: u8 = caps["hour"].parse().map_err(|_| bad_clock(s))?;
            let minute = caps["minute"].parse().map_err(|_| bad_clock(s))?;
            let pm = caps["meridiem"].eq_ignore_ascii_case("p");
            let hour = match (hour, pm) {
                (12, false) => 0,
                (12, true) => 12,
                (h, false) => h,
                (h, true) => h + 12,
            };
            return Time::from_hms(hour, minute, 0)
                .map(When::Today)
                .map_err(|_| bad_clock(s));
        }

        if MILLIS.is_match(s) {
            let ms = s.parse().map_err(|_| {
                Error::InvalidTimeFormat(format!("{s:?} is too many milliseconds"))
            })?;
            return Ok(When::millis(ms));
        }

        parse_duration(s).map(When::Delay)
    }
}

fn parse_date_time(s: &str) -> Result<When> {
    let time_part = s.split_once('T').map_or("", |(_, time_part)| time_part);
    let has_offset = time_part.ends_with('Z') || time_part.contains(['+', '-']);

    if has_offset {
        OffsetDateTime::parse(s, &Iso8601::DEFAULT)
            .map(When::At)
            .map_err(|e| Error::InvalidTimeFormat(format!("{s:?}: {e}")))
    } else {
        PrimitiveDateTime::parse(s, &Iso8601::DEFAULT)
            .map(When::Local)
            .map_err(|e| Error::InvalidTimeFormat(format!("{s:?}: {e}")))
    }
}

fn bad_clock(s: &str) -> Error {
    Error::InvalidTimeFormat(format!("{s:?} is not a valid time of day"))
}

impl fmt::Display for When {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            When::Delay(delay) => write!(f, "in {delay:?}"),
            When::At(at) => write!(f, "at {at}"),
            When::Local(local) => write!(f, "at {local} local"),
            When::Today(time_of_day) => write!(f, "today at {time_of_day}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use test_case::test_case;
    use time::macros::{datetime, time};

    use super::*;

    const NOW: OffsetDateTime = datetime!(2024-03-10 14:00:00 +01:00);

    #[test]
    fn delay_is_added_to_now() {
        let when: When = "1h 30m".parse().unwrap();
        assert_eq!(when.resolve(NOW).unwrap(), datetime!(2024-03-10 15:30:00 +01:00));
    }

    #[test]
    fn bare_integer_is_milliseconds() {
        let when: When = "1500".parse().unwrap();
        assert_eq!(when, When::millis(1500));
        assert_eq!(
            when.resolve(NOW).unwrap(),
            datetime!(2024-03-10 14:00:01.5 +01:00)
        );
    }

    #[test]
    fn iso_duration_is_a_delay() {
        let when: When = "PT45S".parse().unwrap();
        assert_eq!(when, When::Delay(Duration::from_secs(45)));
    }

    #[test]
    fn iso_date_time_with_offset_is_absolute() {
        let when: When = "2024-03-11T08:15:00Z".parse().unwrap();
        assert_eq!(when, When::At(datetime!(2024-03-11 08:15:00 UTC)));
        assert_eq!(when.resolve(NOW).unwrap(), datetime!(2024-03-11 08:15:00 UTC));
    }

    #[test]
    fn iso_date_time_with_numeric_offset() {
        let when: When = "2024-03-11T08:15:00.250-05:00".parse().unwrap();
        assert_eq!(when, When::At(datetime!(2024-03-11 08:15:00.25 -05:00)));
    }

    #[test]
    fn iso_date_time_without_offset_uses_clock_offset() {
        let when: When = "2024-03-11T08:15:00".parse().unwrap();
        assert_eq!(when, When::Local(datetime!(2024-03-11 08:15:00)));
        assert_eq!(
            when.resolve(NOW).unwrap(),
            datetime!(2024-03-11 08:15:00 +01:00)
        );
    }

    #[test_case("13:12", time!(13:12); "24 hour")]
    #[test_case("7:05", time!(7:05); "24 hour single digit")]
    #[test_case("23:59:30", time!(23:59:30); "24 hour with seconds")]
    #[test_case("4:56 pm", time!(16:56); "12 hour pm")]
    #[test_case("12:30am", time!(0:30); "12 hour midnight")]
    #[test_case("12:00 P.M.", time!(12:00); "12 hour noon dotted")]
    fn clock_times_are_today(input: &str, expected: Time) {
        let when: When = input.parse().unwrap();
        assert_eq!(when, When::Today(expected));
        assert_eq!(when.resolve(NOW).unwrap(), NOW.replace_time(expected));
    }

    #[test_case(""; "empty")]
    #[test_case("tomorrow"; "word")]
    #[test_case("25:00"; "bad hour")]
    #[test_case("2024-13-01T00:00:00Z"; "bad month")]
    #[test_case("P"; "empty iso duration")]
    #[test_case("99999999999999999999999"; "too many millis")]
    fn rejects_invalid(input: &str) {
        assert!(matches!(
            input.parse::<When>(),
            Err(Error::InvalidTimeFormat(_))
        ));
    }

    #[test]
    fn past_instant_resolves_unchanged() {
        let past = datetime!(2020-01-01 00:00:00 UTC);
        assert_eq!(When::At(past).resolve(NOW).unwrap(), past);
    }

    #[test]
    fn overflowing_delay_is_invalid() {
        let when = When::Delay(Duration::MAX);
        assert!(matches!(when.resolve(NOW), Err(Error::InvalidTimeFormat(_))));
    }

    #[test]
    fn to_today_keeps_time_of_day() {
        let when = When::At(datetime!(2019-06-01 06:30:00 +01:00));
        assert_eq!(
            when.to_today(NOW).unwrap(),
            datetime!(2024-03-10 06:30:00 +01:00)
        );
    }

    #[test]
    fn to_today_converts_offset_first() {
        let when = When::At(datetime!(2019-06-01 05:30:00 UTC));
        assert_eq!(
            when.to_today(NOW).unwrap(),
            datetime!(2024-03-10 06:30:00 +01:00)
        );
    }
}
