//! Human duration string parsing.
//!
//! A pure, stateless utility: no I/O, no shared state, just a
//! `CoreResult` in and out.

use crate::error::{CoreError, CoreResult};

/// The largest duration, in milliseconds, the engine will accept for a
/// `sleep`. Durable timers round-trip through JSON-backed storage, so
/// this mirrors `Number.MAX_SAFE_INTEGER` rather than `i64::MAX`.
pub const MAX_SAFE_DURATION_MS: i64 = 9_007_199_254_740_991;

/// Parse a duration string of the form `<integer> <unit>` into
/// milliseconds. Whitespace-tolerant, case-insensitive unit.
///
/// Supported units: `millisecond[s]`, `second[s]`, `minute[s]`,
/// `hour[s]`, `day[s]`.
pub fn parse_duration(input: &str) -> CoreResult<u64> {
    let trimmed = input.trim();

    let mut parts = trimmed.splitn(2, char::is_whitespace);
    let number = parts.next().unwrap_or("");
    let unit = parts.next().map(str::trim).unwrap_or("");

    if number.is_empty() || unit.is_empty() || !number.bytes().all(|b| b.is_ascii_digit()) {
        return Err(CoreError::InvalidDuration(input.to_string()));
    }

    let value: u64 = number
        .parse()
        .map_err(|_| CoreError::InvalidDuration(input.to_string()))?;

    let ms_per_unit = match unit.to_ascii_lowercase().as_str() {
        "millisecond" | "milliseconds" => 1,
        "second" | "seconds" => 1_000,
        "minute" | "minutes" => 60_000,
        "hour" | "hours" => 3_600_000,
        "day" | "days" => 86_400_000,
        _ => return Err(CoreError::UnknownUnit(unit.to_string())),
    };

    value
        .checked_mul(ms_per_unit)
        .ok_or_else(|| CoreError::DurationOverflow(input.to_string()))
}

/// Parse a duration string and reject values beyond the platform's safe
/// arithmetic range, as `sleep` requires.
pub fn parse_duration_checked(input: &str) -> CoreResult<i64> {
    let ms = parse_duration(input)?;
    let ms = i64::try_from(ms).map_err(|_| CoreError::DurationOverflow(input.to_string()))?;
    if ms > MAX_SAFE_DURATION_MS {
        return Err(CoreError::DurationOverflow(input.to_string()));
    }
    Ok(ms)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_each_supported_unit() {
        assert_eq!(parse_duration("5 seconds").unwrap(), 5_000);
        assert_eq!(parse_duration("1 second").unwrap(), 1_000);
        assert_eq!(parse_duration("15 minutes").unwrap(), 900_000);
        assert_eq!(parse_duration("2 hours").unwrap(), 7_200_000);
        assert_eq!(parse_duration("1 day").unwrap(), 86_400_000);
        assert_eq!(parse_duration("100 milliseconds").unwrap(), 100);
    }

    #[test]
    fn is_case_insensitive_and_whitespace_tolerant() {
        assert_eq!(parse_duration("  5   SECONDS  ").unwrap(), 5_000);
        assert_eq!(parse_duration("5 Seconds").unwrap(), 5_000);
    }

    #[test]
    fn round_trips_for_every_unit_and_integer() {
        let units = [
            ("millisecond", 1u64),
            ("second", 1_000),
            ("minute", 60_000),
            ("hour", 3_600_000),
            ("day", 86_400_000),
        ];
        for (unit, ms) in units {
            for n in [0u64, 1, 7, 42] {
                let s = format!("{n} {unit}");
                assert_eq!(parse_duration(&s).unwrap(), n * ms, "failed for {s}");
            }
        }
    }

    #[test]
    fn rejects_malformed_shape() {
        assert!(matches!(
            parse_duration("five seconds"),
            Err(CoreError::InvalidDuration(_))
        ));
        assert!(matches!(
            parse_duration("5"),
            Err(CoreError::InvalidDuration(_))
        ));
        assert!(matches!(
            parse_duration(""),
            Err(CoreError::InvalidDuration(_))
        ));
    }

    #[test]
    fn rejects_unknown_unit() {
        assert!(matches!(
            parse_duration("3 fortnights"),
            Err(CoreError::UnknownUnit(_))
        ));
    }

    #[test]
    fn rejects_overflowing_sleep_duration() {
        let huge = format!("{} days", u64::MAX / 1000);
        assert!(matches!(
            parse_duration_checked(&huge),
            Err(CoreError::DurationOverflow(_))
        ));
    }
}
