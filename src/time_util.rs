use crate::error::PipelineError;
use chrono::{DateTime, Duration, TimeZone, Utc};
use chrono_tz::Tz;
use std::str::FromStr;

/// Get the local timezone as a chrono_tz::Tz
/// If configured_timezone is provided, it will be used
/// Otherwise, falls back to the system timezone from iana-time-zone
/// If both fail, defaults to UTC
pub fn get_local_timezone(configured_timezone: Option<&str>) -> Tz {
    if let Some(tz_str) = configured_timezone {
        if let Ok(tz) = Tz::from_str(tz_str) {
            return tz;
        }
    }

    match iana_time_zone::get_timezone() {
        Ok(tz_str) => Tz::from_str(&tz_str).unwrap_or(chrono_tz::UTC),
        Err(_) => chrono_tz::UTC,
    }
}

/// Half-open `[start, end)` window in unix seconds, ending at `now`.
pub fn lookback_window(
    now: DateTime<Utc>,
    hours: i64,
) -> Result<(i64, i64), PipelineError> {
    let start = Duration::try_hours(hours)
        .and_then(|span| now.checked_sub_signed(span))
        .ok_or_else(|| {
            PipelineError::Configuration(format!(
                "lookback of {} hours is out of range",
                hours
            ))
        })?;
    Ok((start.timestamp(), now.timestamp()))
}

/// Render a unix timestamp as `HH:MM` wall-clock time in `timezone`.
pub fn format_clock(timestamp: i64, timezone: Tz) -> String {
    match Utc.timestamp_opt(timestamp, 0).single() {
        Some(utc) => utc.with_timezone(&timezone).format("%H:%M").to_string(),
        None => "--:--".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_local_timezone() {
        let tz = get_local_timezone(Some("Europe/Lisbon"));
        assert_eq!(tz, chrono_tz::Europe::Lisbon);

        // Invalid names fall back to the system zone, which always parses.
        let fallback = get_local_timezone(Some("Invalid/Timezone"));
        println!("Fallback timezone: {:?}", fallback);
    }

    #[test]
    fn test_lookback_window() {
        let now = Utc.with_ymd_and_hms(2024, 3, 10, 23, 0, 0).unwrap();
        let (start, end) = lookback_window(now, 24).unwrap();
        assert_eq!(end, now.timestamp());
        assert_eq!(end - start, 24 * 3600);
    }

    #[test]
    fn test_lookback_window_out_of_range() {
        let now = Utc.with_ymd_and_hms(2024, 3, 10, 23, 0, 0).unwrap();
        for hours in [3_000_000_000, i64::MAX] {
            let err = lookback_window(now, hours).unwrap_err();
            assert!(matches!(err, PipelineError::Configuration(_)));
        }
    }

    #[test]
    fn test_format_clock() {
        // 2024-03-10 09:05:30 UTC
        let ts = Utc
            .with_ymd_and_hms(2024, 3, 10, 9, 5, 30)
            .unwrap()
            .timestamp();
        assert_eq!(format_clock(ts, chrono_tz::UTC), "09:05");
        // Sao Paulo is UTC-3 with no DST in 2024
        assert_eq!(format_clock(ts, chrono_tz::America::Sao_Paulo), "06:05");
        assert_eq!(format_clock(i64::MAX, chrono_tz::UTC), "--:--");
    }
}
