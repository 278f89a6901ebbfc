//! Timezone resolution, quiet-hour windows, and next-fire computation.
//!
//! Shared by the cron scheduler, the webhook task dispatcher, and the
//! heartbeat loop.

use std::str::FromStr;

use chrono::{DateTime, TimeZone, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::CoreError;

/// `[start, end)` window of local hours. `start > end` wraps past midnight;
/// `start == end` is an empty window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuietHours {
    pub start_hour: u8,
    pub end_hour: u8,
}

impl QuietHours {
    pub fn contains(&self, hour: u8) -> bool {
        let (start, end) = (self.start_hour, self.end_hour);
        if start == end {
            false
        } else if start < end {
            hour >= start && hour < end
        } else {
            hour >= start || hour < end
        }
    }
}

/// Resolve a timezone by the documented order:
/// entry override → configured zone → host `TZ` → UTC.
pub fn resolve_timezone(entry_tz: Option<&str>, configured_tz: Option<&str>) -> Tz {
    for candidate in [entry_tz, configured_tz, std::env::var("TZ").ok().as_deref()]
        .into_iter()
        .flatten()
    {
        match Tz::from_str(candidate) {
            Ok(tz) => return tz,
            Err(_) => warn!(zone = candidate, "unknown timezone, trying next fallback"),
        }
    }
    Tz::UTC
}

/// Local hour-of-day right now in `tz`.
pub fn local_hour(tz: Tz) -> u8 {
    use chrono::Timelike;
    Utc::now().with_timezone(&tz).hour() as u8
}

/// Next fire instant for a 5-field cron expression interpreted in `tz`,
/// strictly after `after`.
pub fn next_fire(
    expression: &str,
    tz: Tz,
    after: DateTime<Utc>,
) -> Result<DateTime<Utc>, CoreError> {
    let schedule = parse_expression(expression)?;
    let local_after = tz.from_utc_datetime(&after.naive_utc());
    schedule
        .after(&local_after)
        .next()
        .map(|dt| dt.with_timezone(&Utc))
        .ok_or_else(|| CoreError::Scheduler(format!("no future fire time for {expression:?}")))
}

/// Parse a 5-field expression. The `cron` crate wants a seconds field, so
/// one is prepended; 6- or 7-field input is rejected to keep the stored
/// format uniform.
pub fn parse_expression(expression: &str) -> Result<cron::Schedule, CoreError> {
    let fields = expression.split_whitespace().count();
    if fields != 5 {
        return Err(CoreError::Scheduler(format!(
            "expected 5-field cron expression, got {fields} fields: {expression:?}"
        )));
    }
    cron::Schedule::from_str(&format!("0 {expression}"))
        .map_err(|e| CoreError::Scheduler(format!("bad cron expression {expression:?}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Timelike;

    #[test]
    fn test_quiet_hours_wrap() {
        let window = QuietHours {
            start_hour: 22,
            end_hour: 7,
        };
        for hour in [22, 23, 0, 1, 3, 6] {
            assert!(window.contains(hour), "hour {hour} should be quiet");
        }
        for hour in [7, 8, 12, 21] {
            assert!(!window.contains(hour), "hour {hour} should be active");
        }
    }

    #[test]
    fn test_quiet_hours_plain_and_empty() {
        let plain = QuietHours {
            start_hour: 9,
            end_hour: 17,
        };
        assert!(plain.contains(9));
        assert!(plain.contains(16));
        assert!(!plain.contains(17));
        assert!(!plain.contains(8));

        let empty = QuietHours {
            start_hour: 5,
            end_hour: 5,
        };
        assert!(!empty.contains(5));
    }

    #[test]
    fn test_resolve_timezone_order() {
        assert_eq!(
            resolve_timezone(Some("Europe/Berlin"), Some("America/New_York")),
            chrono_tz::Europe::Berlin
        );
        assert_eq!(
            resolve_timezone(None, Some("America/New_York")),
            chrono_tz::America::New_York
        );
        assert_eq!(
            resolve_timezone(Some("Not/AZone"), Some("America/New_York")),
            chrono_tz::America::New_York
        );
    }

    #[test]
    fn test_next_fire_respects_zone() {
        // 06:30 every day, Berlin time. From midnight UTC on a summer day
        // (Berlin = UTC+2), the next fire is 04:30 UTC.
        let after = Utc.with_ymd_and_hms(2026, 7, 1, 0, 0, 0).unwrap();
        let fire = next_fire("30 6 * * *", chrono_tz::Europe::Berlin, after).unwrap();
        assert_eq!(fire.hour(), 4);
        assert_eq!(fire.minute(), 30);

        let local = fire.with_timezone(&chrono_tz::Europe::Berlin);
        assert_eq!(local.hour(), 6);
        assert_eq!(local.minute(), 30);
    }

    #[test]
    fn test_next_fire_daily_wall_clock_in_zone() {
        // Consecutive fires stay at the same wall-clock hour in the zone.
        let tz = chrono_tz::America::New_York;
        let after = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
        let first = next_fire("0 9 * * *", tz, after).unwrap();
        let second = next_fire("0 9 * * *", tz, first).unwrap();
        assert_eq!(first.with_timezone(&tz).hour(), 9);
        assert_eq!(second.with_timezone(&tz).hour(), 9);
        assert!(second > first);
    }

    #[test]
    fn test_parse_rejects_wrong_field_count() {
        assert!(parse_expression("0 9 * * *").is_ok());
        assert!(parse_expression("0 0 9 * * *").is_err());
        assert!(parse_expression("9 * *").is_err());
        assert!(parse_expression("not a cron").is_err());
    }
}
