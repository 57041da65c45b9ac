//! Wall-clock source and display-time conversion.
//!
//! The scheduler only ever reads time. Conversion to the display timezone is a
//! pure function of Unix seconds and a fixed offset, so it never depends on
//! the timezone configured on whatever machine runs the code.

use core::fmt::Write;

use chrono::{DateTime, FixedOffset, Offset, Timelike, Utc};
use heapless::String;

/// Error type for clock synchronization
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ClockError {
    /// No time server could be resolved
    ResolveFailed,
    /// Request sent but no usable answer arrived
    NoResponse,
    /// Answer arrived but was malformed or unsynchronized
    InvalidResponse,
}

/// Port for the calendar time source.
#[allow(async_fn_in_trait)]
pub trait WallClock {
    /// Query the remote time reference once.
    async fn synchronize(&mut self) -> Result<(), ClockError>;

    /// Seconds since the Unix epoch. Counts from 0 until synchronized.
    fn unix_time(&self) -> u64;
}

/// Calendar time of day.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct TimeOfDay {
    pub hour: u32,
    pub minute: u32,
    pub second: u32,
}

impl TimeOfDay {
    pub const MIDNIGHT: TimeOfDay = TimeOfDay {
        hour: 0,
        minute: 0,
        second: 0,
    };

    /// Time of day in UTC.
    pub fn utc(unix_secs: u64) -> Self {
        Self::with_offset(unix_secs, 0)
    }

    /// Time of day at a fixed offset east of UTC.
    pub fn with_offset(unix_secs: u64, offset_secs: i32) -> Self {
        let utc = i64::try_from(unix_secs)
            .ok()
            .and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0))
            .unwrap_or_default();
        let offset = FixedOffset::east_opt(offset_secs).unwrap_or_else(|| Utc.fix());
        let local = utc.with_timezone(&offset);
        Self {
            hour: local.hour(),
            minute: local.minute(),
            second: local.second(),
        }
    }

    pub fn is_midnight(&self) -> bool {
        *self == Self::MIDNIGHT
    }

    /// Zero-padded `HH:MM`.
    pub fn hh_mm(&self) -> String<5> {
        let mut text = String::new();
        // 5 bytes always fit two zero-padded fields below 100.
        write!(text, "{:02}:{:02}", self.hour % 100, self.minute % 100).ok();
        text
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NINE_HOURS: i32 = 9 * 3600;

    #[test]
    fn epoch_is_midnight_utc() {
        assert!(TimeOfDay::utc(0).is_midnight());
        assert_eq!(TimeOfDay::with_offset(0, NINE_HOURS).hh_mm().as_str(), "09:00");
    }

    #[test]
    fn display_time_wraps_across_utc_day() {
        // 2024-05-01T15:00:00Z is 00:00 the next day at UTC+9
        let t = 1_714_575_600;
        assert_eq!(TimeOfDay::utc(t).hour, 15);
        let local = TimeOfDay::with_offset(t, NINE_HOURS);
        assert!(local.is_midnight());
        assert_eq!(local.hh_mm().as_str(), "00:00");
    }

    #[test]
    fn hh_mm_is_zero_padded() {
        // 2024-05-01T00:40:05Z
        let t = 1_714_524_005;
        let local = TimeOfDay::with_offset(t, NINE_HOURS);
        assert_eq!(
            local,
            TimeOfDay {
                hour: 9,
                minute: 40,
                second: 5
            }
        );
        assert_eq!(local.hh_mm().as_str(), "09:40");
        assert_eq!(TimeOfDay::utc(t).hh_mm().as_str(), "00:40");
    }
}
