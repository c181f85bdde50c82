use chrono::{Duration, NaiveDate, NaiveDateTime};

use crate::error::ControllerError;

pub const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Wall clock kept in software, anchored to the monotonic tick at the moment
/// it was last set. Unsynchronized until the first successful `set`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SoftClock {
    anchor: Option<(NaiveDateTime, u64)>,
}

impl SoftClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_synchronized(&self) -> bool {
        self.anchor.is_some()
    }

    /// Validates the calendar fields and, if they form a real date-time,
    /// re-anchors the clock. An invalid request leaves the clock as it was.
    #[allow(clippy::too_many_arguments)]
    pub fn set(
        &mut self,
        year: i32,
        month: u32,
        day: u32,
        hour: u32,
        minute: u32,
        second: u32,
        now_ms: u64,
    ) -> Result<NaiveDateTime, ControllerError> {
        let datetime = NaiveDate::from_ymd_opt(year, month, day)
            .and_then(|date| date.and_hms_opt(hour, minute, second))
            .ok_or(ControllerError::InvalidDateTime)?;
        self.set_datetime(datetime, now_ms);
        Ok(datetime)
    }

    pub fn set_datetime(&mut self, datetime: NaiveDateTime, now_ms: u64) {
        self.anchor = Some((datetime, now_ms));
    }

    pub fn now(&self, now_ms: u64) -> Option<NaiveDateTime> {
        let (anchor, anchor_ms) = self.anchor?;
        let elapsed = i64::try_from(now_ms.saturating_sub(anchor_ms)).ok()?;
        anchor.checked_add_signed(Duration::try_milliseconds(elapsed)?)
    }

    pub fn formatted(&self, now_ms: u64) -> Option<String> {
        self.now(now_ms)
            .map(|now| now.format(TIME_FORMAT).to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_unsynchronized() {
        let clock = SoftClock::new();
        assert!(!clock.is_synchronized());
        assert_eq!(clock.now(1_000), None);
        assert_eq!(clock.formatted(1_000), None);
    }

    #[test]
    fn advances_with_monotonic_ticks() {
        let mut clock = SoftClock::new();
        clock.set(2026, 12, 31, 23, 59, 30, 10_000).unwrap();

        assert_eq!(
            clock.formatted(10_000).as_deref(),
            Some("2026-12-31 23:59:30")
        );
        assert_eq!(
            clock.formatted(45_500).as_deref(),
            Some("2027-01-01 00:00:05")
        );
    }

    #[test]
    fn invalid_date_is_rejected_and_keeps_previous_anchor() {
        let mut clock = SoftClock::new();
        clock.set(2026, 6, 1, 8, 0, 0, 0).unwrap();

        assert!(matches!(
            clock.set(2026, 2, 30, 8, 0, 0, 0),
            Err(ControllerError::InvalidDateTime)
        ));
        assert!(clock.set(2026, 6, 1, 24, 0, 0, 0).is_err());
        assert_eq!(clock.formatted(0).as_deref(), Some("2026-06-01 08:00:00"));
    }
}
