use chrono::{Datelike, NaiveDateTime, Timelike};

use crate::config::ActuatorSettings;

/// Calendar day identifier, `year * 1000 + zero-based day of year`.
/// Strictly increasing across year boundaries.
pub type DayKey = i64;

pub fn day_key(now: &NaiveDateTime) -> DayKey {
    i64::from(now.year()) * 1000 + i64::from(now.ordinal0())
}

pub fn minutes_of_day(now: &NaiveDateTime) -> u16 {
    (now.hour() * 60 + now.minute()) as u16
}

/// Decides whether a daily trigger is due. Stateless; the per-actuator
/// last-fired day key lives with the actuator runtime state.
#[derive(Debug, Clone, Copy)]
pub struct ScheduleEvaluator {
    window_minutes: u16,
}

impl ScheduleEvaluator {
    pub fn new(window_minutes: u16) -> Self {
        Self { window_minutes }
    }

    /// `now` is `None` while the wall clock is unsynchronized, in which case
    /// nothing ever fires.
    pub fn evaluate(
        &self,
        settings: &ActuatorSettings,
        last_fire: Option<DayKey>,
        now: Option<&NaiveDateTime>,
    ) -> bool {
        let Some(now) = now else {
            return false;
        };
        if !settings.schedule_enabled {
            return false;
        }
        if last_fire == Some(day_key(now)) {
            return false;
        }

        let target = settings.schedule_minutes();
        let current = minutes_of_day(now);
        (target..=target + self.window_minutes).contains(&current)
    }
}
