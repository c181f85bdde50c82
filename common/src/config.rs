use serde::{Deserialize, Serialize};

use crate::{
    error::ControllerError,
    types::{ActuatorId, ActuatorSettingsView, SettingsView, ACTUATOR_COUNT},
};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerConfig {
    pub debounce_ms: u64,
    pub long_press_ms: u64,
    pub schedule_window_minutes: u16,
    pub control_tick_ms: u64,
    pub ap_idle_timeout_ms: u64,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            debounce_ms: 50,
            long_press_ms: 5_000,
            schedule_window_minutes: 2,
            control_tick_ms: 10,
            ap_idle_timeout_ms: 1_800_000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActuatorSettings {
    pub on_duration_minutes: u32,
    pub schedule_hour: u8,
    pub schedule_minute: u8,
    pub schedule_enabled: bool,
}

impl Default for ActuatorSettings {
    fn default() -> Self {
        Self {
            on_duration_minutes: 1,
            schedule_hour: 12,
            schedule_minute: 0,
            schedule_enabled: false,
        }
    }
}

impl ActuatorSettings {
    pub fn sanitize(&mut self) {
        self.on_duration_minutes = self.on_duration_minutes.max(1);
        self.schedule_hour = self.schedule_hour.min(23);
        self.schedule_minute = self.schedule_minute.min(59);
    }

    pub fn validate(&self) -> Result<(), ControllerError> {
        if self.on_duration_minutes == 0 {
            return Err(ControllerError::InvalidSettings(
                "onTimeMinutes must be at least 1",
            ));
        }
        if self.schedule_hour > 23 {
            return Err(ControllerError::InvalidSettings(
                "scheduleHour must be between 0 and 23",
            ));
        }
        if self.schedule_minute > 59 {
            return Err(ControllerError::InvalidSettings(
                "scheduleMinute must be between 0 and 59",
            ));
        }
        Ok(())
    }

    pub fn duration_ms(&self) -> u64 {
        u64::from(self.on_duration_minutes) * 60_000
    }

    /// Trigger time as minutes since midnight.
    pub fn schedule_minutes(&self) -> u16 {
        u16::from(self.schedule_hour) * 60 + u16::from(self.schedule_minute)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PersistedSettings {
    pub actuators: [ActuatorSettings; ACTUATOR_COUNT],
}

impl PersistedSettings {
    pub fn get(&self, id: ActuatorId) -> &ActuatorSettings {
        &self.actuators[id.index()]
    }

    pub fn get_mut(&mut self, id: ActuatorId) -> &mut ActuatorSettings {
        &mut self.actuators[id.index()]
    }

    pub fn sanitize(&mut self) {
        self.actuators.iter_mut().for_each(ActuatorSettings::sanitize);
    }

    /// Merges the fields present in `update`. The whole update is validated
    /// before anything is committed; on error the current values are kept.
    /// Returns whether any stored value actually changed.
    pub fn apply(&mut self, update: &SettingsUpdate) -> Result<bool, ControllerError> {
        let mut candidate = *self;
        for patch in &update.actuators {
            let id = ActuatorId::new(patch.id)?;
            let slot = candidate.get_mut(id);
            if let Some(minutes) = patch.on_time_minutes {
                slot.on_duration_minutes = minutes;
            }
            if let Some(hour) = patch.schedule_hour {
                slot.schedule_hour = hour;
            }
            if let Some(minute) = patch.schedule_minute {
                slot.schedule_minute = minute;
            }
            if let Some(enabled) = patch.schedule_enabled {
                slot.schedule_enabled = enabled;
            }
            slot.validate()?;
        }

        let changed = candidate != *self;
        *self = candidate;
        Ok(changed)
    }

    pub fn view(&self) -> SettingsView {
        SettingsView {
            actuators: ActuatorId::ALL
                .iter()
                .map(|&id| {
                    let settings = self.get(id);
                    ActuatorSettingsView {
                        id,
                        on_time_minutes: settings.on_duration_minutes,
                        schedule_hour: settings.schedule_hour,
                        schedule_minute: settings.schedule_minute,
                        schedule_enabled: settings.schedule_enabled,
                    }
                })
                .collect(),
        }
    }
}

/// Partial settings for one actuator; absent fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActuatorSettingsPatch {
    pub id: u8,
    #[serde(rename = "onTimeMinutes", default)]
    pub on_time_minutes: Option<u32>,
    #[serde(rename = "scheduleHour", default)]
    pub schedule_hour: Option<u8>,
    #[serde(rename = "scheduleMinute", default)]
    pub schedule_minute: Option<u8>,
    #[serde(rename = "scheduleEnabled", default)]
    pub schedule_enabled: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettingsUpdate {
    #[serde(default)]
    pub actuators: Vec<ActuatorSettingsPatch>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub ap_ssid: String,
    pub ap_password: String,
    pub hostname: String,
    pub http_port: u16,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            ap_ssid: "SolenoidController".to_string(),
            ap_password: "12345678".to_string(),
            hostname: "solenoid".to_string(),
            http_port: 80,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuntimeConfig {
    pub controller: ControllerConfig,
    pub network: NetworkConfig,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn patch(id: u8) -> ActuatorSettingsPatch {
        ActuatorSettingsPatch {
            id,
            ..Default::default()
        }
    }

    #[test]
    fn defaults_match_factory_values() {
        let settings = ActuatorSettings::default();
        assert_eq!(settings.on_duration_minutes, 1);
        assert_eq!(settings.schedule_hour, 12);
        assert_eq!(settings.schedule_minute, 0);
        assert!(!settings.schedule_enabled);
        assert_eq!(settings.schedule_minutes(), 720);
    }

    #[test]
    fn sanitize_clamps_out_of_range_fields() {
        let mut settings = ActuatorSettings {
            on_duration_minutes: 0,
            schedule_hour: 40,
            schedule_minute: 99,
            schedule_enabled: true,
        };
        settings.sanitize();
        assert_eq!(settings.on_duration_minutes, 1);
        assert_eq!(settings.schedule_hour, 23);
        assert_eq!(settings.schedule_minute, 59);
    }

    #[test]
    fn apply_touches_only_present_fields() {
        let mut settings = PersistedSettings::default();
        let update = SettingsUpdate {
            actuators: vec![ActuatorSettingsPatch {
                schedule_hour: Some(7),
                ..patch(2)
            }],
        };

        assert!(settings.apply(&update).unwrap());

        let second = settings.get(ActuatorId::TWO);
        assert_eq!(second.schedule_hour, 7);
        assert_eq!(second.schedule_minute, 0);
        assert_eq!(second.on_duration_minutes, 1);
        assert_eq!(*settings.get(ActuatorId::ONE), ActuatorSettings::default());
    }

    #[test]
    fn apply_reports_no_change_for_identical_values() {
        let mut settings = PersistedSettings::default();
        let update = SettingsUpdate {
            actuators: vec![ActuatorSettingsPatch {
                on_time_minutes: Some(1),
                ..patch(1)
            }],
        };
        assert!(!settings.apply(&update).unwrap());
        assert!(!settings.apply(&SettingsUpdate::default()).unwrap());
    }

    #[test]
    fn invalid_patch_rejects_whole_update() {
        let mut settings = PersistedSettings::default();
        let update = SettingsUpdate {
            actuators: vec![
                ActuatorSettingsPatch {
                    on_time_minutes: Some(15),
                    ..patch(1)
                },
                ActuatorSettingsPatch {
                    schedule_minute: Some(60),
                    ..patch(3)
                },
            ],
        };

        assert!(matches!(
            settings.apply(&update),
            Err(ControllerError::InvalidSettings(_))
        ));
        assert_eq!(settings, PersistedSettings::default());
    }

    #[test]
    fn unknown_actuator_in_update_is_rejected() {
        let mut settings = PersistedSettings::default();
        let update = SettingsUpdate {
            actuators: vec![ActuatorSettingsPatch {
                on_time_minutes: Some(5),
                ..patch(7)
            }],
        };
        assert!(matches!(
            settings.apply(&update),
            Err(ControllerError::UnknownActuator(7))
        ));
        assert_eq!(settings, PersistedSettings::default());
    }

    #[test]
    fn update_parses_camel_case_partial_json() {
        let update: SettingsUpdate =
            serde_json::from_str(r#"{"actuators":[{"id":1,"scheduleEnabled":true}]}"#).unwrap();
        assert_eq!(update.actuators.len(), 1);
        assert_eq!(update.actuators[0].schedule_enabled, Some(true));
        assert_eq!(update.actuators[0].on_time_minutes, None);
    }
}
