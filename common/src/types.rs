use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::ControllerError;

pub const ACTUATOR_COUNT: usize = 3;
pub const BUTTON_COUNT: usize = 2;

/// Physical output channel, always one of 1, 2 or 3.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct ActuatorId(u8);

impl ActuatorId {
    pub const ONE: Self = Self(1);
    pub const TWO: Self = Self(2);
    pub const THREE: Self = Self(3);
    pub const ALL: [Self; ACTUATOR_COUNT] = [Self::ONE, Self::TWO, Self::THREE];

    pub fn new(raw: u8) -> Result<Self, ControllerError> {
        if (1..=ACTUATOR_COUNT as u8).contains(&raw) {
            Ok(Self(raw))
        } else {
            Err(ControllerError::UnknownActuator(raw))
        }
    }

    pub fn get(self) -> u8 {
        self.0
    }

    pub fn index(self) -> usize {
        usize::from(self.0 - 1)
    }
}

impl TryFrom<u8> for ActuatorId {
    type Error = ControllerError;

    fn try_from(raw: u8) -> Result<Self, Self::Error> {
        Self::new(raw)
    }
}

impl From<ActuatorId> for u8 {
    fn from(id: ActuatorId) -> Self {
        id.0
    }
}

impl fmt::Display for ActuatorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ButtonId {
    Primary,
    Secondary,
}

impl ButtonId {
    pub const ALL: [Self; BUTTON_COUNT] = [Self::Primary, Self::Secondary];

    pub fn from_number(raw: u8) -> Result<Self, ControllerError> {
        match raw {
            1 => Ok(Self::Primary),
            2 => Ok(Self::Secondary),
            other => Err(ControllerError::UnknownButton(other)),
        }
    }

    pub fn index(self) -> usize {
        match self {
            Self::Primary => 0,
            Self::Secondary => 1,
        }
    }

    pub fn number(self) -> u8 {
        self.index() as u8 + 1
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputState {
    On,
    Off,
}

impl OutputState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::On => "on",
            Self::Off => "off",
        }
    }

    pub fn is_on(self) -> bool {
        self == Self::On
    }
}

/// What caused an actuator to be switched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerSource {
    Button(ButtonId),
    Schedule,
    Remote,
    Timer,
    Startup,
}

/// Side effects requested by the engine. The platform layer executes them
/// in order; the engine has already updated its own state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineAction {
    OutputOn {
        id: ActuatorId,
        duration_minutes: u32,
        source: TriggerSource,
    },
    OutputOff {
        id: ActuatorId,
        source: TriggerSource,
    },
    /// A trigger hit an actuator that was already on. Drives no hardware.
    AlreadyActive {
        id: ActuatorId,
        source: TriggerSource,
    },
    StartAccessPoint,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActuatorSettingsView {
    pub id: ActuatorId,
    #[serde(rename = "onTimeMinutes")]
    pub on_time_minutes: u32,
    #[serde(rename = "scheduleHour")]
    pub schedule_hour: u8,
    #[serde(rename = "scheduleMinute")]
    pub schedule_minute: u8,
    #[serde(rename = "scheduleEnabled")]
    pub schedule_enabled: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettingsView {
    pub actuators: Vec<ActuatorSettingsView>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SettingsUpdateResponse {
    pub status: &'static str,
    pub message: &'static str,
    pub settings: SettingsView,
}

#[derive(Debug, Clone, Serialize)]
pub struct ToggleResponse {
    pub status: &'static str,
    pub id: ActuatorId,
    pub state: OutputState,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ActuatorStatus {
    pub id: ActuatorId,
    pub active: bool,
    #[serde(rename = "remainingMs")]
    pub remaining_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ControllerStatus {
    pub actuators: Vec<ActuatorStatus>,
    #[serde(rename = "timeSynced")]
    pub time_synced: bool,
    pub time: Option<String>,
    #[serde(rename = "accessPointActive")]
    pub access_point_active: bool,
    #[serde(rename = "uptimeMs")]
    pub uptime_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct DateTimeRequest {
    pub year: i32,
    pub month: u32,
    pub day: u32,
    pub hour: u32,
    pub minute: u32,
    #[serde(default)]
    pub second: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct ClockView {
    pub status: &'static str,
    #[serde(rename = "timeSynced")]
    pub time_synced: bool,
    pub time: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn actuator_id_rejects_out_of_range() {
        assert!(matches!(
            ActuatorId::new(0),
            Err(ControllerError::UnknownActuator(0))
        ));
        assert!(matches!(
            ActuatorId::new(4),
            Err(ControllerError::UnknownActuator(4))
        ));
        assert_eq!(ActuatorId::new(3).unwrap().index(), 2);
    }

    #[test]
    fn actuator_id_deserializes_through_validation() {
        let id: ActuatorId = serde_json::from_str("2").unwrap();
        assert_eq!(id, ActuatorId::TWO);
        assert!(serde_json::from_str::<ActuatorId>("9").is_err());
    }

    #[test]
    fn output_state_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&OutputState::On).unwrap(), "\"on\"");
        assert_eq!(OutputState::Off.as_str(), "off");
    }

    #[test]
    fn button_numbers_map_to_indices() {
        assert_eq!(ButtonId::from_number(1).unwrap(), ButtonId::Primary);
        assert_eq!(ButtonId::Secondary.number(), 2);
        assert!(ButtonId::from_number(3).is_err());
    }
}
