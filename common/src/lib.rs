pub mod actuator;
pub mod clock;
pub mod config;
pub mod debounce;
pub mod engine;
pub mod error;
pub mod record;
pub mod schedule;
pub mod settings;
pub mod types;

pub use actuator::ActuatorController;
pub use clock::SoftClock;
pub use config::{
    ActuatorSettings, ActuatorSettingsPatch, ControllerConfig, NetworkConfig, PersistedSettings,
    RuntimeConfig, SettingsUpdate,
};
pub use debounce::{ButtonEvent, Debouncer};
pub use engine::ControllerEngine;
pub use error::{ControllerError, StoreError};
pub use schedule::{day_key, DayKey, ScheduleEvaluator};
pub use settings::{ConfigStore, LoadSource, MemoryStore, SettingsModel};
pub use types::{
    ActuatorId, ActuatorSettingsView, ActuatorStatus, ButtonId, ClockView, ControllerStatus,
    DateTimeRequest, EngineAction, OutputState, SettingsUpdateResponse, SettingsView,
    ToggleResponse, TriggerSource, ACTUATOR_COUNT, BUTTON_COUNT,
};
