use chrono::NaiveDateTime;

use crate::{
    actuator::ActuatorController,
    config::{ControllerConfig, PersistedSettings, SettingsUpdate},
    debounce::{ButtonEvent, Debouncer},
    error::{ControllerError, StoreError},
    schedule::{day_key, ScheduleEvaluator},
    settings::{ConfigStore, LoadSource, SettingsModel},
    types::{
        ActuatorId, ButtonId, ControllerStatus, EngineAction, OutputState, SettingsView,
        TriggerSource, BUTTON_COUNT,
    },
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PressTrigger {
    /// Fire when a short press is released.
    ShortRelease,
    /// Fire as soon as the press edge is confirmed.
    PressEdge,
}

#[derive(Debug, Clone, Copy)]
struct ButtonBinding {
    trigger: PressTrigger,
    targets: &'static [ActuatorId],
    long_press_starts_access_point: bool,
}

const BUTTON_BINDINGS: [ButtonBinding; BUTTON_COUNT] = [
    ButtonBinding {
        trigger: PressTrigger::ShortRelease,
        targets: &[ActuatorId::ONE, ActuatorId::TWO],
        long_press_starts_access_point: true,
    },
    ButtonBinding {
        trigger: PressTrigger::PressEdge,
        targets: &[ActuatorId::THREE],
        long_press_starts_access_point: false,
    },
];

/// The whole core state, owned by the driver loop. Every mutation goes
/// through `&mut self`, so there is exactly one writer.
#[derive(Debug)]
pub struct ControllerEngine<S> {
    pub config: ControllerConfig,
    settings: SettingsModel<S>,
    buttons: [Debouncer; BUTTON_COUNT],
    actuators: ActuatorController,
    evaluator: ScheduleEvaluator,
}

impl<S: ConfigStore> ControllerEngine<S> {
    pub fn new(config: ControllerConfig, settings: SettingsModel<S>) -> Self {
        Self {
            buttons: std::array::from_fn(|_| {
                Debouncer::new(config.debounce_ms, config.long_press_ms)
            }),
            evaluator: ScheduleEvaluator::new(config.schedule_window_minutes),
            actuators: ActuatorController::new(),
            settings,
            config,
        }
    }

    /// Forces every output off and loads persisted settings. The access
    /// point is requested at boot so the device is reachable right away.
    pub fn startup(&mut self) -> (Result<LoadSource, StoreError>, Vec<EngineAction>) {
        let mut actions = Vec::new();
        self.actuators.all_off(TriggerSource::Startup, &mut actions);
        let loaded = self.settings.load();
        actions.push(EngineAction::StartAccessPoint);
        (loaded, actions)
    }

    /// One driver-loop pass: debounce inputs, act on button events, expire
    /// timed-out actuators, then evaluate schedules.
    pub fn poll(
        &mut self,
        inputs: [bool; BUTTON_COUNT],
        now_ms: u64,
        wall_clock: Option<&NaiveDateTime>,
    ) -> Vec<EngineAction> {
        let mut actions = Vec::new();

        for button in ButtonId::ALL {
            let reading = inputs[button.index()];
            if let Some(event) = self.buttons[button.index()].sample(reading, now_ms) {
                self.handle_button_event(button, event, now_ms, &mut actions);
            }
        }

        self.actuators.tick_all(now_ms, &mut actions);
        self.evaluate_schedules(now_ms, wall_clock, &mut actions);

        actions
    }

    pub fn handle_button_event(
        &mut self,
        button: ButtonId,
        event: ButtonEvent,
        now_ms: u64,
        actions: &mut Vec<EngineAction>,
    ) {
        let binding = BUTTON_BINDINGS[button.index()];
        let fire = match event {
            ButtonEvent::Pressed => binding.trigger == PressTrigger::PressEdge,
            ButtonEvent::Released { was_long_press } => {
                binding.trigger == PressTrigger::ShortRelease && !was_long_press
            }
            ButtonEvent::HeldPastThreshold => {
                if binding.long_press_starts_access_point {
                    actions.push(EngineAction::StartAccessPoint);
                }
                false
            }
        };

        if fire {
            for &id in binding.targets {
                let minutes = self.settings.get(id).on_duration_minutes;
                self.actuators
                    .activate(id, minutes, TriggerSource::Button(button), now_ms, actions);
            }
        }
    }

    fn evaluate_schedules(
        &mut self,
        now_ms: u64,
        wall_clock: Option<&NaiveDateTime>,
        actions: &mut Vec<EngineAction>,
    ) {
        let Some(now) = wall_clock else {
            return;
        };

        for id in ActuatorId::ALL {
            let settings = *self.settings.get(id);
            let last_fire = self.actuators.last_schedule_fire(id);
            if !self.evaluator.evaluate(&settings, last_fire, Some(now)) {
                continue;
            }

            // The day is consumed even when the channel is already on.
            self.actuators.record_schedule_fire(id, day_key(now));
            self.actuators.activate(
                id,
                settings.on_duration_minutes,
                TriggerSource::Schedule,
                now_ms,
                actions,
            );
        }
    }

    pub fn toggle(&mut self, id: ActuatorId, now_ms: u64) -> (OutputState, Vec<EngineAction>) {
        let mut actions = Vec::new();
        let minutes = self.settings.get(id).on_duration_minutes;
        let state = self
            .actuators
            .toggle(id, minutes, TriggerSource::Remote, now_ms, &mut actions);
        (state, actions)
    }

    pub fn toggle_raw(
        &mut self,
        raw_id: u8,
        now_ms: u64,
    ) -> Result<(ActuatorId, OutputState, Vec<EngineAction>), ControllerError> {
        let id = ActuatorId::new(raw_id)?;
        let (state, actions) = self.toggle(id, now_ms);
        Ok((id, state, actions))
    }

    pub fn update_settings(&mut self, update: &SettingsUpdate) -> Result<bool, ControllerError> {
        self.settings.update(update)
    }

    pub fn settings(&self) -> &PersistedSettings {
        self.settings.settings()
    }

    pub fn settings_view(&self) -> SettingsView {
        self.settings.settings().view()
    }

    pub fn is_active(&self, id: ActuatorId) -> bool {
        self.actuators.is_active(id)
    }

    pub fn is_button_pressed(&self, button: ButtonId) -> bool {
        self.buttons[button.index()].is_pressed()
    }

    pub fn store(&self) -> &S {
        self.settings.store()
    }

    pub fn store_mut(&mut self) -> &mut S {
        self.settings.store_mut()
    }

    pub fn status(
        &self,
        now_ms: u64,
        formatted_time: Option<String>,
        access_point_active: bool,
    ) -> ControllerStatus {
        ControllerStatus {
            actuators: self.actuators.status(now_ms),
            time_synced: formatted_time.is_some(),
            time: formatted_time,
            access_point_active,
            uptime_ms: now_ms,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::ActuatorSettingsPatch,
        settings::MemoryStore,
    };
    use chrono::NaiveDate;

    const UP: [bool; BUTTON_COUNT] = [true, true];
    const FIRST_DOWN: [bool; BUTTON_COUNT] = [false, true];
    const SECOND_DOWN: [bool; BUTTON_COUNT] = [true, false];

    fn engine() -> ControllerEngine<MemoryStore> {
        let mut engine = ControllerEngine::new(
            ControllerConfig::default(),
            SettingsModel::new(MemoryStore::new()),
        );
        let (loaded, _) = engine.startup();
        assert_eq!(loaded.unwrap(), LoadSource::Defaults);
        engine
    }

    fn run(
        engine: &mut ControllerEngine<MemoryStore>,
        inputs: [bool; BUTTON_COUNT],
        from: u64,
        to: u64,
    ) -> Vec<EngineAction> {
        (from..=to)
            .step_by(10)
            .flat_map(|t| engine.poll(inputs, t, None))
            .collect()
    }

    fn at(day: u32, hour: u32, minute: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2026, 4, day)
            .unwrap()
            .and_hms_opt(hour, minute, 0)
            .unwrap()
    }

    fn enable_schedule(engine: &mut ControllerEngine<MemoryStore>, id: u8, hour: u8, minute: u8) {
        let update = SettingsUpdate {
            actuators: vec![ActuatorSettingsPatch {
                id,
                schedule_hour: Some(hour),
                schedule_minute: Some(minute),
                schedule_enabled: Some(true),
                ..Default::default()
            }],
        };
        engine.update_settings(&update).unwrap();
    }

    #[test]
    fn startup_forces_outputs_off_and_requests_access_point() {
        let mut engine = ControllerEngine::new(
            ControllerConfig::default(),
            SettingsModel::new(MemoryStore::new()),
        );
        let (_, actions) = engine.startup();

        let offs = actions
            .iter()
            .filter(|action| matches!(action, EngineAction::OutputOff { .. }))
            .count();
        assert_eq!(offs, 3);
        assert_eq!(actions.last(), Some(&EngineAction::StartAccessPoint));
    }

    #[test]
    fn short_press_on_first_button_activates_first_two_actuators_on_release() {
        let mut engine = engine();

        let actions = run(&mut engine, FIRST_DOWN, 0, 500);
        assert!(actions.is_empty());
        assert!(!engine.is_active(ActuatorId::ONE));

        let actions = run(&mut engine, UP, 510, 700);
        assert!(engine.is_active(ActuatorId::ONE));
        assert!(engine.is_active(ActuatorId::TWO));
        assert!(!engine.is_active(ActuatorId::THREE));
        assert_eq!(
            actions
                .iter()
                .filter(|action| matches!(action, EngineAction::OutputOn { .. }))
                .count(),
            2
        );
    }

    #[test]
    fn long_press_requests_access_point_without_activating() {
        let mut engine = engine();

        let actions = run(&mut engine, FIRST_DOWN, 0, 6_000);
        assert_eq!(actions, vec![EngineAction::StartAccessPoint]);

        run(&mut engine, UP, 6_010, 6_500);
        assert!(!engine.is_active(ActuatorId::ONE));
        assert!(!engine.is_active(ActuatorId::TWO));
    }

    #[test]
    fn second_button_activates_third_actuator_on_press_edge() {
        let mut engine = engine();

        run(&mut engine, SECOND_DOWN, 0, 100);
        assert!(engine.is_active(ActuatorId::THREE));
        assert!(engine.is_button_pressed(ButtonId::Secondary));
        assert!(!engine.is_active(ActuatorId::ONE));
    }

    #[test]
    fn button_press_while_active_does_not_restart_timer() {
        let mut engine = engine();
        run(&mut engine, SECOND_DOWN, 0, 100);
        run(&mut engine, UP, 110, 300);

        let actions = run(&mut engine, SECOND_DOWN, 30_000, 30_100);
        assert!(actions.contains(&EngineAction::AlreadyActive {
            id: ActuatorId::THREE,
            source: TriggerSource::Button(ButtonId::Secondary),
        }));

        // Confirmed at t=60, so the one-minute default ends at t=60_060.
        run(&mut engine, UP, 30_110, 60_050);
        assert!(engine.is_active(ActuatorId::THREE));
        run(&mut engine, UP, 60_060, 60_070);
        assert!(!engine.is_active(ActuatorId::THREE));
    }

    #[test]
    fn remote_toggle_uses_configured_duration() {
        let mut engine = engine();
        let update = SettingsUpdate {
            actuators: vec![ActuatorSettingsPatch {
                id: 2,
                on_time_minutes: Some(3),
                ..Default::default()
            }],
        };
        engine.update_settings(&update).unwrap();

        let (state, actions) = engine.toggle(ActuatorId::TWO, 1_000);
        assert_eq!(state, OutputState::On);
        assert_eq!(
            actions,
            vec![EngineAction::OutputOn {
                id: ActuatorId::TWO,
                duration_minutes: 3,
                source: TriggerSource::Remote,
            }]
        );

        assert!(engine.poll(UP, 180_999, None).is_empty());
        assert_eq!(
            engine.poll(UP, 181_000, None),
            vec![EngineAction::OutputOff {
                id: ActuatorId::TWO,
                source: TriggerSource::Timer,
            }]
        );
    }

    #[test]
    fn toggle_with_unknown_id_mutates_nothing() {
        let mut engine = engine();
        assert!(matches!(
            engine.toggle_raw(4, 0),
            Err(ControllerError::UnknownActuator(4))
        ));
        assert!(ActuatorId::ALL.iter().all(|&id| !engine.is_active(id)));
    }

    #[test]
    fn schedule_fires_once_per_day() {
        let mut engine = engine();
        enable_schedule(&mut engine, 1, 7, 30);

        let actions = engine.poll(UP, 0, Some(&at(10, 7, 30)));
        assert!(actions.contains(&EngineAction::OutputOn {
            id: ActuatorId::ONE,
            duration_minutes: 1,
            source: TriggerSource::Schedule,
        }));

        // Shut off by the timer, then back inside the window the same day.
        engine.poll(UP, 60_000, Some(&at(10, 7, 31)));
        assert!(!engine.is_active(ActuatorId::ONE));
        engine.poll(UP, 61_000, Some(&at(10, 7, 32)));
        assert!(!engine.is_active(ActuatorId::ONE));

        engine.poll(UP, 90_000_000, Some(&at(11, 7, 30)));
        assert!(engine.is_active(ActuatorId::ONE));
    }

    #[test]
    fn schedule_during_manual_activation_is_consumed_for_the_day() {
        let mut engine = engine();
        enable_schedule(&mut engine, 3, 18, 0);
        let update = SettingsUpdate {
            actuators: vec![ActuatorSettingsPatch {
                id: 3,
                on_time_minutes: Some(1),
                ..Default::default()
            }],
        };
        engine.update_settings(&update).unwrap();

        engine.toggle(ActuatorId::THREE, 0);
        let actions = engine.poll(UP, 10, Some(&at(12, 18, 0)));
        assert!(actions.contains(&EngineAction::AlreadyActive {
            id: ActuatorId::THREE,
            source: TriggerSource::Schedule,
        }));

        engine.poll(UP, 60_000, Some(&at(12, 18, 1)));
        assert!(!engine.is_active(ActuatorId::THREE));
        let actions = engine.poll(UP, 60_010, Some(&at(12, 18, 1)));
        assert!(actions.is_empty());
        assert!(!engine.is_active(ActuatorId::THREE));
    }

    #[test]
    fn schedule_waits_for_wall_clock() {
        let mut engine = engine();
        enable_schedule(&mut engine, 2, 12, 0);

        assert!(engine.poll(UP, 0, None).is_empty());
        assert!(!engine.is_active(ActuatorId::TWO));
    }
}
