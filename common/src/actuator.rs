use crate::{
    schedule::DayKey,
    types::{ActuatorId, ActuatorStatus, EngineAction, OutputState, TriggerSource, ACTUATOR_COUNT},
};

#[derive(Debug, Clone, Copy, Default)]
struct ActuatorRuntime {
    active: bool,
    activated_at_ms: u64,
    duration_ms: u64,
    last_schedule_fire: Option<DayKey>,
}

/// On/off state and shutoff timing for every output channel. Never persisted;
/// a fresh controller starts with all channels off.
#[derive(Debug, Clone, Default)]
pub struct ActuatorController {
    channels: [ActuatorRuntime; ACTUATOR_COUNT],
}

impl ActuatorController {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_active(&self, id: ActuatorId) -> bool {
        self.channels[id.index()].active
    }

    pub fn state(&self, id: ActuatorId) -> OutputState {
        if self.is_active(id) {
            OutputState::On
        } else {
            OutputState::Off
        }
    }

    /// Switches the channel on for `duration_minutes`. Returns `false` and
    /// leaves the running timer untouched if the channel is already on.
    pub fn activate(
        &mut self,
        id: ActuatorId,
        duration_minutes: u32,
        source: TriggerSource,
        now_ms: u64,
        actions: &mut Vec<EngineAction>,
    ) -> bool {
        let channel = &mut self.channels[id.index()];
        if channel.active {
            actions.push(EngineAction::AlreadyActive { id, source });
            return false;
        }

        channel.active = true;
        channel.activated_at_ms = now_ms;
        channel.duration_ms = u64::from(duration_minutes) * 60_000;
        actions.push(EngineAction::OutputOn {
            id,
            duration_minutes,
            source,
        });
        true
    }

    /// Drives the channel off. Returns whether it was on.
    pub fn deactivate(
        &mut self,
        id: ActuatorId,
        source: TriggerSource,
        actions: &mut Vec<EngineAction>,
    ) -> bool {
        let channel = &mut self.channels[id.index()];
        let was_active = channel.active;
        channel.active = false;
        actions.push(EngineAction::OutputOff { id, source });
        was_active
    }

    pub fn toggle(
        &mut self,
        id: ActuatorId,
        duration_minutes: u32,
        source: TriggerSource,
        now_ms: u64,
        actions: &mut Vec<EngineAction>,
    ) -> OutputState {
        if self.is_active(id) {
            self.deactivate(id, source, actions);
        } else {
            self.activate(id, duration_minutes, source, now_ms, actions);
        }
        self.state(id)
    }

    /// Expires the channel once its full duration has elapsed since the
    /// activation tick. Returns `true` if it was switched off.
    pub fn tick(&mut self, id: ActuatorId, now_ms: u64, actions: &mut Vec<EngineAction>) -> bool {
        let channel = self.channels[id.index()];
        if channel.active && now_ms.saturating_sub(channel.activated_at_ms) >= channel.duration_ms {
            self.deactivate(id, TriggerSource::Timer, actions);
            return true;
        }
        false
    }

    pub fn tick_all(&mut self, now_ms: u64, actions: &mut Vec<EngineAction>) {
        for id in ActuatorId::ALL {
            self.tick(id, now_ms, actions);
        }
    }

    pub fn all_off(&mut self, source: TriggerSource, actions: &mut Vec<EngineAction>) {
        for id in ActuatorId::ALL {
            self.deactivate(id, source, actions);
        }
    }

    pub fn remaining_ms(&self, id: ActuatorId, now_ms: u64) -> u64 {
        let channel = &self.channels[id.index()];
        if !channel.active {
            return 0;
        }
        let elapsed = now_ms.saturating_sub(channel.activated_at_ms);
        channel.duration_ms.saturating_sub(elapsed)
    }

    pub fn last_schedule_fire(&self, id: ActuatorId) -> Option<DayKey> {
        self.channels[id.index()].last_schedule_fire
    }

    pub fn record_schedule_fire(&mut self, id: ActuatorId, day_key: DayKey) {
        self.channels[id.index()].last_schedule_fire = Some(day_key);
    }

    pub fn status(&self, now_ms: u64) -> Vec<ActuatorStatus> {
        ActuatorId::ALL
            .iter()
            .map(|&id| ActuatorStatus {
                id,
                active: self.is_active(id),
                remaining_ms: self.remaining_ms(id, now_ms),
            })
            .collect()
    }
}
