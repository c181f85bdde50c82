//! Debounce and press classification for momentary, active-low buttons.
//!
//! Readings use the pull-up convention: `true` is released, `false` is
//! pressed. A reading only becomes the stable state once it has held for
//! longer than the debounce interval since the raw line last changed.
//!
//! | Event                | Emitted when                                      |
//! |----------------------|---------------------------------------------------|
//! | `Pressed`            | stable state flips to pressed                     |
//! | `HeldPastThreshold`  | still pressed longer than the long-press interval |
//! | `Released`           | stable state flips back to released               |
//!
//! Long presses fire while the button is still held. Short presses are only
//! known at release, so `Released { was_long_press: false }` is the short
//! press signal.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ButtonEvent {
    Pressed,
    Released { was_long_press: bool },
    HeldPastThreshold,
}

#[derive(Debug, Clone)]
pub struct Debouncer {
    debounce_ms: u64,
    long_press_ms: u64,
    raw_prev_reading: bool,
    stable_state: bool,
    last_transition_ms: u64,
    press_start_ms: u64,
    long_press_detected: bool,
}

impl Debouncer {
    pub fn new(debounce_ms: u64, long_press_ms: u64) -> Self {
        Self {
            debounce_ms,
            long_press_ms,
            raw_prev_reading: true,
            stable_state: true,
            last_transition_ms: 0,
            press_start_ms: 0,
            long_press_detected: false,
        }
    }

    pub fn is_pressed(&self) -> bool {
        !self.stable_state
    }

    /// Feeds one raw sample taken at `now_ms` and returns at most one event.
    pub fn sample(&mut self, reading: bool, now_ms: u64) -> Option<ButtonEvent> {
        if reading != self.raw_prev_reading {
            self.last_transition_ms = now_ms;
            self.raw_prev_reading = reading;
        }

        let settled = now_ms.saturating_sub(self.last_transition_ms) > self.debounce_ms;
        if settled && reading != self.stable_state {
            self.stable_state = reading;
            return Some(self.confirm_edge(now_ms));
        }

        if self.is_pressed()
            && !self.long_press_detected
            && now_ms.saturating_sub(self.press_start_ms) > self.long_press_ms
        {
            self.long_press_detected = true;
            return Some(ButtonEvent::HeldPastThreshold);
        }

        None
    }

    fn confirm_edge(&mut self, now_ms: u64) -> ButtonEvent {
        if self.is_pressed() {
            self.press_start_ms = now_ms;
            self.long_press_detected = false;
            return ButtonEvent::Pressed;
        }

        let held_ms = now_ms.saturating_sub(self.press_start_ms);
        let was_long_press = self.long_press_detected || held_ms >= self.long_press_ms;
        self.long_press_detected = false;
        ButtonEvent::Released { was_long_press }
    }
}
