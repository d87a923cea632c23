use serde::{Deserialize, Serialize};

/// Colour of one controlled link of a traffic light.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SignalState {
    Off = 0,
    Red = 1,
    RedYellow = 2,
    Green = 3,
    Yellow = 4,
}

impl SignalState {
    /// Parse one character of the simulator's light state string.
    ///
    /// Case is ignored, so major (`G`) and minor (`g`) green are both green.
    pub fn from_state_char(c: char) -> Option<SignalState> {
        match c.to_ascii_lowercase() {
            'o' => Some(SignalState::Off),
            'r' => Some(SignalState::Red),
            'u' | 'a' => Some(SignalState::RedYellow),
            'g' => Some(SignalState::Green),
            'y' => Some(SignalState::Yellow),
            _ => None,
        }
    }

    pub fn code(self) -> u8 {
        self as u8
    }
}

/// Snapshot of one traffic light program at one simulation step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrafficLight {
    pub id: String,
    /// Per-link signal colours, in link index order.
    pub signals: Vec<SignalState>,
    pub phase_nr: i32,
    pub program_id: String,
    /// Seconds until the next phase switch, rounded to milliseconds.
    pub time_to_switch: f64,
}

impl TrafficLight {
    /// Build a snapshot from the raw simulator values.
    ///
    /// Unknown state characters are dropped with a warning.
    pub fn from_state(
        id: &str,
        state: &str,
        phase_nr: i32,
        program_id: &str,
        next_switch_s: f64,
        now_s: f64,
    ) -> Self {
        let signals = state
            .chars()
            .filter_map(|c| {
                let signal = SignalState::from_state_char(c);
                if signal.is_none() {
                    log::warn!("Unknown signal state '{}' at traffic light {}", c, id);
                }
                signal
            })
            .collect();
        TrafficLight {
            id: id.to_string(),
            signals,
            phase_nr,
            program_id: program_id.to_string(),
            time_to_switch: ((next_switch_s - now_s) * 1000.0).round() / 1000.0,
        }
    }
}
