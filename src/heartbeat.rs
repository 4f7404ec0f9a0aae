// heartbeat.rs
//
// Per-component connectivity tracking driven by a heartbeat register: if
// the read-side value hasn't changed in `timeout_ms`, the component is
// declared disconnected; the first change afterward reconnects it. This
// mirrors the heartbeat bookkeeping in `modbus_client.cpp`'s pub cycle,
// including the literal reconnect/disconnect event text and the
// write-back-by-incrementing behavior on the write side.

use crate::decode::TypedValue;
use crate::events::Event;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HeartbeatTransition {
    None,
    Reconnected,
    Disconnected,
}

pub struct HeartbeatState {
    connected: bool,
    last_raw: Option<u64>,
    last_change_ns: u64,
}

impl HeartbeatState {
    pub fn new() -> Self {
        Self {
            connected: true,
            last_raw: None,
            last_change_ns: 0,
        }
    }

    pub fn connected(&self) -> bool {
        self.connected
    }

    /// Feed a freshly read heartbeat raw value. Returns whether this raw
    /// value differs from the last one observed (a "new read" in §4.8's
    /// sense) together with the connectivity transition, if any, so the
    /// caller can post an event and gate the write-back on the former.
    pub fn observe(&mut self, raw: u64, now_ns: u64, timeout_ms: u64) -> (bool, HeartbeatTransition) {
        let changed = self.last_raw != Some(raw);
        if changed {
            self.last_raw = Some(raw);
            self.last_change_ns = now_ns;
            if !self.connected {
                self.connected = true;
                return (true, HeartbeatTransition::Reconnected);
            }
            return (true, HeartbeatTransition::None);
        }

        let elapsed_ms = now_ns.saturating_sub(self.last_change_ns) / 1_000_000;
        if self.connected && elapsed_ms >= timeout_ms {
            self.connected = false;
            return (false, HeartbeatTransition::Disconnected);
        }
        (false, HeartbeatTransition::None)
    }
}

impl Default for HeartbeatState {
    fn default() -> Self {
        Self::new()
    }
}

pub fn transition_event(component_id: &str, transition: HeartbeatTransition) -> Option<Event> {
    match transition {
        HeartbeatTransition::Reconnected => Some(Event::info(format!(
            "Heartbeat for component \"{}\" reconnected.",
            component_id
        ))),
        HeartbeatTransition::Disconnected => Some(Event::alarm(format!(
            "Heartbeat for component \"{}\" disconnected.",
            component_id
        ))),
        HeartbeatTransition::None => None,
    }
}

/// The write-back value for a heartbeat write decode: increment and wrap
/// at the decode's own bit width, same as `heartbeat_val.u += 1` in the
/// original client.
pub fn write_back_value(current: TypedValue, number_of_bits: u8) -> TypedValue {
    let width = number_of_bits.max(1) as u32;
    let mask: u64 = if width >= 64 { u64::MAX } else { (1u64 << width) - 1 };
    TypedValue::U((current.as_u64().wrapping_add(1)) & mask)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disconnects_after_timeout_with_no_change() {
        let mut hb = HeartbeatState::new();
        assert_eq!(hb.observe(1, 0, 1000), (true, HeartbeatTransition::None));
        assert_eq!(hb.observe(1, 2_000_000_000, 1000), (false, HeartbeatTransition::Disconnected));
        assert!(!hb.connected());
    }

    #[test]
    fn reconnects_on_next_change_after_disconnect() {
        let mut hb = HeartbeatState::new();
        hb.observe(1, 0, 1000);
        hb.observe(1, 2_000_000_000, 1000);
        assert_eq!(hb.observe(2, 2_100_000_000, 1000), (true, HeartbeatTransition::Reconnected));
        assert!(hb.connected());
    }

    #[test]
    fn stays_connected_while_value_keeps_changing() {
        let mut hb = HeartbeatState::new();
        hb.observe(1, 0, 1000);
        assert_eq!(hb.observe(2, 500_000_000, 1000), (true, HeartbeatTransition::None));
        assert_eq!(hb.observe(3, 1_000_000_000, 1000), (true, HeartbeatTransition::None));
        assert!(hb.connected());
    }

    #[test]
    fn unchanged_read_reports_false() {
        let mut hb = HeartbeatState::new();
        hb.observe(1, 0, 1000);
        assert_eq!(hb.observe(1, 500_000_000, 1000), (false, HeartbeatTransition::None));
    }

    #[test]
    fn write_back_increments_and_wraps() {
        let next = write_back_value(TypedValue::U(15), 4);
        assert_eq!(next.as_u64(), 0);
        let next = write_back_value(TypedValue::U(5), 4);
        assert_eq!(next.as_u64(), 6);
    }

    #[test]
    fn disconnect_event_text_matches() {
        let ev = transition_event("bms", HeartbeatTransition::Disconnected).unwrap();
        assert_eq!(ev.message, "Heartbeat for component \"bms\" disconnected.");
    }
}
