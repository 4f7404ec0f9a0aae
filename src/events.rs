// events.rs
//
// Observable state changes (heartbeat disconnect/reconnect, initial Modbus
// connect, configuration warnings) are posted to `/events` as
// `{"source":"Modbus Client","message":"…","severity":0..4}`. This mirrors
// `emit_event(...)` calls sprinkled through `modbus_client.cpp`.

use serde::Serialize;

pub const EVENT_SOURCE: &str = "Modbus Client";
pub const EVENTS_URI: &str = "/events";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[repr(u8)]
pub enum EventSeverity {
    Debug = 0,
    Info = 1,
    Notice = 2,
    Warning = 3,
    Alarm = 4,
}

#[derive(Clone, Debug, Serialize)]
pub struct Event {
    pub source: &'static str,
    pub message: String,
    pub severity: EventSeverity,
}

impl Event {
    pub fn new(severity: EventSeverity, message: impl Into<String>) -> Self {
        Self {
            source: EVENT_SOURCE,
            message: message.into(),
            severity,
        }
    }

    pub fn info(message: impl Into<String>) -> Self {
        Self::new(EventSeverity::Info, message)
    }

    pub fn warning(message: impl Into<String>) -> Self {
        Self::new(EventSeverity::Warning, message)
    }

    pub fn alarm(message: impl Into<String>) -> Self {
        Self::new(EventSeverity::Alarm, message)
    }

    pub fn to_body(&self) -> serde_json::Value {
        serde_json::json!({
            "source": self.source,
            "message": self.message,
            "severity": self.severity as u8,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_with_numeric_severity() {
        let ev = Event::alarm("component disconnected");
        let body = ev.to_body();
        assert_eq!(body["severity"], 4);
        assert_eq!(body["source"], "Modbus Client");
        assert_eq!(body["message"], "component disconnected");
    }
}
