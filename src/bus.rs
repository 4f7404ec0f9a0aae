// bus.rs
//
// The FIMS-style message bus client. The wire format itself isn't
// specified by anything in this crate's lineage (FIMS is an external
// system the gateway talks to, never a library it links against), so
// this is new code: a length-prefixed JSON envelope over a Unix domain
// socket, matching the one a real FIMS client library would present
// (method/uri/replyto/body) without depending on one.

use std::io::{Read, Write};
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Method {
    Get,
    Set,
    Pub,
    Post,
    Delete,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Message {
    pub method: Method,
    pub uri: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub replyto: Option<String>,
    pub body: serde_json::Value,
}

impl Message {
    pub fn pub_msg(uri: impl Into<String>, body: serde_json::Value) -> Self {
        Self { method: Method::Pub, uri: uri.into(), replyto: None, body }
    }

    /// Used for `/events`, which §6 reserves `pub` from (that's `/components/<id>`).
    pub fn post(uri: impl Into<String>, body: serde_json::Value) -> Self {
        Self { method: Method::Post, uri: uri.into(), replyto: None, body }
    }

    pub fn reply(replyto: impl Into<String>, body: serde_json::Value) -> Self {
        Self { method: Method::Set, uri: replyto.into(), replyto: None, body }
    }
}

pub trait MessageBus: Send + Sync {
    fn send(&self, msg: &Message) -> Result<(), String>;
    /// Blocks up to `timeout` for the next inbound message. `Ok(None)`
    /// means the timeout elapsed with nothing received — a normal event
    /// for the listener loop, not an error.
    fn recv_timeout(&self, timeout: Duration) -> Result<Option<Message>, String>;
    fn subscribe(&self, uri: &str) -> Result<(), String>;
}

/// Writes/reads `Message`s as a 4-byte little-endian length prefix
/// followed by that many bytes of UTF-8 JSON.
pub struct UnixSocketBus {
    stream: Mutex<UnixStream>,
}

impl UnixSocketBus {
    pub fn connect(path: &Path) -> Result<Self, String> {
        let stream = UnixStream::connect(path)
            .map_err(|e| format!("failed to connect to message bus at {}: {}", path.display(), e))?;
        stream
            .set_read_timeout(Some(Duration::from_millis(50)))
            .map_err(|e| format!("failed to set read timeout: {}", e))?;
        Ok(Self { stream: Mutex::new(stream) })
    }

    fn write_frame(stream: &mut UnixStream, payload: &[u8]) -> Result<(), String> {
        let len = payload.len() as u32;
        stream
            .write_all(&len.to_le_bytes())
            .and_then(|_| stream.write_all(payload))
            .map_err(|e| format!("failed to write to message bus: {}", e))
    }

    fn read_frame(stream: &mut UnixStream, timeout: Duration) -> Result<Option<Vec<u8>>, String> {
        stream
            .set_read_timeout(Some(timeout))
            .map_err(|e| format!("failed to set read timeout: {}", e))?;

        let mut len_buf = [0u8; 4];
        match stream.read_exact(&mut len_buf) {
            Ok(()) => {}
            Err(e) if matches!(e.kind(), std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut) => {
                return Ok(None)
            }
            Err(e) => return Err(format!("failed to read from message bus: {}", e)),
        }
        let len = u32::from_le_bytes(len_buf) as usize;
        let mut payload = vec![0u8; len];
        stream
            .read_exact(&mut payload)
            .map_err(|e| format!("failed to read message body: {}", e))?;
        Ok(Some(payload))
    }
}

impl MessageBus for UnixSocketBus {
    fn send(&self, msg: &Message) -> Result<(), String> {
        let payload = serde_json::to_vec(msg).map_err(|e| format!("failed to serialize message: {}", e))?;
        let mut stream = self.stream.lock().expect("message bus mutex poisoned");
        Self::write_frame(&mut stream, &payload)
    }

    fn recv_timeout(&self, timeout: Duration) -> Result<Option<Message>, String> {
        let mut stream = self.stream.lock().expect("message bus mutex poisoned");
        let Some(payload) = Self::read_frame(&mut stream, timeout)? else {
            return Ok(None);
        };
        let msg = serde_json::from_slice(&payload)
            .map_err(|e| format!("failed to parse message from bus: {}", e))?;
        Ok(Some(msg))
    }

    fn subscribe(&self, uri: &str) -> Result<(), String> {
        self.send(&Message {
            method: Method::Get,
            uri: format!("/subscribe{}", uri),
            replyto: None,
            body: serde_json::Value::Null,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_round_trips_through_json() {
        let msg = Message {
            method: Method::Set,
            uri: "/components/bms/soc".to_string(),
            replyto: Some("/replies/1".to_string()),
            body: serde_json::json!({ "value": 42 }),
        };
        let encoded = serde_json::to_string(&msg).unwrap();
        let decoded: Message = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded.uri, msg.uri);
        assert_eq!(decoded.replyto, msg.replyto);
        assert_eq!(decoded.body, msg.body);
    }

    #[test]
    fn method_serializes_lowercase() {
        let encoded = serde_json::to_string(&Method::Pub).unwrap();
        assert_eq!(encoded, "\"pub\"");
    }
}
