// listener.rs
//
// The one thread that ever touches the message bus socket (§4.4). It
// blocks up to 2 seconds per `recv_timeout`, classifies each inbound
// message by method and uri suffix, validates the request shape itself
// (so a malformed request never reaches a worker), and either answers
// immediately (a bad request, a `/_reload`) or hands validated work to
// the arbiter's `MainQueues`. A non-timeout receive failure is fatal:
// the bus is the only way this process hears from the outside world.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::bus::{Message, MessageBus, Method};
use crate::decode::TypedValue;
use crate::error::fatal;
use crate::logging::glog;
use crate::queue::{GetSuffix, GetWork, MainQueues, SetWork};
use crate::router::{RouteTarget, Router};
use crate::workspace::Workspace;

const RECV_TIMEOUT: Duration = Duration::from_secs(2);

pub struct Listener {
    bus: Arc<dyn MessageBus>,
    router: Arc<Router>,
    workspace: Arc<Workspace>,
    queues: Arc<MainQueues>,
    reload_requested: Arc<AtomicBool>,
}

impl Listener {
    pub fn new(
        bus: Arc<dyn MessageBus>,
        router: Arc<Router>,
        workspace: Arc<Workspace>,
        queues: Arc<MainQueues>,
        reload_requested: Arc<AtomicBool>,
    ) -> Self {
        Listener { bus, router, workspace, queues, reload_requested }
    }

    pub fn run(&self) -> ! {
        loop {
            match self.bus.recv_timeout(RECV_TIMEOUT) {
                Ok(Some(msg)) => self.handle(msg),
                Ok(None) => continue,
                Err(e) => fatal(format!("listener: message bus receive failed: {}", e)),
            }
        }
    }

    fn handle(&self, msg: Message) {
        if msg.uri.ends_with("/_reload") {
            self.reload_requested.store(true, Ordering::SeqCst);
            glog!("listener: reload requested via {}", msg.uri);
            if let Some(replyto) = msg.replyto {
                let _ = self.bus.send(&Message::reply(replyto, serde_json::json!({"status": "ok"})));
            }
            return;
        }

        let (base_uri, suffix) = strip_suffix(&msg.uri);

        match msg.method {
            Method::Set => self.handle_set(base_uri, suffix, msg.body, msg.replyto),
            Method::Get => self.handle_get(base_uri, suffix, msg.replyto),
            Method::Pub | Method::Post | Method::Delete => {
                glog!("listener: ignoring unsupported method on {}", msg.uri);
            }
        }
    }

    fn reply_error(&self, replyto: Option<String>, message: String) {
        glog!("listener: {}", message);
        if let Some(replyto) = replyto {
            let _ = self.bus.send(&Message::reply(replyto, serde_json::json!({"error": message})));
        }
    }

    fn handle_set(&self, uri: &str, suffix: GetSuffix, body: serde_json::Value, replyto: Option<String>) {
        if suffix != GetSuffix::Plain {
            return self.reply_error(replyto, format!("uri \"{}\" is not settable", uri));
        }

        let target = match self.router.lookup(uri) {
            Ok(t) => t,
            Err(e) => return self.reply_error(replyto, e),
        };

        // Multi-set: a whole-component uri with an object body whose keys
        // each append to the uri to resolve a per-field target (§4.4).
        if let RouteTarget::AllOfComponent { .. } = target {
            let Some(fields) = body.as_object() else {
                return self.reply_error(replyto, format!("uri \"{}\" requires an object body", uri));
            };
            let mut items = Vec::with_capacity(fields.len());
            for (field, field_body) in fields {
                let field_uri = format!("{}/{}", uri, field);
                match self.resolve_set_item(&field_uri, field_body) {
                    Ok(item) => items.push(item),
                    Err(e) => {
                        glog!("listener: multi-set field \"{}\" rejected: {}", field_uri, e);
                        return self.reply_error(replyto, e);
                    }
                }
            }
            if let Some(replyto) = replyto {
                let _ = self.bus.send(&Message::reply(replyto, body.clone()));
            }
            for item in items {
                self.queues.set_q.push(item);
            }
            return;
        }

        match self.resolve_set_item(uri, &body) {
            Ok(item) => {
                if let Some(replyto) = replyto {
                    let _ = self.bus.send(&Message::reply(replyto, body.clone()));
                }
                self.queues.set_q.push(item);
            }
            Err(e) => self.reply_error(replyto, e),
        }
    }

    /// Resolve one settable leaf uri plus a scalar/clothed body into a
    /// `SetWork`, applying the Coil/individual-bit `{0,1}` restriction
    /// and the read-only-type rejection (§4.4).
    fn resolve_set_item(&self, uri: &str, body: &serde_json::Value) -> Result<SetWork, String> {
        let target = self.router.lookup(uri)?;
        let RouteTarget::Decode { component_idx, map_idx, decode_idx, bit_idx } = target else {
            return Err(format!("uri \"{}\" is not settable", uri));
        };

        let comp = &self.workspace.components[component_idx];
        let reg_type = comp.register_maps[map_idx].reg_type;

        let value = extract_set_value(body)?;

        let is_boolean_leaf = bit_idx.is_some() || matches!(reg_type, crate::decode::RegKind::Coil);
        if is_boolean_leaf {
            let raw = value.as_u64();
            if raw != 0 && raw != 1 {
                return Err(format!("uri \"{}\" only accepts 0 or 1, got {}", uri, raw));
            }
        }
        if !matches!(reg_type, crate::decode::RegKind::Holding | crate::decode::RegKind::Coil) {
            return Err(format!("uri \"{}\" is read-only", uri));
        }

        Ok(SetWork { component_idx, map_idx, decode_idx, bit_idx, value, replyto: None })
    }

    fn handle_get(&self, uri: &str, suffix: GetSuffix, replyto: Option<String>) {
        let Some(replyto) = replyto else {
            return glog!("listener: dropping get on {} with no replyto", uri);
        };
        let target = match self.router.lookup(uri) {
            Ok(t) => t,
            Err(e) => return self.reply_error(Some(replyto), e),
        };

        let is_timings = matches!(suffix, GetSuffix::Timings | GetSuffix::ResetTimings);
        if is_timings && !matches!(target, RouteTarget::AllOfComponent { .. }) {
            return self.reply_error(Some(replyto), format!("uri \"{}\" is not a whole-component uri", uri));
        }

        let get_work = match target {
            RouteTarget::AllOfComponent { component_idx } => GetWork {
                component_idx,
                map_idx: None,
                decode_idx: None,
                bit_idx: None,
                replyto,
                suffix,
            },
            RouteTarget::Decode { component_idx, map_idx, decode_idx, bit_idx } => GetWork {
                component_idx,
                map_idx: Some(map_idx),
                decode_idx: Some(decode_idx),
                bit_idx,
                replyto,
                suffix,
            },
        };
        self.queues.get_q.push(get_work);
    }
}

fn strip_suffix(uri: &str) -> (&str, GetSuffix) {
    const SUFFIXES: &[(&str, GetSuffix)] = &[
        ("/_raw", GetSuffix::Raw),
        ("/_reset_timings", GetSuffix::ResetTimings),
        ("/_timings", GetSuffix::Timings),
    ];
    for (suffix, kind) in SUFFIXES {
        if let Some(base) = uri.strip_suffix(suffix) {
            return (base, *kind);
        }
    }
    (uri, GetSuffix::Plain)
}

fn extract_set_value(body: &serde_json::Value) -> Result<TypedValue, String> {
    let inner = body.get("value").unwrap_or(body);
    if let Some(b) = inner.as_bool() {
        return Ok(TypedValue::U(b as u64));
    }
    if let Some(u) = inner.as_u64() {
        return Ok(TypedValue::U(u));
    }
    if let Some(i) = inner.as_i64() {
        return Ok(TypedValue::I(i));
    }
    if let Some(f) = inner.as_f64() {
        return Ok(TypedValue::F(f));
    }
    Err(format!("set body has no numeric/boolean value: {}", body))
}
