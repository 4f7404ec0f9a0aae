// arbiter.rs
//
// The main thread (§4.6): owns the poll schedule, and drains `MainQueues`
// strictly in priority order — sets, then due polls, then pubs, then
// gets — sleeping only when nothing is due. Polls themselves run on the
// I/O workers; the arbiter only decides *when* a register map's next
// poll is due and hands a `PollWork` to that map's assigned worker.
//
// Five consecutive poll-dispatch failures (tracked per worker slot) is
// fatal, matching the original client's "give up after five bad cycles"
// watchdog in `modbus_client.cpp`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::bus::{Message, MessageBus};
use crate::cache::DecodedCache;
use crate::clock::MonotonicClock;
use crate::decode::BitStrings;
use crate::error::fatal;
use crate::events::Event;
use crate::format::{self, StatsMap};
use crate::heartbeat::{self, HeartbeatState};
use crate::logging::glog;
use crate::queue::{GetSuffix, GetWork, MainQueues, PollWork, PubWork, WorkerQueues};
use crate::workspace::Workspace;

const SLEEP_CAP: Duration = Duration::from_millis(50);

struct PollTarget {
    component_idx: usize,
    map_idx: usize,
    frequency_ns: u64,
    next_deadline_ns: u64,
    worker_idx: usize,
}

pub struct Arbiter {
    workspace: Arc<Workspace>,
    cache: Arc<Mutex<DecodedCache>>,
    bus: Arc<dyn MessageBus>,
    main_queues: Arc<MainQueues>,
    worker_queues: Vec<Arc<WorkerQueues>>,
    stats: StatsMap,
    clock: Arc<dyn MonotonicClock>,
    reload_requested: Arc<AtomicBool>,
    targets: Vec<PollTarget>,
    heartbeats: Vec<Option<Mutex<HeartbeatState>>>,
}

impl Arbiter {
    pub fn new(
        workspace: Arc<Workspace>,
        cache: Arc<Mutex<DecodedCache>>,
        bus: Arc<dyn MessageBus>,
        main_queues: Arc<MainQueues>,
        worker_queues: Vec<Arc<WorkerQueues>>,
        stats: StatsMap,
        clock: Arc<dyn MonotonicClock>,
        reload_requested: Arc<AtomicBool>,
    ) -> Self {
        let now = clock.now_ns();
        let mut targets = Vec::new();
        let mut worker_cursor = 0;
        for (component_idx, comp) in workspace.components.iter().enumerate() {
            for (map_idx, _map) in comp.register_maps.iter().enumerate() {
                targets.push(PollTarget {
                    component_idx,
                    map_idx,
                    frequency_ns: comp.frequency_ms * 1_000_000,
                    next_deadline_ns: now,
                    worker_idx: worker_cursor % worker_queues.len().max(1),
                });
                worker_cursor += 1;
            }
        }

        let heartbeats = workspace
            .components
            .iter()
            .map(|c| c.heartbeat.as_ref().map(|_| Mutex::new(HeartbeatState::new())))
            .collect();

        Arbiter {
            workspace,
            cache,
            bus,
            main_queues,
            worker_queues,
            stats,
            clock,
            reload_requested,
            targets,
            heartbeats,
        }
    }

    pub fn run(&mut self) -> ! {
        let mut consecutive_dispatch_errors = 0u32;
        loop {
            if self.reload_requested.load(Ordering::SeqCst) {
                glog!("arbiter: reload flag set, exiting for supervisor restart");
                std::process::exit(0);
            }

            if let Some(set) = self.main_queues.set_q.try_pop() {
                let worker_idx = self.worker_for(set.component_idx, set.map_idx);
                self.worker_queues[worker_idx].set_q.push(set);
                continue;
            }

            let now = self.dispatch_due_polls(&mut consecutive_dispatch_errors);

            if let Some(pub_work) = self.main_queues.pub_q.try_pop() {
                self.dispatch_pub(pub_work);
                continue;
            }

            if let Some(get) = self.main_queues.get_q.try_pop() {
                self.dispatch_get(get);
                continue;
            }

            let earliest = self.targets.iter().map(|t| t.next_deadline_ns).min().unwrap_or(now);
            let sleep_ns = earliest.saturating_sub(now);
            let sleep = Duration::from_nanos(sleep_ns).min(SLEEP_CAP).max(Duration::from_millis(1));
            std::thread::sleep(sleep);
        }
    }

    fn worker_for(&self, component_idx: usize, map_idx: usize) -> usize {
        self.targets
            .iter()
            .find(|t| t.component_idx == component_idx && t.map_idx == map_idx)
            .map(|t| t.worker_idx)
            .unwrap_or(0)
    }

    fn dispatch_due_polls(&mut self, consecutive_dispatch_errors: &mut u32) -> u64 {
        let now = self.clock.now_ns();
        for target in &mut self.targets {
            if now >= target.next_deadline_ns {
                self.worker_queues[target.worker_idx]
                    .poll_q
                    .push(PollWork { component_idx: target.component_idx, map_idx: target.map_idx });
                target.next_deadline_ns = now + target.frequency_ns;
            }
        }
        self.check_heartbeats(now, consecutive_dispatch_errors);
        now
    }

    fn check_heartbeats(&mut self, now: u64, consecutive_dispatch_errors: &mut u32) {
        for (component_idx, comp) in self.workspace.components.iter().enumerate() {
            let Some(hb_cfg) = &comp.heartbeat else { continue };
            let Some(state_cell) = &self.heartbeats[component_idx] else { continue };
            let (map_idx, decode_idx) = hb_cfg.read_decode;
            let read_entry = self
                .cache
                .lock()
                .expect("cache mutex poisoned")
                .get(component_idx, map_idx, decode_idx)
                .clone();

            let (new_read, transition) = state_cell
                .lock()
                .expect("heartbeat mutex poisoned")
                .observe(read_entry.raw, now, hb_cfg.timeout_ms);

            if let Some(event) = heartbeat::transition_event(&comp.id, transition) {
                self.publish_event(event);
                if transition == crate::heartbeat::HeartbeatTransition::Disconnected {
                    *consecutive_dispatch_errors += 1;
                    if *consecutive_dispatch_errors >= 5 {
                        fatal("five consecutive heartbeat-disconnect cycles, giving up");
                    }
                } else {
                    *consecutive_dispatch_errors = 0;
                }
            }

            // §4.8: only write back after observing a *new* heartbeat read,
            // using that read's own decoded value + 1 — not every loop
            // tick, and not the write decode's own (unrelated) cache entry.
            if new_read {
                if let (Some((write_map_idx, write_decode_idx)), Some(current)) =
                    (hb_cfg.write_decode, read_entry.value)
                {
                    let spec = &comp.register_maps[write_map_idx].decodes[write_decode_idx].spec;
                    let next = heartbeat::write_back_value(current, spec.number_of_bits);
                    self.worker_queues[self.worker_for(component_idx, write_map_idx)]
                        .set_q
                        .push(crate::queue::SetWork {
                            component_idx,
                            map_idx: write_map_idx,
                            decode_idx: write_decode_idx,
                            bit_idx: None,
                            value: next,
                            replyto: None,
                        });
                }
            }
        }
    }

    fn publish_event(&self, event: Event) {
        let _ = self.bus.send(&Message::post(crate::events::EVENTS_URI, event.to_body()));
    }

    /// §4.7: one JSON object per component pub, sent to `/components/<id>`.
    /// The worker has already merged every changed decode of this poll
    /// cycle into `work.body`; the arbiter's only job is to add the
    /// heartbeat fields (if the component has one) and send it.
    fn dispatch_pub(&self, work: PubWork) {
        let comp = &self.workspace.components[work.component_idx];
        let Some(mut body) = work.body.as_object().cloned() else { return };

        if let Some(hb_cfg) = &comp.heartbeat {
            let (map_idx, decode_idx) = hb_cfg.read_decode;
            let hb_value = self
                .cache
                .lock()
                .expect("cache mutex poisoned")
                .get(work.component_idx, map_idx, decode_idx)
                .value;
            if let Some(hb_value) = hb_value {
                body.insert("modbus_heartbeat".to_string(), hb_value.to_json());
            }
            let connected = self.heartbeats[work.component_idx]
                .as_ref()
                .map(|s| s.lock().expect("heartbeat mutex poisoned").connected())
                .unwrap_or(false);
            body.insert("component_connected".to_string(), serde_json::json!(connected));
        }

        let uri = format!("/components/{}", comp.id);
        let _ = self.bus.send(&Message::pub_msg(uri, serde_json::Value::Object(body)));
    }

    fn dispatch_get(&self, work: GetWork) {
        let comp = &self.workspace.components[work.component_idx];
        let now = chrono::Local::now();

        let body = match (work.map_idx, work.decode_idx) {
            (Some(map_idx), Some(decode_idx)) => {
                self.get_one(comp, map_idx, decode_idx, work.bit_idx, work.suffix, now)
            }
            _ => match work.suffix {
                GetSuffix::Timings | GetSuffix::ResetTimings => {
                    self.get_component_timings(work.component_idx, comp, work.suffix, now)
                }
                _ => self.get_all(work.component_idx, comp, now),
            },
        };

        let _ = self.bus.send(&Message::reply(work.replyto, body));
    }

    fn get_one(
        &self,
        comp: &crate::workspace::ComponentRuntime,
        map_idx: usize,
        decode_idx: usize,
        bit_idx: Option<u8>,
        suffix: GetSuffix,
        now: chrono::DateTime<chrono::Local>,
    ) -> serde_json::Value {
        let map = &comp.register_maps[map_idx];
        let decode = &map.decodes[decode_idx];
        let spec = &decode.spec;
        let component_idx = self.workspace.find_component_by_id(&comp.id).unwrap_or(0);
        let entry = self.cache.lock().expect("cache mutex poisoned").get(component_idx, map_idx, decode_idx).clone();

        match suffix {
            GetSuffix::Raw => format::format_raw(entry.raw, spec.size, now),
            // The listener only lets `Timings`/`ResetTimings` reach a
            // whole-component `GetWork`, which never has a decode_idx and
            // so never reaches `get_one`; this arm exists for exhaustiveness.
            GetSuffix::Timings | GetSuffix::ResetTimings => {
                serde_json::json!({
                    "error": "timings are only valid on a whole-component uri",
                    "Timestamp": format::timestamp(now),
                })
            }
            GetSuffix::Plain => {
                let Some(value) = entry.value else {
                    return serde_json::json!({ "error": "no value decoded yet", "Timestamp": format::timestamp(now) });
                };
                match (bit_idx, &spec.bit_strings) {
                    (Some(bit), Some(BitStrings::IndividualBits(bits))) => {
                        let label = bits.iter().find(|b| b.bit == bit).and_then(|b| b.label.as_deref()).unwrap_or("");
                        format::format_individual_bit(label, entry.raw & (1u64 << bit) != 0, now)
                    }
                    _ => format::format_decode(spec, value, entry.raw, now),
                }
            }
        }
    }

    fn get_all(
        &self,
        component_idx: usize,
        comp: &crate::workspace::ComponentRuntime,
        now: chrono::DateTime<chrono::Local>,
    ) -> serde_json::Value {
        let mut merged = serde_json::Map::new();
        let cache = self.cache.lock().expect("cache mutex poisoned");
        for (map_idx, map) in comp.register_maps.iter().enumerate() {
            for (decode_idx, decode) in map.decodes.iter().enumerate() {
                let entry = cache.get(component_idx, map_idx, decode_idx);
                let Some(value) = entry.value else { continue };
                let body = match &decode.spec.bit_strings {
                    Some(BitStrings::IndividualBits(bits)) => {
                        for bit in bits {
                            let Some(label) = &bit.label else { continue };
                            merged.insert(label.clone(), serde_json::json!(entry.raw & (1u64 << bit.bit) != 0));
                        }
                        continue;
                    }
                    _ => format::format_decode(&decode.spec, value, entry.raw, now),
                };
                if let Some(obj) = body.as_object() {
                    for (k, v) in obj {
                        if k != "Timestamp" {
                            merged.insert(k.clone(), v.clone());
                        }
                    }
                }
            }
        }
        if comp.heartbeat.is_some() {
            merged.insert("component_connected".to_string(), serde_json::json!(
                self.heartbeats[component_idx]
                    .as_ref()
                    .map(|s| s.lock().expect("heartbeat mutex poisoned").connected())
                    .unwrap_or(false)
            ));
        }
        merged.insert("Timestamp".to_string(), serde_json::json!(format::timestamp(now)));
        serde_json::Value::Object(merged)
    }

    /// `/_timings` and `/_reset_timings` on a whole-component uri (§4.7):
    /// fold every register map's `ResponseTimeStats` into one and, for
    /// `/_reset_timings`, zero them all.
    fn get_component_timings(
        &self,
        component_idx: usize,
        comp: &crate::workspace::ComponentRuntime,
        suffix: GetSuffix,
        now: chrono::DateTime<chrono::Local>,
    ) -> serde_json::Value {
        let mut aggregate = format::ResponseTimeStats::default();
        let mut stats = self.stats.lock().expect("stats mutex poisoned");
        for map_idx in 0..comp.register_maps.len() {
            let entry = stats.entry((component_idx, map_idx)).or_default();
            aggregate.merge(entry);
            if suffix == GetSuffix::ResetTimings {
                entry.reset();
            }
        }
        format::format_timings(&aggregate, now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FakeClock;
    use crate::config::loader::load_str;
    use crate::queue::GetSuffix;
    use std::sync::Mutex as StdMutex;

    struct RecordingBus {
        sent: StdMutex<Vec<Message>>,
    }

    impl RecordingBus {
        fn new() -> Self {
            RecordingBus { sent: StdMutex::new(Vec::new()) }
        }
    }

    impl MessageBus for RecordingBus {
        fn send(&self, msg: &Message) -> Result<(), String> {
            self.sent.lock().expect("recording bus mutex poisoned").push(msg.clone());
            Ok(())
        }
        fn recv_timeout(&self, _timeout: Duration) -> Result<Option<Message>, String> {
            Ok(None)
        }
        fn subscribe(&self, _uri: &str) -> Result<(), String> {
            Ok(())
        }
    }

    fn test_arbiter() -> (Arbiter, Arc<RecordingBus>) {
        let text = r#"{
            "connection": { "ip": "10.0.0.1", "port": 502, "max_num_conns": 2 },
            "components": [ {
                "id": "bms", "frequency_ms": 500,
                "register_maps": [ { "reg_type": "holding", "decodes": [
                    { "id": "soc", "offset": 0, "size": 1 },
                    { "id": "temp", "offset": 1, "size": 1 }
                ] } ]
            } ]
        }"#;
        let (cfg, _) = load_str(text).expect("loads");
        let workspace = Arc::new(Workspace::build(cfg));
        let cache = Arc::new(Mutex::new(DecodedCache::new_for(&workspace)));
        cache.lock().unwrap().update(0, 0, 0, crate::decode::TypedValue::U(42), 42, 0, 0);
        let bus = Arc::new(RecordingBus::new());
        let main_queues = Arc::new(MainQueues::default());
        let worker_queues = vec![Arc::new(WorkerQueues::default()), Arc::new(WorkerQueues::default())];
        let stats: StatsMap = Arc::new(Mutex::new(std::collections::HashMap::new()));
        let clock: Arc<dyn MonotonicClock> = Arc::new(FakeClock::new());
        let reload_requested = Arc::new(AtomicBool::new(false));
        let arbiter = Arbiter::new(
            workspace,
            cache,
            bus.clone() as Arc<dyn MessageBus>,
            main_queues,
            worker_queues,
            stats,
            clock,
            reload_requested,
        );
        (arbiter, bus)
    }

    #[test]
    fn dispatch_get_replies_with_decoded_value() {
        let (arbiter, bus) = test_arbiter();
        arbiter.dispatch_get(GetWork {
            component_idx: 0,
            map_idx: Some(0),
            decode_idx: Some(0),
            bit_idx: None,
            replyto: "/replies/1".to_string(),
            suffix: GetSuffix::Plain,
        });
        let sent = bus.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].uri, "/replies/1");
        assert_eq!(sent[0].body["soc"], 42);
    }

    #[test]
    fn dispatch_get_all_of_component_merges_every_decode() {
        let (arbiter, bus) = test_arbiter();
        cache_set(&arbiter, 0, 0, 1, 7);
        arbiter.dispatch_get(GetWork {
            component_idx: 0,
            map_idx: None,
            decode_idx: None,
            bit_idx: None,
            replyto: "/replies/2".to_string(),
            suffix: GetSuffix::Plain,
        });
        let sent = bus.sent.lock().unwrap();
        assert_eq!(sent[0].body["soc"], 42);
        assert_eq!(sent[0].body["temp"], 7);
    }

    #[test]
    fn dispatch_pub_publishes_merged_body_to_bare_component_uri() {
        let (arbiter, bus) = test_arbiter();
        let body = serde_json::json!({ "soc": 42, "temp": 7, "Timestamp": "07-26-2026 12:30:00.000000" });
        arbiter.dispatch_pub(PubWork { component_idx: 0, body });
        let sent = bus.sent.lock().unwrap();
        assert_eq!(sent[0].uri, "/components/bms");
        assert_eq!(sent[0].body["soc"], 42);
        assert_eq!(sent[0].body["temp"], 7);
    }

    #[test]
    fn dispatch_pub_adds_heartbeat_fields_when_component_has_heartbeat() {
        let text = r#"{
            "connection": { "ip": "10.0.0.1", "port": 502, "max_num_conns": 2 },
            "components": [ {
                "id": "bms", "frequency_ms": 500,
                "register_maps": [ { "reg_type": "holding", "decodes": [
                    { "id": "soc", "offset": 0, "size": 1 },
                    { "id": "hb", "offset": 1, "size": 1 }
                ] } ],
                "heartbeat": { "enabled": true, "read_decode_id": "hb", "timeout_ms": 2000 }
            } ]
        }"#;
        let (cfg, _) = load_str(text).expect("loads");
        let workspace = Arc::new(Workspace::build(cfg));
        let cache = Arc::new(Mutex::new(DecodedCache::new_for(&workspace)));
        cache.lock().unwrap().update(0, 0, 1, crate::decode::TypedValue::U(9), 9, 0, 0);
        let bus = Arc::new(RecordingBus::new());
        let main_queues = Arc::new(MainQueues::default());
        let worker_queues = vec![Arc::new(WorkerQueues::default())];
        let stats: StatsMap = Arc::new(Mutex::new(std::collections::HashMap::new()));
        let clock: Arc<dyn MonotonicClock> = Arc::new(FakeClock::new());
        let reload_requested = Arc::new(AtomicBool::new(false));
        let arbiter = Arbiter::new(
            workspace,
            cache,
            bus.clone() as Arc<dyn MessageBus>,
            main_queues,
            worker_queues,
            stats,
            clock,
            reload_requested,
        );

        let body = serde_json::json!({ "soc": 42, "Timestamp": "07-26-2026 12:30:00.000000" });
        arbiter.dispatch_pub(PubWork { component_idx: 0, body });
        let sent = bus.sent.lock().unwrap();
        assert_eq!(sent[0].uri, "/components/bms");
        assert_eq!(sent[0].body["modbus_heartbeat"], 9);
        assert_eq!(sent[0].body["component_connected"], true);
    }

    #[test]
    fn worker_for_round_robins_across_register_maps() {
        let (arbiter, _bus) = test_arbiter();
        assert_eq!(arbiter.worker_for(0, 0), 0);
    }

    #[test]
    fn dispatch_get_timings_on_whole_component_returns_stats_body() {
        let (arbiter, bus) = test_arbiter();
        arbiter.stats.lock().unwrap().entry((0, 0)).or_default().record(100);
        arbiter.dispatch_get(GetWork {
            component_idx: 0,
            map_idx: None,
            decode_idx: None,
            bit_idx: None,
            replyto: "/replies/3".to_string(),
            suffix: GetSuffix::Timings,
        });
        let sent = bus.sent.lock().unwrap();
        assert_eq!(sent[0].body["num_timings_recorded"], 1);
        assert_eq!(sent[0].body["avg_response_time"], 100.0);
    }

    #[test]
    fn reset_timings_then_timings_reports_zero() {
        let (arbiter, bus) = test_arbiter();
        arbiter.stats.lock().unwrap().entry((0, 0)).or_default().record(100);
        arbiter.dispatch_get(GetWork {
            component_idx: 0,
            map_idx: None,
            decode_idx: None,
            bit_idx: None,
            replyto: "/replies/4".to_string(),
            suffix: GetSuffix::ResetTimings,
        });
        arbiter.dispatch_get(GetWork {
            component_idx: 0,
            map_idx: None,
            decode_idx: None,
            bit_idx: None,
            replyto: "/replies/5".to_string(),
            suffix: GetSuffix::Timings,
        });
        let sent = bus.sent.lock().unwrap();
        let body = &sent[1].body;
        assert_eq!(body["num_timings_recorded"], 0);
        assert_eq!(body["avg_response_time"], 0.0);
        assert_eq!(body["min_response_time"], 0);
        assert_eq!(body["max_response_time"], 0);
    }

    fn heartbeat_arbiter() -> (Arbiter, Arc<RecordingBus>) {
        let text = r#"{
            "connection": { "ip": "10.0.0.1", "port": 502, "max_num_conns": 2 },
            "components": [ {
                "id": "bms", "frequency_ms": 500,
                "register_maps": [ { "reg_type": "holding", "decodes": [
                    { "id": "hb", "offset": 0, "size": 1 },
                    { "id": "hb_write", "offset": 1, "size": 1 }
                ] } ],
                "heartbeat": {
                    "enabled": true, "read_decode_id": "hb", "write_decode_id": "hb_write",
                    "timeout_ms": 2000
                }
            } ]
        }"#;
        let (cfg, _) = load_str(text).expect("loads");
        let workspace = Arc::new(Workspace::build(cfg));
        let cache = Arc::new(Mutex::new(DecodedCache::new_for(&workspace)));
        let bus = Arc::new(RecordingBus::new());
        let main_queues = Arc::new(MainQueues::default());
        let worker_queues = vec![Arc::new(WorkerQueues::default())];
        let stats: StatsMap = Arc::new(Mutex::new(std::collections::HashMap::new()));
        let clock: Arc<dyn MonotonicClock> = Arc::new(FakeClock::new());
        let reload_requested = Arc::new(AtomicBool::new(false));
        let arbiter = Arbiter::new(
            workspace,
            cache,
            bus.clone() as Arc<dyn MessageBus>,
            main_queues,
            worker_queues,
            stats,
            clock,
            reload_requested,
        );
        (arbiter, bus)
    }

    #[test]
    fn heartbeat_write_back_fires_once_per_new_read_with_read_value() {
        let (mut arbiter, _bus) = heartbeat_arbiter();
        let mut errors = 0u32;

        // First read: hb goes from uninitialized to 5, a new read.
        cache_set(&arbiter, 0, 0, 0, 5);
        arbiter.check_heartbeats(0, &mut errors);
        let pending: Vec<_> = std::iter::from_fn(|| arbiter.worker_queues[0].set_q.try_pop()).collect();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].map_idx, 0);
        assert_eq!(pending[0].decode_idx, 1);
        assert_eq!(pending[0].value.as_u64(), 6);

        // Same raw value again: not a new read, no write-back queued.
        arbiter.check_heartbeats(1_000_000, &mut errors);
        assert!(arbiter.worker_queues[0].set_q.try_pop().is_none());
    }

    fn cache_set(arbiter: &Arbiter, comp: usize, map: usize, decode: usize, raw: u64) {
        arbiter
            .cache
            .lock()
            .unwrap()
            .update(comp, map, decode, crate::decode::TypedValue::U(raw), raw, 0, 0);
    }
}
