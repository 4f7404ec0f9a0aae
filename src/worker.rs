// worker.rs
//
// One I/O worker thread per connection slot (`max_num_conns`, truncated
// to the number of register maps that actually exist). Each worker owns
// its own `ModbusTransport` and drains its `WorkerQueues`: a pending set
// always goes out before the next scheduled poll batch (§5). This is the
// "blocking request function per poll group" pattern from the teacher's
// `io/modbus_tcp/reader.rs`, minus the async task spawn — here the
// blocking call just runs on the worker's own OS thread.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::cache::{DecodedCache, UpdateOutcome};
use crate::clock::MonotonicClock;
use crate::config::ConnectionCfg;
use crate::decode::engine;
use crate::decode::RegKind;
use crate::error::fatal;
use crate::format::{self, StatsMap};
use crate::logging::glog;
use crate::modbus_io::{classify_io_error, IoErrorClass, ModbusTransport};
use crate::queue::{PollWork, PubWork, SetWork, WorkerQueues};
use crate::workspace::Workspace;

pub type Connector = Box<dyn Fn() -> Result<Box<dyn ModbusTransport>, String> + Send>;

/// Five consecutive set/poll errors on the same worker is fatal (§4.6/§7/§8),
/// matching the teacher's own `max_register_errors` watchdog in
/// `io/modbus_tcp/reader.rs`.
const MAX_CONSECUTIVE_ERRORS: u32 = 5;

pub struct Worker {
    worker_id: usize,
    connector: Connector,
    transport: Option<Box<dyn ModbusTransport>>,
    workspace: Arc<Workspace>,
    cache: Arc<Mutex<DecodedCache>>,
    queues: Arc<WorkerQueues>,
    pub_q: Arc<crate::queue::WorkQueue<PubWork>>,
    clock: Arc<dyn MonotonicClock>,
    word_swap: bool,
    multi_write_op_code: bool,
    consecutive_errors: u32,
    stats: StatsMap,
}

impl Worker {
    /// Establishes the initial connection. A failure here is fatal (§4.5):
    /// there is no point starting a worker that can never do its job.
    pub fn new(
        worker_id: usize,
        connection: &ConnectionCfg,
        connector: Connector,
        workspace: Arc<Workspace>,
        cache: Arc<Mutex<DecodedCache>>,
        queues: Arc<WorkerQueues>,
        pub_q: Arc<crate::queue::WorkQueue<PubWork>>,
        clock: Arc<dyn MonotonicClock>,
        stats: StatsMap,
    ) -> Self {
        let transport = match connector() {
            Ok(t) => Some(t),
            Err(e) => fatal(format!("worker {} failed initial connect: {}", worker_id, e)),
        };
        Worker {
            worker_id,
            connector,
            transport,
            workspace,
            cache,
            queues,
            pub_q,
            clock,
            word_swap: connection.word_swap,
            multi_write_op_code: connection.multi_write_op_code,
            consecutive_errors: 0,
            stats,
        }
    }

    /// Drain loop: drains any pending set before blocking (up to 200ms)
    /// for the next poll batch. Never returns except via `fatal`.
    pub fn run(&mut self) -> ! {
        loop {
            if let Some(set) = self.queues.set_q.try_pop() {
                self.handle_set(set);
                continue;
            }
            if let Some(poll) = self.queues.poll_q.pop_wait(Duration::from_millis(200)) {
                self.handle_poll(poll);
            }
        }
    }

    fn ensure_connected(&mut self) -> bool {
        if self.transport.is_some() {
            return true;
        }
        match (self.connector)() {
            Ok(t) => {
                self.transport = Some(t);
                glog!("worker {}: reconnected", self.worker_id);
                true
            }
            Err(e) => {
                glog!("worker {}: reconnect failed: {}", self.worker_id, e);
                false
            }
        }
    }

    fn note_error(&mut self, class: IoErrorClass, message: &str) {
        match class {
            IoErrorClass::Transient => {
                glog!("worker {}: transient error, dropping this cycle: {}", self.worker_id, message);
            }
            IoErrorClass::Reconnect => {
                glog!("worker {}: connection error, will reconnect: {}", self.worker_id, message);
                self.transport = None;
            }
            IoErrorClass::Fatal => {
                fatal(format!("worker {}: unrecoverable transport error: {}", self.worker_id, message));
            }
        }
    }

    fn handle_set(&mut self, set: SetWork) {
        if !self.ensure_connected() {
            return;
        }
        let comp = &self.workspace.components[set.component_idx];
        let map = &comp.register_maps[set.map_idx];
        let decode = &map.decodes[set.decode_idx];
        let spec = &decode.spec;

        let previous_raw = self
            .cache
            .lock()
            .expect("cache mutex poisoned")
            .get(set.component_idx, set.map_idx, set.decode_idx)
            .previous_raw();

        let words = engine::encode_with_word_swap(
            spec,
            set.value,
            set.bit_idx,
            previous_raw,
            map.reg_type,
            self.word_swap,
        );

        let transport = self.transport.as_mut().expect("checked by ensure_connected");
        transport.set_slave(comp.device_id);

        let result = match map.reg_type {
            RegKind::Holding => {
                if self.multi_write_op_code || words.len() > 1 {
                    transport.write_multiple_registers(spec.offset, &words)
                } else {
                    transport.write_single_register(spec.offset, words[0])
                }
            }
            RegKind::Coil => {
                let bit_set = set.value.as_u64() != 0;
                if self.multi_write_op_code {
                    transport.write_multiple_coils(spec.offset, &[bit_set])
                } else {
                    transport.write_single_coil(spec.offset, bit_set)
                }
            }
            RegKind::Input | RegKind::DiscreteInput => {
                Err("cannot write a read-only register".to_string())
            }
        };

        match result {
            Ok(()) => {
                self.consecutive_errors = 0;
            }
            Err(e) => {
                self.consecutive_errors += 1;
                self.note_error(classify_io_error(&e), &e);
                self.check_consecutive_errors();
            }
        }
    }

    /// Five consecutive set/poll errors on this worker exits the process
    /// (§4.6: "five consecutive error cycles exit the client"). Errors
    /// already classified `Fatal` exit immediately via `note_error` and
    /// never reach here with a full counter.
    fn check_consecutive_errors(&self) {
        if self.consecutive_errors >= MAX_CONSECUTIVE_ERRORS {
            fatal(format!(
                "worker {}: {} consecutive errors, giving up",
                self.worker_id, self.consecutive_errors
            ));
        }
    }

    fn handle_poll(&mut self, poll: PollWork) {
        if !self.ensure_connected() {
            return;
        }
        let comp = &self.workspace.components[poll.component_idx];
        let map = &comp.register_maps[poll.map_idx];

        let started = self.clock.now_ns();
        let transport = self.transport.as_mut().expect("checked by ensure_connected");
        transport.set_slave(comp.device_id);
        let result = if map.reg_type.is_register() {
            transport
                .read_registers(map.reg_type, map.start_offset, map.num_registers)
                .map(RawBatch::Words)
        } else {
            transport
                .read_bits(map.reg_type, map.start_offset, map.num_registers)
                .map(RawBatch::Bits)
        };
        let elapsed_us = (self.clock.now_ns().saturating_sub(started)) / 1_000;

        let batch = match result {
            Ok(batch) => {
                self.consecutive_errors = 0;
                self.stats
                    .lock()
                    .expect("stats mutex poisoned")
                    .entry((poll.component_idx, poll.map_idx))
                    .or_default()
                    .record(elapsed_us);
                batch
            }
            Err(e) => {
                self.consecutive_errors += 1;
                self.note_error(classify_io_error(&e), &e);
                self.check_consecutive_errors();
                return;
            }
        };

        let now_ns = self.clock.now_ns();
        let wall_now = chrono::Local::now();
        let mut merged = serde_json::Map::new();
        let mut cache = self.cache.lock().expect("cache mutex poisoned");
        for (decode_idx, decode) in map.decodes.iter().enumerate() {
            let spec = &decode.spec;
            let start = (spec.offset - map.start_offset) as usize;
            let (value, raw) = match &batch {
                RawBatch::Words(words) => {
                    let slice = &words[start..start + spec.size as usize];
                    engine::decode_with_word_swap(slice, spec, map.reg_type, self.word_swap)
                }
                RawBatch::Bits(bits) => {
                    let raw = bits[start] as u64;
                    (crate::decode::TypedValue::U(raw), raw)
                }
            };

            let outcome = cache.update(
                poll.component_idx,
                poll.map_idx,
                decode_idx,
                value,
                raw,
                spec.debounce_ms,
                now_ns,
            );

            let UpdateOutcome::Changed { should_publish: true, changed_bits } = outcome else { continue };

            match &spec.bit_strings {
                Some(crate::decode::BitStrings::IndividualBits(bits)) => {
                    for bit in bits {
                        let Some(label) = &bit.label else { continue };
                        if changed_bits & (1u64 << bit.bit) != 0 {
                            merged.insert(label.clone(), serde_json::json!(raw & (1u64 << bit.bit) != 0));
                        }
                    }
                }
                _ => {
                    let body = format::format_decode(spec, value, raw, wall_now);
                    if let Some(obj) = body.as_object() {
                        for (k, v) in obj {
                            if k != "Timestamp" {
                                merged.insert(k.clone(), v.clone());
                            }
                        }
                    }
                }
            }
        }
        drop(cache);

        // §4.7: one JSON object per component pub, merging every changed
        // decode from this cycle's register-map read.
        if !merged.is_empty() {
            merged.insert("Timestamp".to_string(), serde_json::json!(format::timestamp(wall_now)));
            self.pub_q.push(PubWork {
                component_idx: poll.component_idx,
                body: serde_json::Value::Object(merged),
            });
        }
    }
}

enum RawBatch {
    Words(Vec<u16>),
    Bits(Vec<bool>),
}
