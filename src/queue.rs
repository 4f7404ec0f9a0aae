// queue.rs
//
// FIFO work queues with a wait/notify signal, used everywhere a thread
// needs to block until work appears instead of busy-polling. This is the
// `std::sync::mpsc` + `Mutex`/`Condvar` "counting signal" pattern the
// original client rolled itself (`IO_Work_Q`/`Main_Work_Q` in
// `client_structs.hpp`) in place of a fixed-capacity ring buffer — no
// crossbeam-channel or parking_lot anywhere in this crate's dependency
// tree, so plain `std::sync` primitives are the idiomatic choice here.
//
// `queue.rs` only defines the primitive and the concrete work item
// shapes. Priority among queues (sets before polls before pubs before
// gets) is the arbiter's job, not the queue's.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use crate::decode::TypedValue;

pub struct WorkQueue<T> {
    items: Mutex<VecDeque<T>>,
    cv: Condvar,
}

impl<T> WorkQueue<T> {
    pub fn new() -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
            cv: Condvar::new(),
        }
    }

    pub fn push(&self, item: T) {
        let mut guard = self.items.lock().expect("work queue mutex poisoned");
        guard.push_back(item);
        self.cv.notify_one();
    }

    pub fn try_pop(&self) -> Option<T> {
        let mut guard = self.items.lock().expect("work queue mutex poisoned");
        guard.pop_front()
    }

    /// Block up to `timeout` for an item to arrive, returning `None` on
    /// timeout. Used by the arbiter's main loop to sleep until either new
    /// work or the next poll deadline, whichever comes first.
    pub fn pop_wait(&self, timeout: Duration) -> Option<T> {
        let guard = self.items.lock().expect("work queue mutex poisoned");
        let (mut guard, _) = self
            .cv
            .wait_timeout_while(guard, timeout, |q| q.is_empty())
            .expect("work queue mutex poisoned");
        guard.pop_front()
    }

    pub fn len(&self) -> usize {
        self.items.lock().expect("work queue mutex poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> Default for WorkQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// A single register write, originating from a `set` method on the bus or
/// the heartbeat write-back. `bit_idx` is populated only when the target
/// decode is a labeled bit of an `individual_bits` decode. `replyto` is
/// unused by listener-originated sets (the listener replies immediately
/// upon validation, per §4.4) and stays `None`; it exists so a future
/// caller that wants a completion-aware reply has somewhere to put one.
#[derive(Clone, Debug)]
pub struct SetWork {
    pub component_idx: usize,
    pub map_idx: usize,
    pub decode_idx: usize,
    pub bit_idx: Option<u8>,
    pub value: TypedValue,
    pub replyto: Option<String>,
}

/// One poll cycle for a whole register map: read `num_registers`
/// registers starting at `start_offset` in a single Modbus request,
/// decode every entry, then enqueue the diffs as `PubWork`.
#[derive(Clone, Copy, Debug)]
pub struct PollWork {
    pub component_idx: usize,
    pub map_idx: usize,
}

/// One component's pub for a poll cycle: every changed (and
/// debounce-surviving) decode from that cycle's register-map read, already
/// formatted and merged into a single JSON object (§4.7: "one JSON object
/// per component pub"). The arbiter only needs to add the heartbeat fields
/// (if any) and send it to `/components/<id>`.
#[derive(Clone, Debug)]
pub struct PubWork {
    pub component_idx: usize,
    pub body: serde_json::Value,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GetSuffix {
    Plain,
    Raw,
    Timings,
    ResetTimings,
}

/// A `get` request from the bus, resolved to a router target before being
/// enqueued so the arbiter never has to re-parse a uri.
#[derive(Clone, Debug)]
pub struct GetWork {
    pub component_idx: usize,
    /// `None` means "every decode in the component" (a bare
    /// `/components/<id>` get).
    pub map_idx: Option<usize>,
    pub decode_idx: Option<usize>,
    pub bit_idx: Option<u8>,
    pub replyto: String,
    pub suffix: GetSuffix,
}

/// The queues the arbiter thread drains, highest priority first: sets
/// before pubs before gets. Polls are generated by the arbiter itself on
/// a schedule, not queued by anyone else, so they have no separate
/// "main" queue. `pub_q` is behind an `Arc` so every I/O worker can hold
/// its own clone and push directly into it without going through the
/// arbiter.
#[derive(Default)]
pub struct MainQueues {
    pub set_q: WorkQueue<SetWork>,
    pub pub_q: Arc<WorkQueue<PubWork>>,
    pub get_q: WorkQueue<GetWork>,
}

/// The two queues an I/O worker drains: one pending set is always
/// serviced before the next scheduled poll batch (§5: "sets before
/// polls").
#[derive(Default)]
pub struct WorkerQueues {
    pub set_q: WorkQueue<SetWork>,
    pub poll_q: WorkQueue<PollWork>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_then_try_pop_round_trips() {
        let q: WorkQueue<u32> = WorkQueue::new();
        assert!(q.try_pop().is_none());
        q.push(7);
        q.push(8);
        assert_eq!(q.try_pop(), Some(7));
        assert_eq!(q.try_pop(), Some(8));
        assert!(q.try_pop().is_none());
    }

    #[test]
    fn pop_wait_times_out_on_empty_queue() {
        let q: WorkQueue<u32> = WorkQueue::new();
        let got = q.pop_wait(Duration::from_millis(20));
        assert_eq!(got, None);
    }

    #[test]
    fn pop_wait_wakes_on_push_from_another_thread() {
        use std::sync::Arc;
        use std::thread;

        let q: Arc<WorkQueue<u32>> = Arc::new(WorkQueue::new());
        let q2 = q.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            q2.push(42);
        });
        let got = q.pop_wait(Duration::from_secs(5));
        assert_eq!(got, Some(42));
        handle.join().unwrap();
    }
}
