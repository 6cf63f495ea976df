//! Virtual time for device models.
//!
//! Devices see time through a [`TimeSource`]: a pausable guest-time clock
//! derived from a [`HostClock`]. Deferred device work goes through a
//! [`TimerQueue`], a deadline-ordered queue of opaque payloads drained by the
//! host loop with [`TimerQueue::pop_due`]. Nothing here spawns threads or
//! sleeps; determinism is the point.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

/// Monotonic host time in nanoseconds.
pub trait HostClock: Send + Sync {
    fn now_ns(&self) -> u64;
}

/// Manually driven clock for tests.
pub struct FakeHostClock {
    ns: AtomicU64,
}

impl FakeHostClock {
    pub fn new(start_ns: u64) -> Self {
        Self {
            ns: AtomicU64::new(start_ns),
        }
    }

    pub fn set_ns(&self, ns: u64) {
        self.ns.store(ns, Ordering::SeqCst);
    }

    pub fn advance_ns(&self, delta: u64) {
        self.ns.fetch_add(delta, Ordering::SeqCst);
    }
}

impl HostClock for FakeHostClock {
    fn now_ns(&self) -> u64 {
        self.ns.load(Ordering::SeqCst)
    }
}

/// Wall-clock backed host clock.
pub struct StdHostClock {
    origin: Instant,
}

impl StdHostClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for StdHostClock {
    fn default() -> Self {
        Self::new()
    }
}

impl HostClock for StdHostClock {
    fn now_ns(&self) -> u64 {
        self.origin.elapsed().as_nanos() as u64
    }
}

struct TimeSourceState {
    host: Arc<dyn HostClock>,
    // Guest ns accumulated before `base`; guest time while running is
    // `accumulated + (host - base)`.
    base_host_ns: AtomicU64,
    accumulated_ns: AtomicU64,
    paused: AtomicBool,
}

/// Pausable guest-time clock. Clones share state, so a device holding a
/// handle observes pauses performed by the host.
#[derive(Clone)]
pub struct TimeSource {
    state: Arc<TimeSourceState>,
}

impl TimeSource {
    pub fn new(host: Arc<dyn HostClock>) -> Self {
        let base = host.now_ns();
        Self {
            state: Arc::new(TimeSourceState {
                host,
                base_host_ns: AtomicU64::new(base),
                accumulated_ns: AtomicU64::new(0),
                paused: AtomicBool::new(false),
            }),
        }
    }

    pub fn now_ns(&self) -> u64 {
        let s = &self.state;
        let acc = s.accumulated_ns.load(Ordering::SeqCst);
        if s.paused.load(Ordering::SeqCst) {
            acc
        } else {
            acc + (s.host.now_ns() - s.base_host_ns.load(Ordering::SeqCst))
        }
    }

    pub fn now_ms(&self) -> u64 {
        self.now_ns() / 1_000_000
    }

    pub fn pause(&self) {
        let s = &self.state;
        if !s.paused.swap(true, Ordering::SeqCst) {
            let elapsed = s.host.now_ns() - s.base_host_ns.load(Ordering::SeqCst);
            s.accumulated_ns.fetch_add(elapsed, Ordering::SeqCst);
        }
    }

    pub fn resume(&self) {
        let s = &self.state;
        if s.paused.swap(false, Ordering::SeqCst) {
            s.base_host_ns.store(s.host.now_ns(), Ordering::SeqCst);
        }
    }
}

/// A scheduled timer that has come due.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimerEvent<P> {
    pub deadline_ns: u64,
    pub payload: P,
}

/// Deadline-ordered deferred work.
///
/// At most one entry exists per payload value: scheduling a payload that is
/// already queued moves its deadline instead of duplicating it, which is the
/// behaviour device re-arm paths rely on. Ties drain in scheduling order.
pub struct TimerQueue<P> {
    entries: Mutex<Vec<(u64, u64, P)>>,
    seq: AtomicU64,
}

impl<P: PartialEq> TimerQueue<P> {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            seq: AtomicU64::new(0),
        }
    }

    /// Schedule `payload` at `deadline_ns`, re-arming it if already queued.
    pub fn schedule(&self, payload: P, deadline_ns: u64) {
        let mut entries = self.entries.lock().unwrap();
        entries.retain(|(_, _, p)| *p != payload);
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        entries.push((deadline_ns, seq, payload));
    }

    /// Drop a queued payload, if present.
    pub fn cancel(&self, payload: &P) {
        self.entries.lock().unwrap().retain(|(_, _, p)| p != payload);
    }

    /// Drop everything queued.
    pub fn clear(&self) {
        self.entries.lock().unwrap().clear();
    }

    /// Earliest queued deadline.
    pub fn next_deadline_ns(&self) -> Option<u64> {
        self.entries
            .lock()
            .unwrap()
            .iter()
            .map(|(d, _, _)| *d)
            .min()
    }

    /// Remove and return the earliest entry whose deadline is ≤ `now_ns`.
    pub fn pop_due(&self, now_ns: u64) -> Option<TimerEvent<P>> {
        let mut entries = self.entries.lock().unwrap();
        let idx = entries
            .iter()
            .enumerate()
            .filter(|(_, (d, _, _))| *d <= now_ns)
            .min_by_key(|(_, (d, s, _))| (*d, *s))
            .map(|(i, _)| i)?;
        let (deadline_ns, _, payload) = entries.remove(idx);
        Some(TimerEvent {
            deadline_ns,
            payload,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().unwrap().is_empty()
    }
}

impl<P: PartialEq> Default for TimerQueue<P> {
    fn default() -> Self {
        Self::new()
    }
}
