//! `UpstreamMonitor`: one upstream subscription shared by many subscribers.
//!
//! Mirrors `epics-base`'s `MonitorCacheEntry` (`p2pApp/moncache.cpp`) and the
//! fan-out-under-one-lock pattern of `cdk-common::pub_sub::Pubsub`
//! (`publish_internal` collects targets under a read lock and calls them
//! after dropping it; here the same single `Mutex` guards both the
//! subscriber list and every subscriber's queue, per §4.C/§5's "shared
//! mutex contract").

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::fingerprint::RequestFingerprint;
use crate::queue::{MonitorQueue, PolledUpdate};
use crate::type_mapper::StructureDescriptor;
use crate::value::{ChangeMask, StructuredValue};

/// Outcome of the upstream subscribe attempt, sticky once terminal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartStatus {
    /// `start()` has not been attempted yet.
    Pending,
    /// Upstream accepted the subscription.
    Connected,
    /// Upstream rejected the subscription.
    Failed(String),
    /// Upstream signalled "no more updates"; sticky.
    Terminated,
}

/// The injected upstream collaborator: starts a subscription against the
/// remote PVA network or the local record database. Both are out of scope
/// here — this trait is the seam, exactly as `cdk-common::pub_sub::Spec`
/// is the teacher's seam for event backfill.
pub trait UpstreamChannel: Send + Sync + fmt::Debug {
    /// Initiate (or re-confirm) the upstream subscription.
    fn start(&self) -> std::result::Result<(), String>;
}

/// Callback target invoked once a subscriber has something to poll. Invoked
/// with no internal lock held (§5 "Suspension").
pub trait WakeupSink: Send + Sync + fmt::Debug {
    /// Called after a fan-out pass added at least one thing to this
    /// subscriber's control or data queue.
    fn wakeup(&self);
}

/// Monotonically increasing counters, exposed for operational tooling (§6).
#[derive(Debug, Default)]
pub struct Counters {
    wakeups: AtomicU64,
    events: AtomicU64,
    dropped: AtomicU64,
}

impl Counters {
    fn bump_wakeups(&self) {
        self.wakeups.fetch_add(1, Ordering::Relaxed);
    }
    fn bump_events(&self) {
        self.events.fetch_add(1, Ordering::Relaxed);
    }

    /// `(wakeups, events, dropped)`.
    pub fn snapshot(&self) -> (u64, u64, u64) {
        (
            self.wakeups.load(Ordering::Relaxed),
            self.events.load(Ordering::Relaxed),
            self.dropped.load(Ordering::Relaxed),
        )
    }
}

/// Out-of-band event delivered ahead of (connect) or after (terminated) the
/// ordinary update stream.
#[derive(Debug, Clone)]
pub enum SubscriberEvent {
    /// Delivered once, either synchronously at subscribe time (if upstream
    /// is already connected) or on the next connect event.
    Connected {
        /// The structure type upstream reported, absent on terminal failure.
        type_desc: Option<StructureDescriptor>,
        /// The start outcome as of delivery.
        start_status: StartStatus,
    },
    /// An ordinary update, polled from this subscriber's [`MonitorQueue`].
    Update(PolledUpdate),
    /// Upstream will never produce another update. Delivered immediately if
    /// this subscriber has no slot `inUse`, otherwise deferred until its
    /// final `release`.
    Terminated,
}

struct SubscriberEntry {
    running: bool,
    queue: MonitorQueue,
    wakeup: Arc<dyn WakeupSink>,
    counters: Arc<Counters>,
    control: std::collections::VecDeque<SubscriberEvent>,
    terminal_armed: bool,
    terminal_delivered: bool,
}

struct MonitorState {
    type_desc: Option<StructureDescriptor>,
    last_element: Option<(StructuredValue, ChangeMask)>,
    start_status: StartStatus,
    subscribers: BTreeMap<u64, SubscriberEntry>,
    next_id: u64,
    done: bool,
}

/// One upstream subscription, shared by every downstream subscriber that
/// requested the same `(channel, RequestFingerprint)` pair.
pub struct UpstreamMonitor {
    key: RequestFingerprint,
    upstream: Arc<dyn UpstreamChannel>,
    state: Mutex<MonitorState>,
    counters: Counters,
}

impl fmt::Debug for UpstreamMonitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpstreamMonitor").field("key", &self.key).finish()
    }
}

impl UpstreamMonitor {
    /// Construct a monitor for `key`, registered against `upstream`. Does
    /// not itself call `start()` — that happens in [`Self::connect`], since
    /// the caller (`ChannelCacheEntry::get`) decides when the structure type
    /// is known.
    pub fn new(key: RequestFingerprint, upstream: Arc<dyn UpstreamChannel>) -> Arc<Self> {
        Arc::new(Self {
            key,
            upstream,
            state: Mutex::new(MonitorState {
                type_desc: None,
                last_element: None,
                start_status: StartStatus::Pending,
                subscribers: BTreeMap::new(),
                next_id: 0,
                done: false,
            }),
            counters: Counters::default(),
        })
    }

    /// The fingerprint this monitor is registered under.
    pub fn key(&self) -> &RequestFingerprint {
        &self.key
    }

    /// `{wakeups, events}` counters for operational tooling.
    pub fn counters(&self) -> (u64, u64) {
        let (w, e, _) = self.counters.snapshot();
        (w, e)
    }

    /// Upstream connect event: call `upstream.start()`, store `typeDesc` and
    /// the outcome, then notify every current subscriber outside the lock.
    pub fn connect(&self, type_desc: StructureDescriptor) {
        let start_status = match self.upstream.start() {
            Ok(()) => StartStatus::Connected,
            Err(message) => {
                tracing::warn!(key = ?self.key, %message, "upstream channel failed to start");
                StartStatus::Failed(message)
            }
        };

        let mut to_wake = Vec::new();
        {
            let mut state = self.state.lock();
            state.type_desc = Some(type_desc.clone());
            state.start_status = start_status.clone();
            for (_, entry) in state.subscribers.iter_mut() {
                entry.control.push_back(SubscriberEvent::Connected {
                    type_desc: Some(type_desc.clone()),
                    start_status: start_status.clone(),
                });
                entry.counters.bump_events();
                to_wake.push(entry.wakeup.clone());
            }
        }
        for sink in to_wake {
            sink.wakeup();
        }
    }

    /// Upstream update event: fan the update out to every subscriber.
    ///
    /// A subscriber that is not `running`, or is already in overflow, always
    /// accumulates into its overflow slot (never consumes ring capacity
    /// meant for active consumers).
    pub fn deliver(&self, value: StructuredValue, changed: ChangeMask) {
        self.counters.bump_events();

        let mut to_wake = Vec::new();
        {
            let mut state = self.state.lock();
            state.last_element = Some((value.clone(), changed.clone()));
            for entry in state.subscribers.values_mut() {
                entry.counters.bump_events();
                let needs_wakeup = if entry.running && !entry.queue.in_overflow() {
                    entry.queue.offer(&value, &changed)
                } else {
                    entry.queue.offer_while_not_running(&value, &changed);
                    false
                };
                if needs_wakeup {
                    to_wake.push(entry.wakeup.clone());
                }
            }
        }
        for sink in to_wake {
            self.counters.bump_wakeups();
            sink.wakeup();
        }
    }

    /// Upstream terminal signal: mark `done`, notify subscribers with no
    /// slot `inUse` immediately; others are notified on their final release.
    pub fn terminate(&self) {
        tracing::debug!(key = ?self.key, "upstream monitor terminated");
        let mut to_wake = Vec::new();
        {
            let mut state = self.state.lock();
            state.done = true;
            state.start_status = StartStatus::Terminated;
            for entry in state.subscribers.values_mut() {
                if entry.queue.in_use_len() == 0 {
                    entry.control.push_back(SubscriberEvent::Terminated);
                    entry.terminal_delivered = true;
                    to_wake.push(entry.wakeup.clone());
                } else {
                    entry.terminal_armed = true;
                }
            }
        }
        for sink in to_wake {
            sink.wakeup();
        }
    }

    /// Attach a new subscriber. If upstream is already connected, delivers
    /// `Connected` synchronously; if a last update is known, posts it as a
    /// guaranteed first sample before switching the subscriber to running.
    pub fn subscribe(
        self: &Arc<Self>,
        wakeup: Arc<dyn WakeupSink>,
        queue_capacity: usize,
    ) -> Subscriber {
        let mut state = self.state.lock();
        let id = state.next_id;
        state.next_id += 1;

        let mut entry = SubscriberEntry {
            running: false,
            queue: MonitorQueue::new(queue_capacity),
            wakeup,
            counters: Arc::new(Counters::default()),
            control: std::collections::VecDeque::new(),
            terminal_armed: false,
            terminal_delivered: false,
        };

        if state.type_desc.is_some() || !matches!(state.start_status, StartStatus::Pending) {
            entry.control.push_back(SubscriberEvent::Connected {
                type_desc: state.type_desc.clone(),
                start_status: state.start_status.clone(),
            });
        }
        if let Some((value, changed)) = state.last_element.clone() {
            entry.queue.offer(&value, &changed);
        }
        entry.running = true;

        let counters = entry.counters.clone();
        state.subscribers.insert(id, entry);
        drop(state);

        Subscriber {
            id,
            monitor: self.clone(),
            counters,
        }
    }

    fn remove(&self, id: u64) {
        self.state.lock().subscribers.remove(&id);
    }
}

/// A downstream consumer's handle onto an [`UpstreamMonitor`]'s fan-out.
///
/// Holds a strong reference to its monitor (the graph-breaking half of the
/// strong/weak pair described in §9; `ChannelCacheEntry.monitors` holds the
/// other, weak, half).
pub struct Subscriber {
    id: u64,
    monitor: Arc<UpstreamMonitor>,
    counters: Arc<Counters>,
}

impl Subscriber {
    /// `{wakeups, events, dropped}` counters for operational tooling.
    pub fn counters(&self) -> (u64, u64, u64) {
        self.counters.snapshot()
    }

    /// Pause or resume delivery. While not running, updates accumulate in
    /// the overflow slot regardless of ring occupancy.
    pub fn set_running(&self, running: bool) {
        let mut state = self.monitor.state.lock();
        if let Some(entry) = state.subscribers.get_mut(&self.id) {
            entry.running = running;
        }
    }

    /// Poll for the next event: pending control events first, then ordinary
    /// updates, preserving this subscriber's FIFO order (Q2).
    pub fn poll_event(&self) -> Option<SubscriberEvent> {
        let mut state = self.monitor.state.lock();
        let entry = state.subscribers.get_mut(&self.id)?;
        if let Some(control) = entry.control.pop_front() {
            return Some(control);
        }
        entry.queue.poll().map(SubscriberEvent::Update)
    }

    /// Return a previously polled update's slot. If this release empties
    /// `inUse` and a terminal signal is armed, delivers `Terminated` now.
    pub fn release(&self, token: crate::queue::SlotToken) -> Result<()> {
        let mut to_wake = None;
        {
            let mut state = self.monitor.state.lock();
            let entry = state
                .subscribers
                .get_mut(&self.id)
                .ok_or_else(|| Error::InvalidUsage("subscriber no longer registered".into()))?;
            entry.queue.release(token)?;
            if entry.terminal_armed && !entry.terminal_delivered && entry.queue.in_use_len() == 0 {
                entry.control.push_back(SubscriberEvent::Terminated);
                entry.terminal_delivered = true;
                to_wake = Some(entry.wakeup.clone());
            }
        }
        if let Some(sink) = to_wake {
            sink.wakeup();
        }
        Ok(())
    }
}

impl Drop for Subscriber {
    fn drop(&mut self) {
        self.monitor.remove(self.id);
    }
}

impl fmt::Debug for Subscriber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscriber").field("id", &self.id).finish()
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[derive(Debug)]
    struct AlwaysConnects;
    impl UpstreamChannel for AlwaysConnects {
        fn start(&self) -> std::result::Result<(), String> {
            Ok(())
        }
    }

    #[derive(Debug, Default)]
    struct CountingSink(AtomicUsize);
    impl WakeupSink for CountingSink {
        fn wakeup(&self) {
            self.0.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn descriptor() -> StructureDescriptor {
        use crate::type_mapper::{NativeField, NativeKind, ScalarTypeMapper, TypeMapper};
        let field = NativeField {
            kind: NativeKind::Float64,
            is_array: false,
            value: crate::value::Scalar::Float64(0.0),
            array_value: Vec::new(),
            severity: 0,
            status: 0,
            message: String::new(),
            seconds_past_epoch: 0,
            nanoseconds: 0,
            user_tag: 0,
            display: None,
            control: None,
            value_alarm: None,
        };
        ScalarTypeMapper.describe(&field).unwrap()
    }

    fn val(bit: usize) -> (StructuredValue, ChangeMask) {
        (StructuredValue::with_len(4), [bit].into_iter().collect())
    }

    /// Scenario 1: two subscribers of the same monitor both see the same updates.
    #[test]
    fn fan_out_reaches_every_subscriber() {
        let monitor = UpstreamMonitor::new(
            RequestFingerprint::from_bytes(vec![1]),
            Arc::new(AlwaysConnects),
        );
        monitor.connect(descriptor());

        let sink_a: Arc<dyn WakeupSink> = Arc::new(CountingSink::default());
        let sink_b: Arc<dyn WakeupSink> = Arc::new(CountingSink::default());
        let sub_a = monitor.subscribe(sink_a, 2);
        let sub_b = monitor.subscribe(sink_b, 2);

        let (value, changed) = val(0);
        monitor.deliver(value, changed);

        for sub in [&sub_a, &sub_b] {
            assert!(matches!(
                sub.poll_event(),
                Some(SubscriberEvent::Connected { .. })
            ));
            assert!(matches!(sub.poll_event(), Some(SubscriberEvent::Update(_))));
        }
    }

    /// Q5: a dropped subscriber receives no further events.
    #[test]
    fn dropped_subscriber_stops_receiving() {
        let monitor = UpstreamMonitor::new(
            RequestFingerprint::from_bytes(vec![2]),
            Arc::new(AlwaysConnects),
        );
        monitor.connect(descriptor());
        let sink: Arc<dyn WakeupSink> = Arc::new(CountingSink::default());
        let sub = monitor.subscribe(sink, 2);
        assert_eq!(monitor.state.lock().subscribers.len(), 1);
        drop(sub);
        assert_eq!(monitor.state.lock().subscribers.len(), 0);

        let (value, changed) = val(0);
        monitor.deliver(value, changed); // must not panic / must not find a dead entry
    }

    /// Scenario 5: terminal signal is deferred until the in-use slot is released.
    #[test]
    fn terminal_signal_waits_for_release_of_in_use_slot() {
        let monitor = UpstreamMonitor::new(
            RequestFingerprint::from_bytes(vec![3]),
            Arc::new(AlwaysConnects),
        );
        monitor.connect(descriptor());
        let sink: Arc<dyn WakeupSink> = Arc::new(CountingSink::default());
        let sub = monitor.subscribe(sink, 2);

        let (value, changed) = val(0);
        monitor.deliver(value, changed);
        assert!(matches!(
            sub.poll_event(),
            Some(SubscriberEvent::Connected { .. })
        ));
        let update = match sub.poll_event() {
            Some(SubscriberEvent::Update(update)) => update,
            other => panic!("expected update, got {other:?}"),
        };

        monitor.terminate();
        assert!(sub.poll_event().is_none(), "terminal must wait for release");

        sub.release(update.token).unwrap();
        assert!(matches!(sub.poll_event(), Some(SubscriberEvent::Terminated)));
    }

    /// A second test/subscriber already attached at `connect()` time, and a
    /// subscriber joining afterward, both see `Connected` immediately.
    #[test]
    fn late_subscriber_gets_connect_synchronously() {
        let monitor = UpstreamMonitor::new(
            RequestFingerprint::from_bytes(vec![4]),
            Arc::new(AlwaysConnects),
        );
        monitor.connect(descriptor());
        let sink: Arc<dyn WakeupSink> = Arc::new(CountingSink::default());
        let sub = monitor.subscribe(sink, 2);
        assert!(matches!(
            sub.poll_event(),
            Some(SubscriberEvent::Connected {
                start_status: StartStatus::Connected,
                ..
            })
        ));
    }
}
