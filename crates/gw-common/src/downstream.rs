//! `DownstreamChannel`: a per-client, per-name handle that pure-forwards
//! reads/writes/subscribes to its `ChannelCacheEntry` (§4.F).

use std::sync::Arc;

use crate::cache::{Attachment, ChannelCacheEntry};
use crate::fingerprint::RequestFingerprint;
use crate::upstream::{Subscriber, UpstreamChannel, WakeupSink};

/// `CONNECTED` iff the entry's upstream channel reports connected;
/// transitions mirror upstream (§4.F).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Upstream accepted the channel open.
    Connected,
    /// No connection has been established (or it failed).
    Disconnected,
}

/// Per-client handle bound to one cached channel. Created on
/// `DownstreamChannel::open`, which attaches to the entry's `attached` set;
/// dropping it detaches and marks the entry touched.
pub struct DownstreamChannel {
    entry: Arc<ChannelCacheEntry>,
    _attachment: Attachment,
}

impl DownstreamChannel {
    /// Bind a new downstream handle to `entry`.
    pub fn open(entry: Arc<ChannelCacheEntry>) -> Self {
        let attachment = entry.attach();
        Self {
            entry,
            _attachment: attachment,
        }
    }

    /// The bound channel's name.
    pub fn name(&self) -> &str {
        self.entry.name()
    }

    /// Forwarding read: delegates to the entry's upstream channel.
    ///
    /// The concrete native-type ↔ structured-value conversion is the
    /// injected `TypeMapper`'s job (§4.A), not this layer's; this returns
    /// the raw upstream handle so the caller can drive a read through it.
    pub fn upstream(&self) -> &Arc<dyn UpstreamChannel> {
        self.entry.upstream()
    }

    /// Forwarding write: same delegation as `upstream()`; exposed
    /// separately so callers don't need to know reads and writes share one
    /// handle at this layer.
    pub fn write_target(&self) -> &Arc<dyn UpstreamChannel> {
        self.entry.upstream()
    }

    /// `subscribe(request)`: serialize `request` to a fingerprint, obtain
    /// the shared `UpstreamMonitor`, and wrap it in a new `Subscriber`.
    pub fn subscribe(&self, request_fp: RequestFingerprint, wakeup: Arc<dyn WakeupSink>, queue_capacity: usize) -> Subscriber {
        let monitor = self.entry.get(request_fp);
        monitor.subscribe(wakeup, queue_capacity)
    }
}

impl std::fmt::Debug for DownstreamChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownstreamChannel")
            .field("name", &self.name())
            .finish()
    }
}

/// A trivial [`WakeupSink`] that just counts wakeups under a mutex-free
/// atomic counter; useful as a default for callers that poll rather than
/// react (tests, simple embedders).
#[derive(Debug, Default)]
pub struct CountingWakeupSink(std::sync::atomic::AtomicU64);

impl CountingWakeupSink {
    /// Number of wakeups observed so far.
    pub fn count(&self) -> u64 {
        self.0.load(std::sync::atomic::Ordering::Relaxed)
    }
}

impl WakeupSink for CountingWakeupSink {
    fn wakeup(&self) {
        self.0.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    }
}
