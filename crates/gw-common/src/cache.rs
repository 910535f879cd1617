//! `ChannelCacheEntry` / `ChannelCache`: per-channel-name caching of the
//! upstream connection and its `UpstreamMonitor`s, with a periodic sweeper.
//!
//! Grounded in `epics-base`'s `ChannelCache`/`ChannelCacheEntry`
//! (`p2pApp/chancache.{h,cpp}`): `dropPoke`, the 30-second `cacheClean`
//! timer, and "erase from the map before letting the entry's destructor
//! run" are all reproduced here.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::fingerprint::RequestFingerprint;
use crate::upstream::{UpstreamChannel, UpstreamMonitor};

/// Default sweep interval, matching the original `cacheClean` timer's
/// hardcoded `30.0` seconds.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// Opens a named upstream channel. The gateway's concrete upstream provider
/// (remote PVA network, or local record database) is out of scope here.
pub trait UpstreamProvider: Send + Sync {
    /// Open `channel_name`, returning a handle usable by every
    /// [`UpstreamMonitor`] registered against this entry.
    fn open(&self, channel_name: &str) -> Result<Arc<dyn UpstreamChannel>>;
}

/// RAII handle returned by [`ChannelCacheEntry::attach`]. Dropping it removes
/// the holder from the entry's `attached` set and marks the entry touched
/// (`dropPoke = true`) so it survives the next sweep.
pub struct Attachment {
    entry: Arc<ChannelCacheEntry>,
    id: u64,
}

impl Drop for Attachment {
    fn drop(&mut self) {
        self.entry.detach(self.id);
    }
}

impl fmt::Debug for Attachment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Attachment").field("id", &self.id).finish()
    }
}

/// One cached upstream channel: the raw connection plus every
/// `UpstreamMonitor` currently sharing it, keyed by request fingerprint.
pub struct ChannelCacheEntry {
    name: String,
    upstream: Arc<dyn UpstreamChannel>,
    drop_poke: AtomicBool,
    next_attachment_id: AtomicU64,
    attached: Mutex<BTreeMap<u64, ()>>,
    monitors: Mutex<BTreeMap<RequestFingerprint, Weak<UpstreamMonitor>>>,
}

impl fmt::Debug for ChannelCacheEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelCacheEntry")
            .field("name", &self.name)
            .field("attached_count", &self.attached_count())
            .finish()
    }
}

impl ChannelCacheEntry {
    fn new(name: String, upstream: Arc<dyn UpstreamChannel>) -> Arc<Self> {
        Arc::new(Self {
            name,
            upstream,
            drop_poke: AtomicBool::new(true),
            next_attachment_id: AtomicU64::new(0),
            attached: Mutex::new(BTreeMap::new()),
            monitors: Mutex::new(BTreeMap::new()),
        })
    }

    /// The channel name this entry is cached under.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The raw upstream channel handle, shared by every monitor.
    pub fn upstream(&self) -> &Arc<dyn UpstreamChannel> {
        &self.upstream
    }

    /// Number of `DownstreamChannel`s (or test callers) currently attached.
    pub fn attached_count(&self) -> usize {
        self.attached.lock().len()
    }

    /// Bind a new holder to this entry, returning an RAII guard.
    pub fn attach(self: &Arc<Self>) -> Attachment {
        let id = self.next_attachment_id.fetch_add(1, Ordering::Relaxed);
        self.attached.lock().insert(id, ());
        Attachment {
            entry: self.clone(),
            id,
        }
    }

    fn detach(&self, id: u64) {
        self.attached.lock().remove(&id);
        self.drop_poke.store(true, Ordering::Relaxed);
    }

    /// Mark this entry as recently touched, so the next sweep spares it even
    /// with an empty `attached` set.
    pub fn touch(&self) {
        self.drop_poke.store(true, Ordering::Relaxed);
    }

    /// `get(requestFp)`: look up or construct the `UpstreamMonitor` sharing
    /// this entry's upstream connection for `request_fp`.
    ///
    /// Registration under `monitors` uses a weak reference; the only strong
    /// references live on the `Subscriber`s handed out by the monitor, so an
    /// unused monitor is reclaimed as soon as its last subscriber drops
    /// (§4.D, §9 "strong/weak reference graph").
    pub fn get(&self, request_fp: RequestFingerprint) -> Arc<UpstreamMonitor> {
        let mut monitors = self.monitors.lock();
        if let Some(existing) = monitors.get(&request_fp).and_then(Weak::upgrade) {
            return existing;
        }
        let monitor = UpstreamMonitor::new(request_fp.clone(), self.upstream.clone());
        monitors.insert(request_fp, Arc::downgrade(&monitor));
        monitor
    }

    /// Terminate every monitor still registered against this entry. Called
    /// once the entry is already unreachable via [`ChannelCache::lookup`]
    /// (§4.E "erase before notify").
    fn terminate_monitors(&self) {
        let live: Vec<Arc<UpstreamMonitor>> = self
            .monitors
            .lock()
            .values()
            .filter_map(Weak::upgrade)
            .collect();
        for monitor in live {
            monitor.terminate();
        }
    }
}

struct SweepState {
    entries: BTreeMap<String, Arc<ChannelCacheEntry>>,
}

/// Map of channel name → [`ChannelCacheEntry`], with periodic garbage
/// collection.
pub struct ChannelCache {
    provider: Arc<dyn UpstreamProvider>,
    state: Mutex<SweepState>,
    stopped: AtomicBool,
    sweeper: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl fmt::Debug for ChannelCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelCache")
            .field("entry_count", &self.entry_count())
            .finish()
    }
}

impl ChannelCache {
    /// Build an (initially sweeper-less) cache backed by `provider`. Call
    /// [`Self::spawn_sweeper`] from inside a Tokio runtime to start garbage
    /// collection.
    pub fn new(provider: Arc<dyn UpstreamProvider>) -> Arc<Self> {
        Arc::new(Self {
            provider,
            state: Mutex::new(SweepState {
                entries: BTreeMap::new(),
            }),
            stopped: AtomicBool::new(false),
            sweeper: Mutex::new(None),
        })
    }

    /// `lookup(name)`: return the existing entry or open a new upstream
    /// channel and cache it. Every lookup marks the entry touched.
    pub fn lookup(&self, name: &str) -> Result<Arc<ChannelCacheEntry>> {
        let mut state = self.state.lock();
        if let Some(entry) = state.entries.get(name) {
            entry.touch();
            return Ok(entry.clone());
        }

        let upstream = self.provider.open(name).map_err(|_| {
            tracing::warn!(channel = name, "upstream provider failed to open channel");
            Error::UpstreamUnavailable(name.to_string())
        })?;
        tracing::debug!(channel = name, "opened new channel cache entry");
        let entry = ChannelCacheEntry::new(name.to_string(), upstream);
        state.entries.insert(name.to_string(), entry.clone());
        Ok(entry)
    }

    /// Number of cached entries, for diagnostics/tests.
    pub fn entry_count(&self) -> usize {
        self.state.lock().entries.len()
    }

    /// React to the upstream channel behind `name` transitioning to
    /// DISCONNECTED or DESTROYED: remove the entry from the map first, then
    /// terminate its monitors so the fan-out to downstream subscribers only
    /// happens once a concurrent `lookup` can no longer find it (§4.E
    /// "erase before notify").
    pub fn on_upstream_terminated(&self, name: &str) {
        let entry = self.state.lock().entries.remove(name);
        if let Some(entry) = entry {
            tracing::warn!(channel = name, "upstream channel disconnected, evicting cache entry");
            entry.terminate_monitors();
        }
    }

    /// Run one sweep pass: entries with an empty `attached` set and
    /// `dropPoke == false` are removed from the map; everything else has its
    /// `dropPoke` cleared for the next interval.
    ///
    /// The removed entries are dropped *after* the map lock is released, so
    /// their (possibly synchronous) upstream teardown never races a
    /// concurrent `lookup` trying to reacquire this lock (§4.D, §9
    /// "callback-from-destructor hazard").
    pub fn sweep_once(&self) {
        let to_destroy: Vec<Arc<ChannelCacheEntry>> = {
            let mut state = self.state.lock();
            let mut to_destroy = Vec::new();
            state.entries.retain(|_, entry| {
                if entry.attached_count() == 0 && !entry.drop_poke.load(Ordering::Relaxed) {
                    to_destroy.push(entry.clone());
                    false
                } else {
                    entry.drop_poke.store(false, Ordering::Relaxed);
                    true
                }
            });
            to_destroy
        };
        if !to_destroy.is_empty() {
            tracing::debug!(count = to_destroy.len(), "sweeping unattached channel cache entries");
        }
        drop(to_destroy);
    }

    /// Start the periodic sweeper on the current Tokio runtime.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) {
        let cache = self.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // first tick fires immediately; skip it
            loop {
                ticker.tick().await;
                if cache.stopped.load(Ordering::Relaxed) {
                    break;
                }
                cache.sweep_once();
            }
        });
        *self.sweeper.lock() = Some(handle);
    }

    /// Halt the sweeper and drop every entry, tearing down their upstream
    /// channels (§5 "Destroying the ChannelCache").
    pub fn shutdown(&self) {
        tracing::info!("shutting down channel cache");
        self.stopped.store(true, Ordering::Relaxed);
        if let Some(handle) = self.sweeper.lock().take() {
            handle.abort();
        }
        self.state.lock().entries.clear();
    }
}

impl Drop for ChannelCache {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[derive(Debug)]
    struct StubChannel;
    impl UpstreamChannel for StubChannel {
        fn start(&self) -> std::result::Result<(), String> {
            Ok(())
        }
    }

    struct StubProvider {
        opens: AtomicUsize,
    }
    impl UpstreamProvider for StubProvider {
        fn open(&self, _channel_name: &str) -> Result<Arc<dyn UpstreamChannel>> {
            self.opens.fetch_add(1, Ordering::Relaxed);
            Ok(Arc::new(StubChannel))
        }
    }

    fn provider() -> Arc<StubProvider> {
        Arc::new(StubProvider {
            opens: AtomicUsize::new(0),
        })
    }

    /// Q3: lookup(n) twice without intervening removal returns the same entry identity.
    #[test]
    fn lookup_is_idempotent() {
        let provider = provider();
        let cache = ChannelCache::new(provider.clone());
        let a = cache.lookup("X").unwrap();
        let b = cache.lookup("X").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(provider.opens.load(Ordering::Relaxed), 1);
    }

    /// Scenario 1: cache dedup — two lookups of the same fingerprint share one monitor.
    #[test]
    fn get_dedups_by_fingerprint() {
        let cache = ChannelCache::new(provider());
        let entry = cache.lookup("X").unwrap();
        let fp = RequestFingerprint::from_bytes(vec![1, 2, 3]);
        let m1 = entry.get(fp.clone());
        let m2 = entry.get(fp);
        assert!(Arc::ptr_eq(&m1, &m2));
    }

    /// Q4: an entry with a non-empty attached set is never swept.
    #[test]
    fn attached_entry_survives_sweep() {
        let cache = ChannelCache::new(provider());
        let entry = cache.lookup("X").unwrap();
        let attachment = entry.attach();
        entry.touch(); // simulate the sweep interval elapsing once already
        cache.sweep_once();
        cache.sweep_once();
        assert_eq!(cache.entry_count(), 1);
        drop(attachment);
    }

    /// Dropout keep-warm (scenario 2): an entry survives one sweep after its
    /// last detach because dropPoke was set by `detach`/`lookup`, and is only
    /// removed on the *next* sweep if still unattached.
    #[test]
    fn detached_entry_survives_one_sweep_then_is_removed() {
        let cache = ChannelCache::new(provider());
        let entry = cache.lookup("Y").unwrap();
        let attachment = entry.attach();
        drop(attachment); // sets dropPoke = true again

        cache.sweep_once(); // dropPoke was true: survives, now cleared
        assert_eq!(cache.entry_count(), 1);

        cache.sweep_once(); // dropPoke still false, attached empty: removed
        assert_eq!(cache.entry_count(), 0);
    }

    #[test]
    fn monitor_is_reclaimed_once_unreferenced() {
        let cache = ChannelCache::new(provider());
        let entry = cache.lookup("X").unwrap();
        let fp = RequestFingerprint::from_bytes(vec![9]);
        {
            let _monitor = entry.get(fp.clone());
            assert_eq!(entry.monitors.lock().len(), 1);
        }
        // the only strong reference (the local `_monitor`) is gone; the weak
        // entry is still present but no longer upgradeable until the next `get`.
        let upgraded = entry.monitors.lock().get(&fp).and_then(Weak::upgrade);
        assert!(upgraded.is_none());
    }

    #[derive(Debug, Default)]
    struct CountingSink(AtomicUsize);
    impl crate::upstream::WakeupSink for CountingSink {
        fn wakeup(&self) {
            self.0.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// §4.E: on upstream DISCONNECTED/DESTROYED the entry must be gone from
    /// the map *before* its monitors notify subscribers — a concurrent
    /// `lookup` racing the notification must never observe the old entry.
    #[test]
    fn on_upstream_terminated_erases_before_notifying_subscribers() {
        let cache = ChannelCache::new(provider());
        let entry = cache.lookup("X").unwrap();
        let fp = RequestFingerprint::from_bytes(vec![1]);
        let monitor = entry.get(fp);
        let sink: Arc<dyn crate::upstream::WakeupSink> = Arc::new(CountingSink::default());
        let sub = monitor.subscribe(sink, 2);

        cache.on_upstream_terminated("X");

        assert_eq!(cache.entry_count(), 0, "entry must be erased from the map");
        assert!(matches!(
            sub.poll_event(),
            Some(crate::upstream::SubscriberEvent::Terminated)
        ));
    }

    /// The spawned sweeper actually drives `sweep_once` on its own, on the
    /// declared interval, without the caller ticking it by hand.
    #[tokio::test(start_paused = true)]
    async fn spawned_sweeper_removes_unattached_entries_after_two_intervals() {
        let cache = ChannelCache::new(provider());
        let entry = cache.lookup("X").unwrap();
        let attachment = entry.attach();
        drop(attachment); // dropPoke = true

        cache.spawn_sweeper(Duration::from_millis(10));

        tokio::time::sleep(Duration::from_millis(15)).await; // one sweep: survives, dropPoke cleared
        assert_eq!(cache.entry_count(), 1);

        tokio::time::sleep(Duration::from_millis(10)).await; // another sweep: dropPoke still false, removed
        assert_eq!(cache.entry_count(), 0);
    }
}
