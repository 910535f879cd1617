//! Shared engine types for the PV Access gateway: request fingerprinting,
//! structured values and change masks, native-type mapping, and the
//! per-subscriber monitor queue.
//!
//! Upstream connectivity, the channel cache, downstream forwarding, and
//! group PVs build on top of these and live in their own modules.

pub mod cache;
pub mod downstream;
pub mod error;
pub mod fingerprint;
pub mod group;
pub mod queue;
pub mod type_mapper;
pub mod upstream;
pub mod value;

pub use cache::{Attachment, ChannelCache, ChannelCacheEntry, UpstreamProvider, DEFAULT_SWEEP_INTERVAL};
pub use downstream::{ConnectionState, CountingWakeupSink, DownstreamChannel};
pub use error::{Error, Result};
pub use fingerprint::{ProcessOption, RequestFingerprint, RequestOptions};
pub use group::{resolve_triggers, FieldDef, GroupConfig, GroupDef, GroupPV, MemberSource, TriggerMap};
pub use queue::{MonitorQueue, PolledUpdate, SlotToken, DEFAULT_QUEUE_SIZE};
pub use type_mapper::{StructureDescriptor, TypeMapper};
pub use upstream::{StartStatus, Subscriber, SubscriberEvent, UpstreamChannel, UpstreamMonitor, WakeupSink};
pub use value::{ChangeMask, FieldOffset, FieldValue, Scalar, StructuredValue};
