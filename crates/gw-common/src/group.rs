//! Composite group PVs: multi-channel aggregation with atomic locking and
//! trigger-based notification (§4.G).

pub mod config;
pub mod pv;

pub use config::{resolve_triggers, FieldDef, GroupConfig, GroupDef, TriggerMap};
pub use pv::{GroupPV, MemberSource};
