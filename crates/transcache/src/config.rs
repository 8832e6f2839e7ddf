//! Per-partition cache policies

use std::time::Duration;

use crossbeam_channel::Sender;

use crate::partition::EntryEvent;

/// Policies for one cache partition.
///
/// The default configuration caches without bound and never expires.
#[derive(Clone, Debug, Default)]
pub struct CacheConfig {
    /// Maximum number of items; zero or negative disables eviction.
    pub max_items: isize,

    /// Time-to-live applied to every entry; zero means entries never expire.
    pub ttl: Duration,

    /// When true, re-setting an existing item keeps its original expiry.
    pub static_ttl: bool,

    /// Bounded sink notified of every completed mutation. Delivery is
    /// best-effort: events are dropped when the sink is full.
    pub on_evicted: Option<Sender<EntryEvent>>,
}
