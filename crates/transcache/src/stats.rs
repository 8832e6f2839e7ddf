//! Per-partition statistics snapshot

/// Item and group counts for one partition.
///
/// Snapshots are taken under each partition's lock independently; a multi
/// partition report is not a single atomic view.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Number of cached items.
    pub items: usize,

    /// Number of non-empty groups.
    pub groups: usize,
}
