//! Top-level dispatcher: partition registry, transactions, cloning reads

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use ahash::RandomState;
use parking_lot::{Mutex, RwLock};
use tracing::debug;

use crate::clock::{Clock, SystemClock};
use crate::config::CacheConfig;
use crate::error::{Error, Result};
use crate::partition::Partition;
use crate::stats::CacheStats;
use crate::trans::TransOp;
use crate::value::Value;

/// Transaction ids are unique for the process lifetime.
static TRANS_SEQ: AtomicU64 = AtomicU64::new(1);

/// Partitioned, transactional in-memory cache.
///
/// Every operation names the partition it targets; partitions unknown at
/// construction are created on first write with [`CacheConfig::default`].
/// Writes may be staged under a transaction id obtained from
/// [`TransCache::begin_transaction`]; staged ops stay invisible to reads
/// until [`TransCache::commit_transaction`] replays them in order.
pub struct TransCache {
    caches: RwLock<HashMap<String, Arc<Partition>, RandomState>>,
    transactions: Mutex<HashMap<String, Vec<TransOp>, RandomState>>,
    clock: Arc<dyn Clock>,
}

impl TransCache {
    /// Build a cache with the given per-partition configurations.
    pub fn new(cfgs: HashMap<String, CacheConfig>) -> Self {
        Self::with_clock(cfgs, Arc::new(SystemClock))
    }

    /// Same as [`TransCache::new`] with an injected clock.
    pub fn with_clock(cfgs: HashMap<String, CacheConfig>, clock: Arc<dyn Clock>) -> Self {
        let caches = cfgs
            .into_iter()
            .map(|(name, cfg)| {
                let part = Partition::new(name.clone(), cfg, clock.clone());
                (name, part)
            })
            .collect();
        Self {
            caches: RwLock::new(caches),
            transactions: Mutex::new(HashMap::default()),
            clock,
        }
    }

    /// Write an item and its group membership.
    ///
    /// With `commit_now` set or an empty `trans_id` the write goes straight
    /// to the partition; otherwise it is appended to the transaction log.
    pub fn set(
        &self,
        cache_id: &str,
        item_id: &str,
        value: Value,
        group_ids: &[String],
        commit_now: bool,
        trans_id: &str,
    ) {
        if commit_now || trans_id.is_empty() {
            self.partition_or_create(cache_id)
                .set(item_id, value, group_ids);
            return;
        }
        self.append_op(
            trans_id,
            TransOp::Set {
                cache_id: cache_id.to_string(),
                item_id: item_id.to_string(),
                value,
                group_ids: group_ids.to_vec(),
            },
        );
    }

    /// Look an item up; `None` when the partition or item is absent.
    ///
    /// Never consults the transaction buffer: only committed state is
    /// observable.
    pub fn get(&self, cache_id: &str, item_id: &str) -> Option<Value> {
        self.partition(cache_id)?.get(item_id)
    }

    /// Look an item up and return an independent deep copy.
    ///
    /// Fails with [`Error::NotFound`] when absent and [`Error::NotClonable`]
    /// when the value does not carry the [`crate::Cloneable`] capability; a
    /// cached nil clones to nil.
    pub fn get_cloned(&self, cache_id: &str, item_id: &str) -> Result<Value> {
        let value = self.get(cache_id, item_id).ok_or(Error::NotFound)?;
        value.deep_clone()
    }

    /// Remove an item, either directly or staged in a transaction.
    pub fn remove(&self, cache_id: &str, item_id: &str, commit_now: bool, trans_id: &str) {
        if commit_now || trans_id.is_empty() {
            self.partition_or_create(cache_id).remove(item_id);
            return;
        }
        self.append_op(
            trans_id,
            TransOp::Remove {
                cache_id: cache_id.to_string(),
                item_id: item_id.to_string(),
            },
        );
    }

    /// Remove every item in a group, either directly or staged.
    pub fn remove_group(&self, cache_id: &str, group_id: &str, commit_now: bool, trans_id: &str) {
        if commit_now || trans_id.is_empty() {
            self.partition_or_create(cache_id).remove_group(group_id);
            return;
        }
        self.append_op(
            trans_id,
            TransOp::RemoveGroup {
                cache_id: cache_id.to_string(),
                group_id: group_id.to_string(),
            },
        );
    }

    /// Values of the entries currently in a group; empty when the partition
    /// or the group is absent.
    pub fn get_group_items(&self, cache_id: &str, group_id: &str) -> Vec<Value> {
        match self.partition(cache_id) {
            Some(part) => part.group_items(group_id),
            None => Vec::new(),
        }
    }

    /// Item ids currently in a group; empty when absent.
    pub fn get_group_item_ids(&self, cache_id: &str, group_id: &str) -> Vec<String> {
        match self.partition(cache_id) {
            Some(part) => part.group_item_ids(group_id),
            None => Vec::new(),
        }
    }

    /// True when the group exists in the partition.
    pub fn has_group(&self, cache_id: &str, group_id: &str) -> bool {
        self.partition(cache_id)
            .is_some_and(|part| part.has_group(group_id))
    }

    /// True when the item exists in the partition.
    pub fn has_item(&self, cache_id: &str, item_id: &str) -> bool {
        self.partition(cache_id)
            .is_some_and(|part| part.has_item(item_id))
    }

    /// Item ids in a partition starting with `prefix`; the empty prefix
    /// matches all.
    pub fn get_item_ids(&self, cache_id: &str, prefix: &str) -> Vec<String> {
        match self.partition(cache_id) {
            Some(part) => part.item_ids(prefix),
            None => Vec::new(),
        }
    }

    /// Expiry of an item: outer `None` when the partition or item is absent,
    /// inner `None` when the entry never expires.
    pub fn get_item_expiry_time(&self, cache_id: &str, item_id: &str) -> Option<Option<Instant>> {
        self.partition(cache_id)?.expiry_time(item_id)
    }

    /// Number of items in a partition; zero when it does not exist.
    pub fn len(&self, cache_id: &str) -> usize {
        self.partition(cache_id).map_or(0, |part| part.len())
    }

    /// Item and group counts per partition. An empty `cache_ids` reports on
    /// every partition. Each snapshot is taken under its own partition lock.
    pub fn get_cache_stats(&self, cache_ids: &[&str]) -> HashMap<String, CacheStats> {
        self.select(cache_ids)
            .into_iter()
            .map(|(name, part)| (name, part.stats()))
            .collect()
    }

    /// Clear the named partitions, or all of them when `cache_ids` is empty.
    pub fn clear(&self, cache_ids: &[&str]) {
        for (_, part) in self.select(cache_ids) {
            part.clear();
        }
    }

    /// Open a transaction and return its id.
    pub fn begin_transaction(&self) -> String {
        let trans_id = TRANS_SEQ.fetch_add(1, Ordering::Relaxed).to_string();
        self.transactions
            .lock()
            .insert(trans_id.clone(), Vec::new());
        trans_id
    }

    /// True while the transaction is open.
    pub fn has_transaction(&self, trans_id: &str) -> bool {
        self.transactions.lock().contains_key(trans_id)
    }

    /// Replay every staged op in recorded order, then forget the
    /// transaction. An unknown id is a no-op.
    pub fn commit_transaction(&self, trans_id: &str) {
        let Some(ops) = self.transactions.lock().remove(trans_id) else {
            return;
        };
        debug!(trans_id, ops = ops.len(), "committing transaction");
        for op in ops {
            match op {
                TransOp::Set {
                    cache_id,
                    item_id,
                    value,
                    group_ids,
                } => self.set(&cache_id, &item_id, value, &group_ids, true, trans_id),
                TransOp::Remove { cache_id, item_id } => {
                    self.remove(&cache_id, &item_id, true, trans_id)
                }
                TransOp::RemoveGroup { cache_id, group_id } => {
                    self.remove_group(&cache_id, &group_id, true, trans_id)
                }
            }
        }
    }

    /// Discard every staged op and forget the transaction. An unknown id is
    /// a no-op.
    pub fn rollback_transaction(&self, trans_id: &str) {
        self.transactions.lock().remove(trans_id);
    }

    /// Stop every partition's expiry reaper.
    pub fn shutdown(&self) {
        let parts: Vec<Arc<Partition>> = self.caches.read().values().cloned().collect();
        for part in parts {
            part.shutdown();
        }
    }

    fn partition(&self, cache_id: &str) -> Option<Arc<Partition>> {
        self.caches.read().get(cache_id).cloned()
    }

    fn partition_or_create(&self, cache_id: &str) -> Arc<Partition> {
        if let Some(part) = self.partition(cache_id) {
            return part;
        }
        let mut caches = self.caches.write();
        caches
            .entry(cache_id.to_string())
            .or_insert_with(|| {
                Partition::new(cache_id, CacheConfig::default(), self.clock.clone())
            })
            .clone()
    }

    /// Named partitions, or every partition when `cache_ids` is empty. The
    /// registry lock is released before any partition lock is taken.
    fn select(&self, cache_ids: &[&str]) -> Vec<(String, Arc<Partition>)> {
        let caches = self.caches.read();
        if cache_ids.is_empty() {
            caches
                .iter()
                .map(|(name, part)| (name.clone(), part.clone()))
                .collect()
        } else {
            cache_ids
                .iter()
                .filter_map(|id| caches.get(*id).map(|part| ((*id).to_string(), part.clone())))
                .collect()
        }
    }

    fn append_op(&self, trans_id: &str, op: TransOp) {
        self.transactions
            .lock()
            .entry(trans_id.to_string())
            .or_default()
            .push(op);
    }
}

impl Drop for TransCache {
    fn drop(&mut self) {
        self.shutdown();
    }
}
