//! A single cache partition: primary map, LRU and TTL indexes, group index
//!
//! All mutations on a partition are serialized by one lock. Expiry runs on a
//! background reaper thread that is signalled whenever the TTL index changes.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use ahash::RandomState;
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, trace};

use crate::clock::Clock;
use crate::config::CacheConfig;
use crate::list::{IndexList, NodeId};
use crate::stats::CacheStats;
use crate::value::Value;

/// Notification emitted after a completed mutation.
#[derive(Clone, Debug)]
pub enum EntryEvent {
    /// An item was written.
    Set {
        /// Item that was written.
        item_id: String,
        /// Value as stored.
        value: Value,
    },
    /// An item was removed, evicted, or expired.
    Remove {
        /// Item that was dropped.
        item_id: String,
    },
}

struct Entry {
    value: Value,
    group_ids: HashSet<String, RandomState>,
    expiry: Option<Instant>,
    lru: NodeId,
    ttl: Option<NodeId>,
}

/// Mutable core of a partition, guarded by the partition lock.
struct Store {
    entries: HashMap<String, Entry, RandomState>,
    /// Most recently used at the front.
    lru_idx: IndexList<String>,
    /// Soonest expiring at the front.
    ttl_idx: IndexList<String>,
    groups: HashMap<String, HashSet<String, RandomState>, RandomState>,
}

impl Store {
    fn new() -> Self {
        Self {
            entries: HashMap::default(),
            lru_idx: IndexList::new(),
            ttl_idx: IndexList::new(),
            groups: HashMap::default(),
        }
    }

    /// Upsert an item and replace its group membership.
    ///
    /// Returns true when the TTL index changed, so the caller can signal the
    /// reaper to recompute its next wake.
    fn set(
        &mut self,
        cfg: &CacheConfig,
        now: Instant,
        item_id: &str,
        value: Value,
        group_ids: &[String],
    ) -> bool {
        let mut ttl_touched = false;
        if let Some(mut entry) = self.entries.remove(item_id) {
            let old_groups: Vec<String> = entry.group_ids.iter().cloned().collect();
            for group_id in &old_groups {
                self.unlink_group(group_id, item_id);
            }
            for group_id in group_ids {
                self.link_group(group_id, item_id);
            }
            entry.value = value.clone();
            entry.group_ids = group_ids.iter().cloned().collect();
            self.lru_idx.move_to_front(entry.lru);
            if cfg.ttl > Duration::ZERO && !cfg.static_ttl {
                entry.expiry = Some(now + cfg.ttl);
                match entry.ttl {
                    Some(idx) => self.ttl_idx.move_to_back(idx),
                    None => entry.ttl = Some(self.ttl_idx.push_back(item_id.to_string())),
                }
                ttl_touched = true;
            }
            self.entries.insert(item_id.to_string(), entry);
        } else {
            let lru = self.lru_idx.push_front(item_id.to_string());
            let (expiry, ttl) = if cfg.ttl > Duration::ZERO {
                ttl_touched = true;
                (
                    Some(now + cfg.ttl),
                    Some(self.ttl_idx.push_back(item_id.to_string())),
                )
            } else {
                (None, None)
            };
            for group_id in group_ids {
                self.link_group(group_id, item_id);
            }
            self.entries.insert(
                item_id.to_string(),
                Entry {
                    value: value.clone(),
                    group_ids: group_ids.iter().cloned().collect(),
                    expiry,
                    lru,
                    ttl,
                },
            );
        }
        if cfg.max_items > 0 {
            while self.entries.len() > cfg.max_items as usize {
                self.evict_tail(cfg);
            }
        }
        debug_assert_eq!(self.lru_idx.len(), self.entries.len());
        self.emit(
            cfg,
            EntryEvent::Set {
                item_id: item_id.to_string(),
                value,
            },
        );
        ttl_touched
    }

    fn get(&mut self, item_id: &str) -> Option<Value> {
        let entry = self.entries.get(item_id)?;
        let (lru, value) = (entry.lru, entry.value.clone());
        self.lru_idx.move_to_front(lru);
        Some(value)
    }

    /// Remove an item through the shared teardown path.
    ///
    /// Eviction and expiry go through here as well, so they emit the same
    /// remove notification and keep every index consistent.
    fn remove_item(&mut self, cfg: &CacheConfig, item_id: &str) -> bool {
        let Some(entry) = self.entries.remove(item_id) else {
            return false;
        };
        self.lru_idx.remove(entry.lru);
        if let Some(idx) = entry.ttl {
            self.ttl_idx.remove(idx);
        }
        for group_id in &entry.group_ids {
            self.unlink_group(group_id, item_id);
        }
        self.emit(
            cfg,
            EntryEvent::Remove {
                item_id: item_id.to_string(),
            },
        );
        true
    }

    fn remove_group(&mut self, cfg: &CacheConfig, group_id: &str) {
        let Some(members) = self.groups.remove(group_id) else {
            return;
        };
        for item_id in members {
            self.remove_item(cfg, &item_id);
        }
    }

    fn evict_tail(&mut self, cfg: &CacheConfig) {
        let Some(victim) = self.lru_idx.back().cloned() else {
            return;
        };
        trace!(item = %victim, "evicting over capacity");
        if !self.remove_item(cfg, &victim) {
            panic!("lru index holds {victim} missing from the primary map");
        }
    }

    /// Drop every entry whose expiry has passed; returns the next deadline.
    fn drain_expired(&mut self, cfg: &CacheConfig, now: Instant) -> Option<Instant> {
        loop {
            if self.ttl_idx.is_empty() {
                return None;
            }
            let item_id = match self.ttl_idx.front() {
                Some(id) => id.clone(),
                None => return None,
            };
            let expiry = match self.entries.get(&item_id) {
                Some(entry) => match entry.expiry {
                    Some(at) => at,
                    None => panic!("ttl index holds {item_id} without an expiry"),
                },
                None => panic!("ttl index holds {item_id} missing from the primary map"),
            };
            if expiry > now {
                return Some(expiry);
            }
            trace!(item = %item_id, "expired");
            self.remove_item(cfg, &item_id);
        }
    }

    fn clear(&mut self) {
        self.entries.clear();
        self.lru_idx.clear();
        self.ttl_idx.clear();
        self.groups.clear();
    }

    fn link_group(&mut self, group_id: &str, item_id: &str) {
        self.groups
            .entry(group_id.to_string())
            .or_default()
            .insert(item_id.to_string());
    }

    /// Drop one membership link; empty groups are deleted outright.
    fn unlink_group(&mut self, group_id: &str, item_id: &str) {
        if let Some(members) = self.groups.get_mut(group_id) {
            members.remove(item_id);
            if members.is_empty() {
                self.groups.remove(group_id);
            }
        }
    }

    fn emit(&self, cfg: &CacheConfig, event: EntryEvent) {
        if let Some(sink) = &cfg.on_evicted {
            match sink.try_send(event) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    debug!("notification sink full, dropping event");
                }
                Err(TrySendError::Disconnected(_)) => {}
            }
        }
    }
}

/// One named, self-contained cache with its own policies and lock.
pub(crate) struct Partition {
    name: String,
    cfg: CacheConfig,
    clock: Arc<dyn Clock>,
    store: RwLock<Store>,
    reaper: Mutex<Option<JoinHandle<()>>>,
    wake: Option<Sender<()>>,
    stopped: AtomicBool,
}

impl Partition {
    /// Build a partition; a reaper thread is spawned when the TTL is positive.
    pub(crate) fn new(
        name: impl Into<String>,
        cfg: CacheConfig,
        clock: Arc<dyn Clock>,
    ) -> Arc<Self> {
        let with_reaper = cfg.ttl > Duration::ZERO;
        let (wake_tx, wake_rx) = bounded(1);
        let part = Arc::new(Self {
            name: name.into(),
            cfg,
            clock,
            store: RwLock::new(Store::new()),
            reaper: Mutex::new(None),
            wake: with_reaper.then_some(wake_tx),
            stopped: AtomicBool::new(false),
        });
        if with_reaper {
            let weak = Arc::downgrade(&part);
            let handle = std::thread::spawn(move || reaper_loop(weak, wake_rx));
            *part.reaper.lock() = Some(handle);
        }
        part
    }

    pub(crate) fn set(&self, item_id: &str, value: Value, group_ids: &[String]) {
        let now = self.clock.now();
        let ttl_touched = self
            .store
            .write()
            .set(&self.cfg, now, item_id, value, group_ids);
        if ttl_touched {
            self.signal_reaper();
        }
    }

    /// Look an item up and promote it in the LRU index.
    ///
    /// Expiry is not checked here; a lookup racing the reaper may still see
    /// an entry past its deadline.
    pub(crate) fn get(&self, item_id: &str) -> Option<Value> {
        self.store.write().get(item_id)
    }

    pub(crate) fn remove(&self, item_id: &str) {
        self.store.write().remove_item(&self.cfg, item_id);
    }

    pub(crate) fn remove_group(&self, group_id: &str) {
        self.store.write().remove_group(&self.cfg, group_id);
    }

    /// Snapshot of the item ids currently in a group.
    pub(crate) fn group_item_ids(&self, group_id: &str) -> Vec<String> {
        self.store
            .read()
            .groups
            .get(group_id)
            .map(|members| members.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Values of the entries currently in a group, without LRU promotion.
    pub(crate) fn group_items(&self, group_id: &str) -> Vec<Value> {
        let store = self.store.read();
        let Some(members) = store.groups.get(group_id) else {
            return Vec::new();
        };
        members
            .iter()
            .filter_map(|item_id| store.entries.get(item_id))
            .map(|entry| entry.value.clone())
            .collect()
    }

    pub(crate) fn has_group(&self, group_id: &str) -> bool {
        self.store.read().groups.contains_key(group_id)
    }

    pub(crate) fn has_item(&self, item_id: &str) -> bool {
        self.store.read().entries.contains_key(item_id)
    }

    /// Item ids starting with `prefix`; the empty prefix matches all.
    pub(crate) fn item_ids(&self, prefix: &str) -> Vec<String> {
        self.store
            .read()
            .entries
            .keys()
            .filter(|item_id| item_id.starts_with(prefix))
            .cloned()
            .collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.store.read().entries.len()
    }

    /// Expiry of an item: outer `None` when absent, inner `None` when the
    /// entry never expires.
    pub(crate) fn expiry_time(&self, item_id: &str) -> Option<Option<Instant>> {
        self.store
            .read()
            .entries
            .get(item_id)
            .map(|entry| entry.expiry)
    }

    pub(crate) fn stats(&self) -> CacheStats {
        let store = self.store.read();
        CacheStats {
            items: store.entries.len(),
            groups: store.groups.len(),
        }
    }

    /// Reset every index. No notifications are emitted for cleared entries.
    pub(crate) fn clear(&self) {
        self.store.write().clear();
    }

    /// Stop the reaper thread, if any, and wait for it to exit.
    pub(crate) fn shutdown(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.signal_reaper();
        if let Some(handle) = self.reaper.lock().take() {
            debug!(partition = %self.name, "stopping reaper");
            let _ = handle.join();
        }
    }

    fn signal_reaper(&self) {
        if let Some(wake) = &self.wake {
            // A pending wake already forces a recompute; coalesce.
            let _ = wake.try_send(());
        }
    }

    #[cfg(test)]
    pub(crate) fn reap_now(&self) -> Option<Instant> {
        let now = self.clock.now();
        self.store.write().drain_expired(&self.cfg, now)
    }
}

/// Background expiry loop. Holds the partition lock only while draining,
/// never across a sleep.
fn reaper_loop(part: Weak<Partition>, wake: Receiver<()>) {
    loop {
        let next_wait = {
            let Some(part) = part.upgrade() else { break };
            if part.stopped.load(Ordering::SeqCst) {
                break;
            }
            let now = part.clock.now();
            let next = part.store.write().drain_expired(&part.cfg, now);
            next.map(|at| at.saturating_duration_since(part.clock.now()))
        };
        match next_wait {
            Some(wait) => match wake.recv_timeout(wait) {
                Ok(()) | Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            },
            // TTL index is empty; park until the next Set signals.
            None => match wake.recv() {
                Ok(()) => {}
                Err(_) => break,
            },
        }
    }
    debug!("reaper stopped");
}

#[cfg(test)]
impl Partition {
    /// Assert the cross-index invariants hold.
    pub(crate) fn audit(&self) {
        let store = self.store.read();

        // LRU index contents equal the primary key set.
        assert_eq!(store.lru_idx.len(), store.entries.len());
        let lru_ids: HashSet<&String> = store.lru_idx.iter().collect();
        assert_eq!(lru_ids.len(), store.entries.len());
        for item_id in store.entries.keys() {
            assert!(lru_ids.contains(item_id), "{item_id} missing from lru");
        }

        // TTL index contents equal the entries with an expiry, soonest first.
        let with_expiry = store
            .entries
            .values()
            .filter(|entry| entry.expiry.is_some())
            .count();
        assert_eq!(store.ttl_idx.len(), with_expiry);
        let mut last = None;
        for item_id in store.ttl_idx.iter() {
            let entry = store.entries.get(item_id).expect("ttl node without entry");
            let at = entry.expiry.expect("ttl node without expiry");
            if let Some(prev) = last {
                assert!(at >= prev, "ttl index out of order");
            }
            last = Some(at);
        }

        // Group index and per-entry group sets are exact inverses.
        for (item_id, entry) in &store.entries {
            for group_id in &entry.group_ids {
                assert!(
                    store
                        .groups
                        .get(group_id)
                        .is_some_and(|members| members.contains(item_id)),
                    "{item_id} not indexed under {group_id}"
                );
            }
        }
        for (group_id, members) in &store.groups {
            assert!(!members.is_empty(), "empty group {group_id} retained");
            for item_id in members {
                assert!(
                    store
                        .entries
                        .get(item_id)
                        .is_some_and(|entry| entry.group_ids.contains(group_id)),
                    "{group_id} lists unknown member {item_id}"
                );
            }
        }

        // Capacity bound.
        if self.cfg.max_items > 0 {
            assert!(store.entries.len() <= self.cfg.max_items as usize);
        }
    }
}
