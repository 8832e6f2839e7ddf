//! Randomized workload checks for the index invariants

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use proptest::prelude::*;

use crate::clock::SystemClock;
use crate::config::CacheConfig;
use crate::partition::Partition;
use crate::transcache::TransCache;
use crate::value::Value;

#[derive(Debug, Clone)]
enum Op {
    Set { item: String, groups: Vec<String> },
    Get { item: String },
    Remove { item: String },
    RemoveGroup { group: String },
}

fn item_strategy() -> impl Strategy<Value = String> {
    (0u8..12).prop_map(|i| format!("k{i}"))
}

fn group_strategy() -> impl Strategy<Value = String> {
    (0u8..4).prop_map(|g| format!("g{g}"))
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        (item_strategy(), prop::collection::vec(group_strategy(), 0..3))
            .prop_map(|(item, groups)| Op::Set { item, groups }),
        item_strategy().prop_map(|item| Op::Get { item }),
        item_strategy().prop_map(|item| Op::Remove { item }),
        group_strategy().prop_map(|group| Op::RemoveGroup { group }),
    ]
}

fn apply(part: &Partition, op: &Op) {
    match op {
        Op::Set { item, groups } => part.set(item, Value::opaque(0u8), groups),
        Op::Get { item } => {
            let _ = part.get(item);
        }
        Op::Remove { item } => part.remove(item),
        Op::RemoveGroup { group } => part.remove_group(group),
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    // The LRU, TTL, and group indexes stay exact inverses of the primary map
    // through arbitrary interleavings, eviction included.
    #[test]
    fn prop_indexes_stay_consistent(ops in prop::collection::vec(op_strategy(), 1..80)) {
        let part = Partition::new(
            "prop",
            CacheConfig { max_items: 8, ..Default::default() },
            Arc::new(SystemClock),
        );
        for op in &ops {
            apply(&part, op);
            part.audit();
        }
    }

    // Without a capacity bound, membership matches a plain model exactly.
    #[test]
    fn prop_membership_matches_model(ops in prop::collection::vec(op_strategy(), 1..80)) {
        let part = Partition::new("prop", CacheConfig::default(), Arc::new(SystemClock));
        let mut model: HashMap<String, HashSet<String>> = HashMap::new();

        for op in &ops {
            apply(&part, op);
            match op {
                Op::Set { item, groups } => {
                    model.insert(item.clone(), groups.iter().cloned().collect());
                }
                Op::Get { .. } => {}
                Op::Remove { item } => {
                    model.remove(item);
                }
                Op::RemoveGroup { group } => {
                    model.retain(|_, groups| !groups.contains(group));
                }
            }
        }

        prop_assert_eq!(part.len(), model.len());
        for (item, groups) in &model {
            prop_assert!(part.has_item(item));
            for group in groups {
                let mut members: Vec<String> = model
                    .iter()
                    .filter(|(_, gs)| gs.contains(group))
                    .map(|(id, _)| id.clone())
                    .collect();
                members.sort();
                let mut indexed = part.group_item_ids(group);
                indexed.sort();
                prop_assert_eq!(indexed, members);
            }
        }
        part.audit();
    }

    // The capacity bound holds after every single set.
    #[test]
    fn prop_capacity_bound_holds(
        cap in 1isize..6,
        ops in prop::collection::vec(op_strategy(), 1..60),
    ) {
        let part = Partition::new(
            "prop",
            CacheConfig { max_items: cap, ..Default::default() },
            Arc::new(SystemClock),
        );
        for op in &ops {
            apply(&part, op);
            prop_assert!(part.len() <= cap as usize);
        }
    }

    // Staged writes are invisible until commit, and commit closes the
    // transaction.
    #[test]
    fn prop_staged_writes_invisible(items in prop::collection::hash_set("[a-z]{3,8}", 1..12)) {
        let tc = TransCache::new(HashMap::new());
        let trans_id = tc.begin_transaction();

        for item in &items {
            tc.set("prop_", item, Value::opaque(1u8), &[], false, &trans_id);
        }
        for item in &items {
            prop_assert!(tc.get("prop_", item).is_none());
        }
        prop_assert!(tc.has_transaction(&trans_id));

        tc.commit_transaction(&trans_id);
        prop_assert!(!tc.has_transaction(&trans_id));
        for item in &items {
            prop_assert!(tc.get("prop_", item).is_some());
        }
    }

    // Rollback leaves no trace of the staged ops.
    #[test]
    fn prop_rollback_discards(items in prop::collection::hash_set("[a-z]{3,8}", 1..12)) {
        let tc = TransCache::new(HashMap::new());
        let trans_id = tc.begin_transaction();

        for item in &items {
            tc.set("prop_", item, Value::opaque(1u8), &[], false, &trans_id);
        }
        tc.rollback_transaction(&trans_id);

        prop_assert!(!tc.has_transaction(&trans_id));
        for item in &items {
            prop_assert!(tc.get("prop_", item).is_none());
        }
    }
}
