//! Deferred transaction operations

use crate::value::Value;

/// One mutation recorded in a transaction log.
///
/// Ops are never executed at staging time; commit replays them in FIFO order
/// through the non-transactional path.
#[derive(Clone, Debug)]
pub(crate) enum TransOp {
    Set {
        cache_id: String,
        item_id: String,
        value: Value,
        group_ids: Vec<String>,
    },
    Remove {
        cache_id: String,
        item_id: String,
    },
    RemoveGroup {
        cache_id: String,
        group_id: String,
    },
}
