mod tuid;

pub use tuid::{Tuid, MAX_SEQUENCE, TEXT_WIDTH};

/// Node id embedded in the low byte of every identifier.
///
/// Valid ids are `NODE_ID_MIN..=NODE_ID_MAX`; `-128` is unused by convention.
pub type NodeId = i8;

pub const NODE_ID_MIN: NodeId = -127;
pub const NODE_ID_MAX: NodeId = 127;

/// Every assignable node id, highest first.
pub fn node_id_pool() -> impl Iterator<Item = NodeId> {
    (NODE_ID_MIN..=NODE_ID_MAX).rev()
}

pub fn is_valid_node_id(node_id: NodeId) -> bool {
    (NODE_ID_MIN..=NODE_ID_MAX).contains(&node_id)
}

#[derive(thiserror::Error, Debug)]
pub enum VersoError {
    #[error("identifier allocator used before a node id was assigned")]
    NotInitialized,
    #[error("no free node id left in the lease pool")]
    PoolExhausted,
    #[error("node id {node_id} was leased concurrently by another process")]
    LeaseConflict { node_id: NodeId },
    #[error("{table}: update requires an entity id")]
    MissingIdentifier { table: String },
    #[error("{table}: entity {id} already exists")]
    AlreadyExists { table: String, id: Tuid },
    #[error("{index}: value '{value}' is already held by another entity")]
    UniqueViolation { index: String, value: String },
    #[error("entity {id} deleted but {failed} index retraction(s) failed")]
    PartialDeleteFailure { id: Tuid, failed: usize },
    #[error("sequence exhausted for backdated millisecond {millis}")]
    SequenceExhausted { millis: i64 },
    #[error("clock did not advance after {waited_pauses} pauses")]
    ClockStalled { waited_pauses: u64 },
    #[error("invalid identifier: {0}")]
    InvalidIdentifier(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("storage error: {0}")]
    Storage(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_has_255_ids() {
        let pool: Vec<NodeId> = node_id_pool().collect();
        assert_eq!(pool.len(), 255);
        assert_eq!(pool.first(), Some(&127));
        assert_eq!(pool.last(), Some(&-127));
        assert!(!pool.contains(&-128));
    }

    #[test]
    fn minus_128_is_not_assignable() {
        assert!(!is_valid_node_id(-128));
        assert!(is_valid_node_id(-127));
        assert!(is_valid_node_id(0));
    }
}
