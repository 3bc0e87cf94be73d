use verso_types::{NodeId, Tuid};

/// One immutable version of an entity in its primary table, keyed by
/// `(id, update_id)`.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct VersionRow {
    pub id: Tuid,
    pub update_id: Tuid,
    /// Opaque serialized entity.
    pub payload: Vec<u8>,
    /// Unix milliseconds after which the TTL sweeper may remove the row.
    pub expires_at_ms: Option<i64>,
}

/// Index row keyed by `(index, value, clustering)`.
///
/// `clustering` is either the entity id or the update id of the version that
/// produced the row; `entity` always names the owning entity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct IndexRow {
    pub index: String,
    pub value: String,
    pub clustering: Tuid,
    pub entity: Tuid,
}

/// A row returned from an index range scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexHit {
    pub clustering: Tuid,
    pub entity: Tuid,
}

/// Increment of a counting index: `(counter, key, bucket) += delta`.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct CounterBump {
    pub counter: String,
    pub key: String,
    pub bucket: i64,
    pub delta: u64,
}

/// A single index-layer write. Index ops are never part of the primary write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IndexOp {
    Insert { row: IndexRow, expires_at_ms: Option<i64> },
    Retract(IndexRow),
    Increment(CounterBump),
}

impl IndexOp {
    pub fn is_retraction(&self) -> bool {
        matches!(self, IndexOp::Retract(_))
    }

    /// Name of the index or counter this op touches.
    pub fn target(&self) -> &str {
        match self {
            IndexOp::Insert { row, .. } | IndexOp::Retract(row) => &row.index,
            IndexOp::Increment(bump) => &bump.counter,
        }
    }
}

/// Assignment of a node id to a process identity.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct NodeLease {
    pub node_id: NodeId,
    /// Process identity, typically the bound network address.
    pub identity: String,
    /// Unix milliseconds of the assignment or the latest refresh.
    pub assigned_at_ms: i64,
}

impl NodeLease {
    /// ISO-8601 rendering of `assigned_at_ms`.
    pub fn assigned_at(&self) -> String {
        Tuid::floor(self.assigned_at_ms).created_at_iso()
    }
}
