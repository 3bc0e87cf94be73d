use std::future::Future;

use verso_types::{NodeId, Tuid, VersoError};

use crate::types::{IndexHit, IndexOp, NodeLease, VersionRow};

/// Primary version tables, secondary index tables and counting indexes for
/// every entity type.
///
/// Methods use RPITIT (`-> impl Future + Send`); no `async-trait` dependency.
/// Each call is independently durable once it returns `Ok`; nothing here
/// spans more than one row set atomically except `apply_index_batch`, and
/// only when the backend has a native batch.
pub trait TableStore: Send + Sync + 'static {
    /// Write one version row. Existing rows are never rewritten by callers.
    fn put_version(&self, table: &str, row: VersionRow)
        -> impl Future<Output = Result<(), VersoError>> + Send;

    /// Point read of `(id, update_id)`.
    fn get_version(&self, table: &str, id: Tuid, update_id: Tuid)
        -> impl Future<Output = Result<Option<VersionRow>, VersoError>> + Send;

    /// The row with the greatest `update_id` for `id`: a descending scan
    /// limited to one row.
    fn latest_version(&self, table: &str, id: Tuid)
        -> impl Future<Output = Result<Option<VersionRow>, VersoError>> + Send;

    /// Every row for `id`, ascending by `update_id`.
    fn versions(&self, table: &str, id: Tuid)
        -> impl Future<Output = Result<Vec<VersionRow>, VersoError>> + Send;

    /// Remove every row for `id`; returns how many were removed.
    fn delete_versions(&self, table: &str, id: Tuid)
        -> impl Future<Output = Result<usize, VersoError>> + Send;

    /// Distinct entity ids in the table, ascending, strictly after `after`.
    fn entity_ids(&self, table: &str, after: Option<Tuid>, limit: usize)
        -> impl Future<Output = Result<Vec<Tuid>, VersoError>> + Send;

    /// Apply one index insert, retraction or counter increment.
    fn apply_index_op(&self, op: IndexOp)
        -> impl Future<Output = Result<(), VersoError>> + Send;

    /// Apply several index ops together, atomically where the backend can.
    fn apply_index_batch(&self, ops: Vec<IndexOp>)
        -> impl Future<Output = Result<(), VersoError>> + Send;

    /// Rows of `(index, value)` with clustering id strictly after `after`,
    /// ascending, at most `limit`.
    fn index_range(&self, index: &str, value: &str, after: Option<Tuid>, limit: usize)
        -> impl Future<Output = Result<Vec<IndexHit>, VersoError>> + Send;

    /// `(bucket, count)` pairs of `(counter, key)` with bucket strictly after
    /// `after`, ascending, at most `limit`.
    fn counter_range(&self, counter: &str, key: &str, after: Option<i64>, limit: usize)
        -> impl Future<Output = Result<Vec<(i64, u64)>, VersoError>> + Send;

    /// Remove version and index rows whose expiry is at or before `now_ms`.
    fn purge_expired(&self, now_ms: i64)
        -> impl Future<Output = Result<usize, VersoError>> + Send;
}

/// Cluster-visible node id leases.
///
/// Backends must make `insert_lease_if_absent` first-writer-wins for a given
/// node id. History rows are never removed by `remove_lease`.
pub trait LeaseStore: Send + Sync + 'static {
    fn lease(&self, node_id: NodeId)
        -> impl Future<Output = Result<Option<NodeLease>, VersoError>> + Send;

    fn lease_for_identity(&self, identity: &str)
        -> impl Future<Output = Result<Option<NodeLease>, VersoError>> + Send;

    /// Every active lease, ascending by node id.
    fn leases(&self) -> impl Future<Output = Result<Vec<NodeLease>, VersoError>> + Send;

    /// Persist `lease` unless its node id is already leased. Returns `false`
    /// when another identity got there first. Appends a history row on
    /// success.
    fn insert_lease_if_absent(&self, lease: NodeLease)
        -> impl Future<Output = Result<bool, VersoError>> + Send;

    /// Overwrite the timestamp of an existing lease and append a history row.
    fn refresh_lease(&self, lease: NodeLease)
        -> impl Future<Output = Result<(), VersoError>> + Send;

    /// Drop the active lease (and its identity mapping). History is kept.
    fn remove_lease(&self, node_id: NodeId)
        -> impl Future<Output = Result<Option<NodeLease>, VersoError>> + Send;

    /// Every assignment and refresh of `node_id`, oldest first.
    fn lease_history(&self, node_id: NodeId)
        -> impl Future<Output = Result<Vec<NodeLease>, VersoError>> + Send;
}
