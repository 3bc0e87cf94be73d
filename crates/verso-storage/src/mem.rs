use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::sync::Arc;

use tokio::sync::RwLock;

use verso_types::{NodeId, Tuid, VersoError};

use crate::keys::check_component;
use crate::traits::{LeaseStore, TableStore};
use crate::types::{IndexHit, IndexOp, IndexRow, NodeLease, VersionRow};

// ---------------------------------------------------------------------------
// MemTables
// ---------------------------------------------------------------------------

struct IndexCell {
    entity: Tuid,
    expires_at_ms: Option<i64>,
}

#[derive(Default)]
struct MemTablesInner {
    /// (table, id, update_id) → row
    versions: BTreeMap<(String, Tuid, Tuid), VersionRow>,
    /// (index, value, clustering) → owning entity
    indexes: BTreeMap<(String, String, Tuid), IndexCell>,
    /// (counter, key, bucket) → count
    counters: BTreeMap<(String, String, i64), u64>,
}

impl MemTablesInner {
    /// Apply an op already accepted by `check_op`.
    fn apply(&mut self, op: IndexOp) {
        match op {
            IndexOp::Insert { row, expires_at_ms } => {
                self.indexes.insert(
                    (row.index, row.value, row.clustering),
                    IndexCell { entity: row.entity, expires_at_ms },
                );
            }
            IndexOp::Retract(row) => {
                self.indexes.remove(&(row.index, row.value, row.clustering));
            }
            IndexOp::Increment(bump) => {
                let count = self.counters.entry((bump.counter, bump.key, bump.bucket)).or_insert(0);
                *count = count.saturating_add(bump.delta);
            }
        }
    }
}

fn check_row(row: &IndexRow) -> Result<(), VersoError> {
    check_component("index name", &row.index)?;
    check_component("index value", &row.value)
}

fn check_op(op: &IndexOp) -> Result<(), VersoError> {
    match op {
        IndexOp::Insert { row, .. } => check_row(row),
        IndexOp::Retract(_) => Ok(()),
        IndexOp::Increment(bump) => {
            check_component("counter name", &bump.counter)?;
            check_component("counter key", &bump.key)
        }
    }
}

/// In-memory `TableStore` backed by `BTreeMap`s.
///
/// Intended for tests and embedding; not persisted across restarts.
#[derive(Clone, Default)]
pub struct MemTables {
    inner: Arc<RwLock<MemTablesInner>>,
}

impl MemTables {
    pub fn new() -> Self {
        Self::default()
    }
}

fn version_range(table: &str, id: Tuid) -> (Bound<(String, Tuid, Tuid)>, Bound<(String, Tuid, Tuid)>) {
    (
        Bound::Included((table.to_string(), id, Tuid::MIN)),
        Bound::Included((table.to_string(), id, Tuid::MAX)),
    )
}

impl TableStore for MemTables {
    async fn put_version(&self, table: &str, row: VersionRow) -> Result<(), VersoError> {
        check_component("table name", table)?;
        self.inner
            .write()
            .await
            .versions
            .insert((table.to_string(), row.id, row.update_id), row);
        Ok(())
    }

    async fn get_version(
        &self,
        table: &str,
        id: Tuid,
        update_id: Tuid,
    ) -> Result<Option<VersionRow>, VersoError> {
        let g = self.inner.read().await;
        Ok(g.versions.get(&(table.to_string(), id, update_id)).cloned())
    }

    async fn latest_version(&self, table: &str, id: Tuid) -> Result<Option<VersionRow>, VersoError> {
        let g = self.inner.read().await;
        Ok(g.versions.range(version_range(table, id)).next_back().map(|(_, r)| r.clone()))
    }

    async fn versions(&self, table: &str, id: Tuid) -> Result<Vec<VersionRow>, VersoError> {
        let g = self.inner.read().await;
        Ok(g.versions.range(version_range(table, id)).map(|(_, r)| r.clone()).collect())
    }

    async fn delete_versions(&self, table: &str, id: Tuid) -> Result<usize, VersoError> {
        let mut g = self.inner.write().await;
        let keys: Vec<(String, Tuid, Tuid)> =
            g.versions.range(version_range(table, id)).map(|(k, _)| k.clone()).collect();
        for k in &keys {
            g.versions.remove(k);
        }
        Ok(keys.len())
    }

    async fn entity_ids(
        &self,
        table: &str,
        after: Option<Tuid>,
        limit: usize,
    ) -> Result<Vec<Tuid>, VersoError> {
        let g = self.inner.read().await;
        let start = match after {
            Some(a) => Bound::Excluded((table.to_string(), a, Tuid::MAX)),
            None => Bound::Included((table.to_string(), Tuid::MIN, Tuid::MIN)),
        };
        let end = Bound::Included((table.to_string(), Tuid::MAX, Tuid::MAX));
        let mut ids: Vec<Tuid> = Vec::new();
        for ((_, id, _), _) in g.versions.range((start, end)) {
            if ids.last() != Some(id) {
                if ids.len() == limit {
                    break;
                }
                ids.push(*id);
            }
        }
        Ok(ids)
    }

    async fn apply_index_op(&self, op: IndexOp) -> Result<(), VersoError> {
        check_op(&op)?;
        self.inner.write().await.apply(op);
        Ok(())
    }

    /// All-or-nothing: a batch with one invalid op applies none of them.
    async fn apply_index_batch(&self, ops: Vec<IndexOp>) -> Result<(), VersoError> {
        ops.iter().try_for_each(check_op)?;
        let mut g = self.inner.write().await;
        for op in ops {
            g.apply(op);
        }
        Ok(())
    }

    async fn index_range(
        &self,
        index: &str,
        value: &str,
        after: Option<Tuid>,
        limit: usize,
    ) -> Result<Vec<IndexHit>, VersoError> {
        let g = self.inner.read().await;
        let start = match after {
            Some(a) => Bound::Excluded((index.to_string(), value.to_string(), a)),
            None => Bound::Included((index.to_string(), value.to_string(), Tuid::MIN)),
        };
        let end = Bound::Included((index.to_string(), value.to_string(), Tuid::MAX));
        Ok(g.indexes
            .range((start, end))
            .take(limit)
            .map(|((_, _, clustering), cell)| IndexHit { clustering: *clustering, entity: cell.entity })
            .collect())
    }

    async fn counter_range(
        &self,
        counter: &str,
        key: &str,
        after: Option<i64>,
        limit: usize,
    ) -> Result<Vec<(i64, u64)>, VersoError> {
        let g = self.inner.read().await;
        let start = match after {
            Some(a) => Bound::Excluded((counter.to_string(), key.to_string(), a)),
            None => Bound::Included((counter.to_string(), key.to_string(), i64::MIN)),
        };
        let end = Bound::Included((counter.to_string(), key.to_string(), i64::MAX));
        Ok(g.counters
            .range((start, end))
            .take(limit)
            .map(|((_, _, bucket), count)| (*bucket, *count))
            .collect())
    }

    async fn purge_expired(&self, now_ms: i64) -> Result<usize, VersoError> {
        let mut g = self.inner.write().await;
        let expired = |exp: Option<i64>| exp.is_some_and(|e| e <= now_ms);
        let before = g.versions.len() + g.indexes.len();
        g.versions.retain(|_, row| !expired(row.expires_at_ms));
        g.indexes.retain(|_, cell| !expired(cell.expires_at_ms));
        Ok(before - g.versions.len() - g.indexes.len())
    }
}

// ---------------------------------------------------------------------------
// MemLeases
// ---------------------------------------------------------------------------

#[derive(Default)]
struct MemLeasesInner {
    active: BTreeMap<NodeId, NodeLease>,
    by_identity: HashMap<String, NodeId>,
    history: BTreeMap<NodeId, Vec<NodeLease>>,
}

/// In-memory `LeaseStore`. Clones share state, so several registries built
/// over clones behave like processes sharing one cluster store.
#[derive(Clone, Default)]
pub struct MemLeases {
    inner: Arc<RwLock<MemLeasesInner>>,
}

impl MemLeases {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LeaseStore for MemLeases {
    async fn lease(&self, node_id: NodeId) -> Result<Option<NodeLease>, VersoError> {
        Ok(self.inner.read().await.active.get(&node_id).cloned())
    }

    async fn lease_for_identity(&self, identity: &str) -> Result<Option<NodeLease>, VersoError> {
        let g = self.inner.read().await;
        Ok(g.by_identity.get(identity).and_then(|id| g.active.get(id)).cloned())
    }

    async fn leases(&self) -> Result<Vec<NodeLease>, VersoError> {
        Ok(self.inner.read().await.active.values().cloned().collect())
    }

    async fn insert_lease_if_absent(&self, lease: NodeLease) -> Result<bool, VersoError> {
        let mut g = self.inner.write().await;
        if g.active.contains_key(&lease.node_id) {
            return Ok(false);
        }
        g.by_identity.insert(lease.identity.clone(), lease.node_id);
        g.history.entry(lease.node_id).or_default().push(lease.clone());
        g.active.insert(lease.node_id, lease);
        Ok(true)
    }

    async fn refresh_lease(&self, lease: NodeLease) -> Result<(), VersoError> {
        let mut g = self.inner.write().await;
        g.history.entry(lease.node_id).or_default().push(lease.clone());
        g.active.insert(lease.node_id, lease);
        Ok(())
    }

    async fn remove_lease(&self, node_id: NodeId) -> Result<Option<NodeLease>, VersoError> {
        let mut g = self.inner.write().await;
        let removed = g.active.remove(&node_id);
        if let Some(ref lease) = removed {
            if g.by_identity.get(&lease.identity) == Some(&node_id) {
                g.by_identity.remove(&lease.identity);
            }
        }
        Ok(removed)
    }

    async fn lease_history(&self, node_id: NodeId) -> Result<Vec<NodeLease>, VersoError> {
        Ok(self.inner.read().await.history.get(&node_id).cloned().unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::CounterBump;

    fn row(id: Tuid, update_id: Tuid, payload: &[u8]) -> VersionRow {
        VersionRow { id, update_id, payload: payload.to_vec(), expires_at_ms: None }
    }

    fn index_row(value: &str, id: Tuid) -> IndexRow {
        IndexRow { index: "state".into(), value: value.into(), clustering: id, entity: id }
    }

    // -----------------------------------------------------------------------
    // MemTables tests
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn versions_latest_and_history() {
        let tables = MemTables::new();
        let id = Tuid::pack(1_000, 0, 1);
        let v2 = Tuid::pack(1_005, 0, 1);
        let v3 = Tuid::pack(1_009, 2, 1);

        // Written out of order; reads are still ordered by update id.
        tables.put_version("t", row(id, v3, b"3")).await.unwrap();
        tables.put_version("t", row(id, id, b"1")).await.unwrap();
        tables.put_version("t", row(id, v2, b"2")).await.unwrap();

        let latest = tables.latest_version("t", id).await.unwrap().unwrap();
        assert_eq!(latest.payload, b"3");

        let all = tables.versions("t", id).await.unwrap();
        let ids: Vec<Tuid> = all.iter().map(|r| r.update_id).collect();
        assert_eq!(ids, vec![id, v2, v3]);

        assert_eq!(tables.get_version("t", id, v2).await.unwrap().unwrap().payload, b"2");
        assert!(tables.latest_version("other", id).await.unwrap().is_none());

        assert_eq!(tables.delete_versions("t", id).await.unwrap(), 3);
        assert!(tables.latest_version("t", id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn entity_ids_are_distinct_and_paged() {
        let tables = MemTables::new();
        let ids: Vec<Tuid> = (0..5).map(|i| Tuid::pack(1_000 + i, 0, 1)).collect();
        for id in &ids {
            tables.put_version("t", row(*id, *id, b"a")).await.unwrap();
            tables.put_version("t", row(*id, Tuid::pack(9_000, 0, 1), b"b")).await.unwrap();
        }
        let first = tables.entity_ids("t", None, 3).await.unwrap();
        assert_eq!(first, ids[..3].to_vec());
        let rest = tables.entity_ids("t", Some(ids[2]), 10).await.unwrap();
        assert_eq!(rest, ids[3..].to_vec());
    }

    #[tokio::test]
    async fn index_insert_range_retract() {
        let tables = MemTables::new();
        let a = Tuid::pack(1_000, 0, 1);
        let b = Tuid::pack(1_001, 0, 1);
        for id in [b, a] {
            tables
                .apply_index_op(IndexOp::Insert { row: index_row("CA", id), expires_at_ms: None })
                .await
                .unwrap();
        }
        tables
            .apply_index_op(IndexOp::Insert { row: index_row("CAT", a), expires_at_ms: None })
            .await
            .unwrap();

        let hits = tables.index_range("state", "CA", None, 10).await.unwrap();
        assert_eq!(hits.iter().map(|h| h.entity).collect::<Vec<_>>(), vec![a, b]);
        let after = tables.index_range("state", "CA", Some(a), 10).await.unwrap();
        assert_eq!(after.len(), 1);

        tables.apply_index_op(IndexOp::Retract(index_row("CA", a))).await.unwrap();
        let hits = tables.index_range("state", "CA", None, 10).await.unwrap();
        assert_eq!(hits.iter().map(|h| h.entity).collect::<Vec<_>>(), vec![b]);
    }

    #[tokio::test]
    async fn counters_only_increment() {
        let tables = MemTables::new();
        let bump = |bucket| {
            IndexOp::Increment(CounterBump {
                counter: "events_by_level".into(),
                key: "INFO".into(),
                bucket,
                delta: 1,
            })
        };
        tables
            .apply_index_batch(vec![bump(20240101), bump(20240101), bump(20240102)])
            .await
            .unwrap();
        let counts = tables.counter_range("events_by_level", "INFO", None, 10).await.unwrap();
        assert_eq!(counts, vec![(20240101, 2), (20240102, 1)]);
        let later = tables
            .counter_range("events_by_level", "INFO", Some(20240101), 10)
            .await
            .unwrap();
        assert_eq!(later, vec![(20240102, 1)]);
    }

    #[tokio::test]
    async fn purge_expired_removes_only_due_rows() {
        let tables = MemTables::new();
        let id = Tuid::pack(1_000, 0, 1);
        let keep = Tuid::pack(1_001, 0, 1);
        let mut expiring = row(id, id, b"x");
        expiring.expires_at_ms = Some(5_000);
        tables.put_version("t", expiring).await.unwrap();
        tables.put_version("t", row(keep, keep, b"y")).await.unwrap();
        tables
            .apply_index_op(IndexOp::Insert { row: index_row("CA", id), expires_at_ms: Some(5_000) })
            .await
            .unwrap();

        assert_eq!(tables.purge_expired(4_999).await.unwrap(), 0);
        assert_eq!(tables.purge_expired(5_000).await.unwrap(), 2);
        assert!(tables.latest_version("t", id).await.unwrap().is_none());
        assert!(tables.latest_version("t", keep).await.unwrap().is_some());
        assert!(tables.index_range("state", "CA", None, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn nul_in_index_value_is_rejected() {
        let tables = MemTables::new();
        let id = Tuid::pack(1_000, 0, 1);
        let err = tables
            .apply_index_op(IndexOp::Insert { row: index_row("C\0A", id), expires_at_ms: None })
            .await
            .unwrap_err();
        assert!(matches!(err, VersoError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn invalid_batch_applies_nothing() {
        let tables = MemTables::new();
        let id = Tuid::pack(1_000, 0, 1);
        let bump = IndexOp::Increment(CounterBump {
            counter: "events_by_level".into(),
            key: "INFO".into(),
            bucket: 20240101,
            delta: 1,
        });
        let err = tables
            .apply_index_batch(vec![
                IndexOp::Insert { row: index_row("CA", id), expires_at_ms: None },
                bump,
                IndexOp::Insert { row: index_row("C\0A", id), expires_at_ms: None },
            ])
            .await
            .unwrap_err();
        assert!(matches!(err, VersoError::InvalidArgument(_)));
        assert!(tables.index_range("state", "CA", None, 10).await.unwrap().is_empty());
        assert!(tables.counter_range("events_by_level", "INFO", None, 10).await.unwrap().is_empty());
    }

    // -----------------------------------------------------------------------
    // MemLeases tests
    // -----------------------------------------------------------------------

    fn lease(node_id: NodeId, identity: &str, at: i64) -> NodeLease {
        NodeLease { node_id, identity: identity.into(), assigned_at_ms: at }
    }

    #[tokio::test]
    async fn first_writer_wins() {
        let leases = MemLeases::new();
        assert!(leases.insert_lease_if_absent(lease(7, "10.0.0.1", 1)).await.unwrap());
        assert!(!leases.insert_lease_if_absent(lease(7, "10.0.0.2", 2)).await.unwrap());

        let held = leases.lease(7).await.unwrap().unwrap();
        assert_eq!(held.identity, "10.0.0.1");
        assert!(leases.lease_for_identity("10.0.0.2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn remove_keeps_history() {
        let leases = MemLeases::new();
        leases.insert_lease_if_absent(lease(7, "a", 1)).await.unwrap();
        leases.refresh_lease(lease(7, "a", 2)).await.unwrap();
        leases.remove_lease(7).await.unwrap();
        leases.insert_lease_if_absent(lease(7, "b", 3)).await.unwrap();

        let history = leases.lease_history(7).await.unwrap();
        let who: Vec<(&str, i64)> =
            history.iter().map(|l| (l.identity.as_str(), l.assigned_at_ms)).collect();
        assert_eq!(who, vec![("a", 1), ("a", 2), ("b", 3)]);
        assert!(leases.lease_for_identity("a").await.unwrap().is_none());
        assert_eq!(leases.lease_for_identity("b").await.unwrap().unwrap().node_id, 7);
    }
}
