use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;

use verso_types::{NodeId, Tuid, VersoError};

use crate::keys::{
    check_component, counter_key, counter_prefix, decode_lease_key, decode_ordered_i64, index_key,
    index_prefix, lease_history_key, lease_key, split_ttl_key, table_prefix, ttl_bound, ttl_key,
    version_key, version_key_id, version_prefix, TtlTarget,
};
use crate::traits::{LeaseStore, TableStore};
use crate::types::{IndexHit, IndexOp, NodeLease, VersionRow};

fn encode<T: serde::Serialize>(val: &T) -> Result<Vec<u8>, VersoError> {
    bincode::serde::encode_to_vec(val, bincode::config::standard())
        .map_err(|e| VersoError::Storage(e.to_string()))
}

fn decode<T: for<'de> serde::Deserialize<'de>>(bytes: &[u8]) -> Result<T, VersoError> {
    bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map(|(v, _)| v)
        .map_err(|e| VersoError::Storage(e.to_string()))
}

fn fjall_err(e: fjall::Error) -> VersoError {
    VersoError::Storage(e.to_string())
}

fn join_err(e: tokio::task::JoinError) -> VersoError {
    VersoError::Storage(e.to_string())
}

/// One pending keyspace write, committed together with its siblings.
enum Staged<'a> {
    Put(&'a fjall::Keyspace, Vec<u8>, Vec<u8>),
    Remove(&'a fjall::Keyspace, Vec<u8>),
}

/// Value stored under an `indexes` key.
#[derive(serde::Serialize, serde::Deserialize)]
struct IndexCell {
    entity: Tuid,
    expires_at_ms: Option<i64>,
}

// ---------------------------------------------------------------------------
// FjallStore: shared handle wrapping all keyspaces
// ---------------------------------------------------------------------------

/// Shared storage handle.
///
/// All keyspaces live in a single fjall `Database` so that cross-keyspace
/// write batches are atomic.
pub struct FjallStore {
    pub db: fjall::Database,
    /// Entity versions: `table ++ \x00 ++ id(8) ++ update_id(8)` → bincode(VersionRow)
    pub versions: fjall::Keyspace,
    /// Secondary indexes: `index ++ \x00 ++ value ++ \x00 ++ clustering(8)` → bincode(IndexCell)
    pub indexes: fjall::Keyspace,
    /// Counting indexes: `counter ++ \x00 ++ key ++ \x00 ++ bucket(8)` → u64 BE
    pub counters: fjall::Keyspace,
    /// Active leases: `node(1)` → bincode(NodeLease)
    pub leases: fjall::Keyspace,
    /// Identity lookup: `identity_utf8` → `node(1)`
    pub lease_identity: fjall::Keyspace,
    /// Lease audit trail: `node(1) ++ seq(8)` → bincode(NodeLease)
    pub lease_history: fjall::Keyspace,
    /// Expiry index: `expires_at(8) ++ target(1) ++ target_key` → b""
    pub ttl_index: fjall::Keyspace,
    /// Serializes read-modify-write sequences (counter increments, lease
    /// check-and-insert) within this process.
    write_lock: Mutex<()>,
}

impl FjallStore {
    /// Open (or create) a `FjallStore` at `path`.
    pub fn open(path: &Path) -> Result<Arc<Self>, VersoError> {
        let db = fjall::Database::builder(path).open().map_err(fjall_err)?;
        let open = |name: &str| {
            db.keyspace(name, fjall::KeyspaceCreateOptions::default).map_err(fjall_err)
        };
        let versions = open("versions")?;
        let indexes = open("indexes")?;
        let counters = open("counters")?;
        let leases = open("leases")?;
        let lease_identity = open("lease_identity")?;
        let lease_history = open("lease_history")?;
        let ttl_index = open("ttl_index")?;
        Ok(Arc::new(FjallStore {
            db,
            versions,
            indexes,
            counters,
            leases,
            lease_identity,
            lease_history,
            ttl_index,
            write_lock: Mutex::new(()),
        }))
    }

    fn read_counter(&self, key: &[u8]) -> Result<u64, VersoError> {
        match self.counters.get(key).map_err(fjall_err)? {
            Some(b) => {
                let raw: [u8; 8] = b
                    .as_ref()
                    .try_into()
                    .map_err(|_| VersoError::Storage("malformed counter value".into()))?;
                Ok(u64::from_be_bytes(raw))
            }
            None => Ok(0),
        }
    }

    /// Translate `op` into keyspace writes. Counter increments read the
    /// current value, so callers must hold `write_lock`.
    fn stage<'a>(&'a self, staged: &mut Vec<Staged<'a>>, op: IndexOp) -> Result<(), VersoError> {
        match op {
            IndexOp::Insert { row, expires_at_ms } => {
                check_component("index name", &row.index)?;
                check_component("index value", &row.value)?;
                let key = index_key(&row.index, &row.value, row.clustering);
                if let Some(exp) = expires_at_ms {
                    staged.push(Staged::Put(&self.ttl_index, ttl_key(exp, TtlTarget::Index, &key), Vec::new()));
                }
                let cell = encode(&IndexCell { entity: row.entity, expires_at_ms })?;
                staged.push(Staged::Put(&self.indexes, key, cell));
            }
            IndexOp::Retract(row) => {
                staged.push(Staged::Remove(&self.indexes, index_key(&row.index, &row.value, row.clustering)));
            }
            IndexOp::Increment(bump) => {
                check_component("counter name", &bump.counter)?;
                check_component("counter key", &bump.key)?;
                let key = counter_key(&bump.counter, &bump.key, bump.bucket);
                let next = self.read_counter(&key)?.saturating_add(bump.delta);
                staged.push(Staged::Put(&self.counters, key, next.to_be_bytes().to_vec()));
            }
        }
        Ok(())
    }

    fn commit(&self, staged: Vec<Staged<'_>>) -> Result<(), VersoError> {
        let mut batch = self.db.batch();
        for write in staged {
            match write {
                Staged::Put(ks, k, v) => batch.insert(ks, k, v),
                Staged::Remove(ks, k) => batch.remove(ks, k),
            }
        }
        batch.commit().map_err(fjall_err)
    }

    fn apply_ops(&self, ops: Vec<IndexOp>) -> Result<(), VersoError> {
        // Two increments of one counter key in the same batch would both read
        // the committed value, so they are folded first.
        let _guard = self.write_lock.lock();
        let mut folded: Vec<IndexOp> = Vec::with_capacity(ops.len());
        for op in ops {
            if let IndexOp::Increment(ref bump) = op {
                if let Some(IndexOp::Increment(prev)) = folded.iter_mut().find(|o| {
                    matches!(o, IndexOp::Increment(p)
                        if p.counter == bump.counter && p.key == bump.key && p.bucket == bump.bucket)
                }) {
                    prev.delta = prev.delta.saturating_add(bump.delta);
                    continue;
                }
            }
            folded.push(op);
        }
        let mut staged = Vec::with_capacity(folded.len() + 1);
        for op in folded {
            self.stage(&mut staged, op)?;
        }
        self.commit(staged)
    }
}

// ---------------------------------------------------------------------------
// FjallTables
// ---------------------------------------------------------------------------

/// `TableStore` backed by fjall.
///
/// All blocking I/O is wrapped in `tokio::task::spawn_blocking`.
#[derive(Clone)]
pub struct FjallTables(pub Arc<FjallStore>);

impl TableStore for FjallTables {
    async fn put_version(&self, table: &str, row: VersionRow) -> Result<(), VersoError> {
        check_component("table name", table)?;
        let store = self.0.clone();
        let table = table.to_string();
        tokio::task::spawn_blocking(move || -> Result<(), VersoError> {
            let key = version_key(&table, row.id, row.update_id);
            let mut batch = store.db.batch();
            if let Some(exp) = row.expires_at_ms {
                batch.insert(&store.ttl_index, ttl_key(exp, TtlTarget::Version, &key), Vec::new());
            }
            batch.insert(&store.versions, key, encode(&row)?);
            batch.commit().map_err(fjall_err)
        })
        .await
        .map_err(join_err)?
    }

    async fn get_version(
        &self,
        table: &str,
        id: Tuid,
        update_id: Tuid,
    ) -> Result<Option<VersionRow>, VersoError> {
        let store = self.0.clone();
        let key = version_key(table, id, update_id);
        tokio::task::spawn_blocking(move || -> Result<Option<VersionRow>, VersoError> {
            match store.versions.get(key).map_err(fjall_err)? {
                Some(b) => Ok(Some(decode::<VersionRow>(&b)?)),
                None => Ok(None),
            }
        })
        .await
        .map_err(join_err)?
    }

    async fn latest_version(&self, table: &str, id: Tuid) -> Result<Option<VersionRow>, VersoError> {
        let store = self.0.clone();
        let prefix = version_prefix(table, id);
        tokio::task::spawn_blocking(move || -> Result<Option<VersionRow>, VersoError> {
            match store.versions.prefix(prefix).next_back() {
                None => Ok(None),
                Some(guard) => {
                    let (_, v) = guard.into_inner().map_err(fjall_err)?;
                    Ok(Some(decode::<VersionRow>(&v)?))
                }
            }
        })
        .await
        .map_err(join_err)?
    }

    async fn versions(&self, table: &str, id: Tuid) -> Result<Vec<VersionRow>, VersoError> {
        let store = self.0.clone();
        let prefix = version_prefix(table, id);
        tokio::task::spawn_blocking(move || -> Result<Vec<VersionRow>, VersoError> {
            store
                .versions
                .prefix(prefix)
                .map(|g| g.into_inner().map_err(fjall_err).and_then(|(_, v)| decode::<VersionRow>(&v)))
                .collect()
        })
        .await
        .map_err(join_err)?
    }

    async fn delete_versions(&self, table: &str, id: Tuid) -> Result<usize, VersoError> {
        let store = self.0.clone();
        let prefix = version_prefix(table, id);
        tokio::task::spawn_blocking(move || -> Result<usize, VersoError> {
            let keys: Vec<Vec<u8>> = store
                .versions
                .prefix(prefix)
                .map(|g| g.into_inner().map(|(k, _)| k.to_vec()).map_err(fjall_err))
                .collect::<Result<_, _>>()?;
            let count = keys.len();
            if count > 0 {
                let mut batch = store.db.batch();
                for k in keys {
                    batch.remove(&store.versions, k);
                }
                batch.commit().map_err(fjall_err)?;
            }
            Ok(count)
        })
        .await
        .map_err(join_err)?
    }

    async fn entity_ids(
        &self,
        table: &str,
        after: Option<Tuid>,
        limit: usize,
    ) -> Result<Vec<Tuid>, VersoError> {
        let store = self.0.clone();
        let prefix = table_prefix(table);
        tokio::task::spawn_blocking(move || -> Result<Vec<Tuid>, VersoError> {
            let prefix_len = prefix.len();
            // Skip the rows of `after` by starting just past its last possible key.
            let start = match after {
                Some(a) => version_key_upper(&prefix, a),
                None => prefix.clone(),
            };
            let mut end = prefix.clone();
            if let Some(last) = end.last_mut() {
                *last = 0x01;
            }
            let mut ids: Vec<Tuid> = Vec::new();
            for guard in store.versions.range(start..end) {
                let (k, _) = guard.into_inner().map_err(fjall_err)?;
                let id = version_key_id(&k, prefix_len)?;
                if ids.last() != Some(&id) {
                    if ids.len() == limit {
                        break;
                    }
                    ids.push(id);
                }
            }
            Ok(ids)
        })
        .await
        .map_err(join_err)?
    }

    async fn apply_index_op(&self, op: IndexOp) -> Result<(), VersoError> {
        let store = self.0.clone();
        tokio::task::spawn_blocking(move || store.apply_ops(vec![op]))
            .await
            .map_err(join_err)?
    }

    async fn apply_index_batch(&self, ops: Vec<IndexOp>) -> Result<(), VersoError> {
        let store = self.0.clone();
        tokio::task::spawn_blocking(move || store.apply_ops(ops))
            .await
            .map_err(join_err)?
    }

    async fn index_range(
        &self,
        index: &str,
        value: &str,
        after: Option<Tuid>,
        limit: usize,
    ) -> Result<Vec<IndexHit>, VersoError> {
        let store = self.0.clone();
        let prefix = index_prefix(index, value);
        let start = match after {
            Some(a) if a == Tuid::MAX => return Ok(Vec::new()),
            Some(a) => index_key(index, value, Tuid::from_raw(a.raw() + 1)),
            None => prefix.clone(),
        };
        tokio::task::spawn_blocking(move || -> Result<Vec<IndexHit>, VersoError> {
            let end = index_key_end(&prefix);
            store
                .indexes
                .range(start..end)
                .take(limit)
                .map(|g| {
                    g.into_inner().map_err(fjall_err).and_then(|(k, v)| {
                        let clustering = Tuid::from_raw(decode_ordered_i64(&k[prefix.len()..])?);
                        let cell = decode::<IndexCell>(&v)?;
                        Ok(IndexHit { clustering, entity: cell.entity })
                    })
                })
                .collect()
        })
        .await
        .map_err(join_err)?
    }

    async fn counter_range(
        &self,
        counter: &str,
        key: &str,
        after: Option<i64>,
        limit: usize,
    ) -> Result<Vec<(i64, u64)>, VersoError> {
        let store = self.0.clone();
        let prefix = counter_prefix(counter, key);
        let start = match after {
            Some(i64::MAX) => return Ok(Vec::new()),
            Some(a) => counter_key(counter, key, a + 1),
            None => prefix.clone(),
        };
        tokio::task::spawn_blocking(move || -> Result<Vec<(i64, u64)>, VersoError> {
            let end = index_key_end(&prefix);
            store
                .counters
                .range(start..end)
                .take(limit)
                .map(|g| {
                    g.into_inner().map_err(fjall_err).and_then(|(k, v)| {
                        let bucket = decode_ordered_i64(&k[prefix.len()..])?;
                        let raw: [u8; 8] = v
                            .as_ref()
                            .try_into()
                            .map_err(|_| VersoError::Storage("malformed counter value".into()))?;
                        Ok((bucket, u64::from_be_bytes(raw)))
                    })
                })
                .collect()
        })
        .await
        .map_err(join_err)?
    }

    async fn purge_expired(&self, now_ms: i64) -> Result<usize, VersoError> {
        let store = self.0.clone();
        tokio::task::spawn_blocking(move || -> Result<usize, VersoError> {
            let due: Vec<Vec<u8>> = store
                .ttl_index
                .range(..ttl_bound(now_ms).to_vec())
                .map(|g| g.into_inner().map(|(k, _)| k.to_vec()).map_err(fjall_err))
                .collect::<Result<_, _>>()?;
            if due.is_empty() {
                return Ok(0);
            }
            let mut batch = store.db.batch();
            for ttl in &due {
                let (_, target, key) = split_ttl_key(ttl)?;
                match target {
                    TtlTarget::Version => batch.remove(&store.versions, key.to_vec()),
                    TtlTarget::Index => batch.remove(&store.indexes, key.to_vec()),
                }
                batch.remove(&store.ttl_index, ttl.clone());
            }
            batch.commit().map_err(fjall_err)?;
            Ok(due.len())
        })
        .await
        .map_err(join_err)?
    }
}

/// First key after every `versions` key of entity `id`.
fn version_key_upper(table_prefix: &[u8], id: Tuid) -> Vec<u8> {
    let mut key = table_prefix.to_vec();
    key.extend_from_slice(&crate::keys::ordered_i64(id.raw()));
    key.extend_from_slice(&[0xFF; 9]);
    key
}

/// Exclusive end of a `text ++ \x00` prefix: the same bytes ending in `\x01`.
fn index_key_end(prefix: &[u8]) -> Vec<u8> {
    let mut end = prefix.to_vec();
    if let Some(last) = end.last_mut() {
        *last = 0x01;
    }
    end
}

// ---------------------------------------------------------------------------
// FjallLeases
// ---------------------------------------------------------------------------

/// `LeaseStore` backed by fjall. First-writer-wins holds for every registry
/// sharing the same `FjallStore`.
#[derive(Clone)]
pub struct FjallLeases(pub Arc<FjallStore>);

fn read_lease(store: &FjallStore, node_id: NodeId) -> Result<Option<NodeLease>, VersoError> {
    match store.leases.get(lease_key(node_id)).map_err(fjall_err)? {
        Some(b) => Ok(Some(decode::<NodeLease>(&b)?)),
        None => Ok(None),
    }
}

/// Stage `lease` as the active lease plus a new history row. Reads the
/// history length, so callers must hold `write_lock`.
fn stage_lease<'a>(store: &'a FjallStore, lease: &NodeLease) -> Result<Vec<Staged<'a>>, VersoError> {
    let encoded = encode(lease)?;
    let mut seq = 0u64;
    for guard in store.lease_history.prefix(lease_key(lease.node_id)) {
        guard.into_inner().map_err(fjall_err)?;
        seq += 1;
    }
    Ok(vec![
        Staged::Put(&store.leases, lease_key(lease.node_id).to_vec(), encoded.clone()),
        Staged::Put(
            &store.lease_identity,
            lease.identity.as_bytes().to_vec(),
            lease_key(lease.node_id).to_vec(),
        ),
        Staged::Put(
            &store.lease_history,
            lease_history_key(lease.node_id, seq),
            encoded,
        ),
    ])
}

impl LeaseStore for FjallLeases {
    async fn lease(&self, node_id: NodeId) -> Result<Option<NodeLease>, VersoError> {
        let store = self.0.clone();
        tokio::task::spawn_blocking(move || read_lease(&store, node_id))
            .await
            .map_err(join_err)?
    }

    async fn lease_for_identity(&self, identity: &str) -> Result<Option<NodeLease>, VersoError> {
        let store = self.0.clone();
        let identity = identity.to_string();
        tokio::task::spawn_blocking(move || -> Result<Option<NodeLease>, VersoError> {
            let Some(raw) = store.lease_identity.get(identity.as_bytes()).map_err(fjall_err)? else {
                return Ok(None);
            };
            let node_id = decode_lease_key(&raw)?;
            // The active lease may since have moved to another identity.
            Ok(read_lease(&store, node_id)?.filter(|l| l.identity == identity))
        })
        .await
        .map_err(join_err)?
    }

    async fn leases(&self) -> Result<Vec<NodeLease>, VersoError> {
        let store = self.0.clone();
        tokio::task::spawn_blocking(move || -> Result<Vec<NodeLease>, VersoError> {
            store
                .leases
                .iter()
                .map(|g| g.into_inner().map_err(fjall_err).and_then(|(_, v)| decode::<NodeLease>(&v)))
                .collect()
        })
        .await
        .map_err(join_err)?
    }

    async fn insert_lease_if_absent(&self, lease: NodeLease) -> Result<bool, VersoError> {
        let store = self.0.clone();
        tokio::task::spawn_blocking(move || -> Result<bool, VersoError> {
            let _guard = store.write_lock.lock();
            if store.leases.get(lease_key(lease.node_id)).map_err(fjall_err)?.is_some() {
                return Ok(false);
            }
            store.commit(stage_lease(&store, &lease)?)?;
            Ok(true)
        })
        .await
        .map_err(join_err)?
    }

    async fn refresh_lease(&self, lease: NodeLease) -> Result<(), VersoError> {
        let store = self.0.clone();
        tokio::task::spawn_blocking(move || -> Result<(), VersoError> {
            let _guard = store.write_lock.lock();
            store.commit(stage_lease(&store, &lease)?)
        })
        .await
        .map_err(join_err)?
    }

    async fn remove_lease(&self, node_id: NodeId) -> Result<Option<NodeLease>, VersoError> {
        let store = self.0.clone();
        tokio::task::spawn_blocking(move || -> Result<Option<NodeLease>, VersoError> {
            let _guard = store.write_lock.lock();
            let Some(lease) = read_lease(&store, node_id)? else {
                return Ok(None);
            };
            let mut batch = store.db.batch();
            batch.remove(&store.leases, lease_key(node_id).to_vec());
            batch.remove(&store.lease_identity, lease.identity.as_bytes().to_vec());
            batch.commit().map_err(fjall_err)?;
            Ok(Some(lease))
        })
        .await
        .map_err(join_err)?
    }

    async fn lease_history(&self, node_id: NodeId) -> Result<Vec<NodeLease>, VersoError> {
        let store = self.0.clone();
        tokio::task::spawn_blocking(move || -> Result<Vec<NodeLease>, VersoError> {
            store
                .lease_history
                .prefix(lease_key(node_id))
                .map(|g| g.into_inner().map_err(fjall_err).and_then(|(_, v)| decode::<NodeLease>(&v)))
                .collect()
        })
        .await
        .map_err(join_err)?
    }
}
