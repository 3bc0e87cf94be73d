use std::cmp::Ordering;
use std::collections::HashSet;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{FuturesUnordered, StreamExt};

use verso_ident::TuidAllocator;
use verso_storage::{IndexOp, IndexRow, TableStore, VersionRow};
use verso_types::{Tuid, VersoError};

use crate::entity::{day_bucket, Entity, IndexAttr, IndexScope};
use crate::index::{dispatch, FanOut, FanOutMode, PrimaryWrite, WriteKind, WriteSet};
use crate::paginate::{CounterSource, CursorPaginator, EntityIdSource, IndexSource};

const DAY_MS: i64 = 86_400_000;

/// Index rows read per page while looking for the live holder of a unique
/// value.
const UNIQUE_PAGE: usize = 8;

fn encode<E: Entity>(entity: &E) -> Result<Vec<u8>, VersoError> {
    bincode::serde::encode_to_vec(entity, bincode::config::standard())
        .map_err(|e| VersoError::Storage(e.to_string()))
}

fn decode<E: Entity>(row: &VersionRow) -> Result<E, VersoError> {
    bincode::serde::decode_from_slice(&row.payload, bincode::config::standard())
        .map(|(v, _)| v)
        .map_err(|e| VersoError::Storage(e.to_string()))
}

/// Result of a write: the stored entity and its in-flight index fan-out.
pub struct Written<T> {
    pub value: T,
    pub fan_out: FanOut,
}

/// One page of an index-driven read.
#[derive(Debug, Clone)]
pub struct IndexPage<E> {
    /// Entities whose primary record confirmed the index row.
    pub items: Vec<E>,
    /// Entity ids the index pointed at whose primary record disagreed.
    pub stale: Vec<Tuid>,
    /// Cursor for the following page, `None` when the index is exhausted.
    pub next: Option<Tuid>,
}

/// Append-only version chains of one entity type plus their secondary and
/// counting indexes.
///
/// Primary writes are awaited. Index writes run in the background and their
/// failures never fail the call; index-driven reads re-check every hit
/// against the primary table.
pub struct VersionedStore<E: Entity, S: TableStore> {
    tables: Arc<S>,
    allocator: Arc<TuidAllocator>,
    mode: FanOutMode,
    _entity: PhantomData<fn() -> E>,
}

impl<E: Entity, S: TableStore> Clone for VersionedStore<E, S> {
    fn clone(&self) -> Self {
        VersionedStore {
            tables: self.tables.clone(),
            allocator: self.allocator.clone(),
            mode: self.mode,
            _entity: PhantomData,
        }
    }
}

impl<E: Entity, S: TableStore> VersionedStore<E, S> {
    pub fn new(tables: Arc<S>, allocator: Arc<TuidAllocator>, mode: FanOutMode) -> Self {
        VersionedStore { tables, allocator, mode, _entity: PhantomData }
    }

    pub fn tables(&self) -> &Arc<S> {
        &self.tables
    }

    fn expires_at(&self) -> Option<i64> {
        E::TTL.map(|ttl| self.allocator.now_millis().saturating_add(ttl.as_millis() as i64))
    }

    fn version_row(&self, entity: &E, id: Tuid, update_id: Tuid) -> Result<VersionRow, VersoError> {
        Ok(VersionRow { id, update_id, payload: encode(entity)?, expires_at_ms: self.expires_at() })
    }

    async fn execute(&self, set: WriteSet) -> Result<FanOut, VersoError> {
        match &set.primary {
            PrimaryWrite::Put(row) => self.tables.put_version(E::TABLE, row.clone()).await?,
            PrimaryWrite::DeleteAll => {
                self.tables.delete_versions(E::TABLE, set.id).await?;
            }
        }
        Ok(dispatch(&self.tables, set, self.mode))
    }

    /// First live entity other than `except` whose current version carries
    /// `(index, value)`. Pages through the whole index, so any number of
    /// stale rows ahead of the holder are skipped.
    async fn live_holder(&self, index: &str, value: &str, except: Option<Tuid>) -> Result<Option<E>, VersoError> {
        let pager = CursorPaginator::new(IndexSource::new(self.tables.clone(), index, value), UNIQUE_PAGE)?;
        let mut after = None;
        loop {
            let page = pager.page(after).await?;
            for hit in page.items.into_iter().filter(|h| Some(h.entity) != except) {
                if let Some(entity) = self.confirms(hit.entity, index, value).await? {
                    return Ok(Some(entity));
                }
            }
            match page.next {
                Some(next) => after = Some(next),
                None => return Ok(None),
            }
        }
    }

    /// Reject `attrs` if a unique value is held by another live entity.
    async fn check_unique(&self, id: Tuid, attrs: &[IndexAttr]) -> Result<(), VersoError> {
        for attr in attrs.iter().filter(|a| a.unique) {
            if self.live_holder(&attr.index, &attr.value, Some(id)).await?.is_some() {
                return Err(VersoError::UniqueViolation { index: attr.index.clone(), value: attr.value.clone() });
            }
        }
        Ok(())
    }

    /// Current version of `id` if it still carries `(index, value)`.
    async fn confirms(&self, id: Tuid, index: &str, value: &str) -> Result<Option<E>, VersoError> {
        Ok(self
            .current(id)
            .await?
            .filter(|e| e.index_attrs().iter().any(|a| a.matches(index, value))))
    }

    /// Store the first version. The id is allocated unless already set; the
    /// update id equals the id.
    ///
    /// A supplied id that already has versions is rejected with
    /// `AlreadyExists`; further versions go through `update`.
    pub async fn create(&self, mut entity: E) -> Result<Written<E>, VersoError> {
        let id = match entity.id() {
            Some(id) => {
                if self.tables.latest_version(E::TABLE, id).await?.is_some() {
                    return Err(VersoError::AlreadyExists { table: E::TABLE.to_string(), id });
                }
                id
            }
            None => self.allocator.allocate()?,
        };
        entity.set_id(id);
        entity.set_update_id(id);
        let attrs = entity.index_attrs();
        self.check_unique(id, &attrs).await?;

        let expires_at_ms = self.expires_at();
        let mut set = WriteSet::new(id, WriteKind::Create, PrimaryWrite::Put(self.version_row(&entity, id, id)?));
        set.inserts = attrs
            .iter()
            .map(|a| IndexOp::Insert { row: a.row(id, id), expires_at_ms })
            .collect();
        set.counters = entity.counters(id).into_iter().map(IndexOp::Increment).collect();

        let fan_out = self.execute(set).await?;
        tracing::debug!(table = E::TABLE, %id, "entity created");
        Ok(Written { value: entity, fan_out })
    }

    /// Append a new version under a fresh update id.
    ///
    /// Entity-scoped index rows are diffed against the previous current
    /// version: values that appear are inserted, values that no longer apply
    /// are retracted. Version-scoped rows are always inserted.
    pub async fn update(&self, mut entity: E) -> Result<Written<E>, VersoError> {
        let id = entity.id().ok_or_else(|| VersoError::MissingIdentifier { table: E::TABLE.to_string() })?;
        let previous = self.current(id).await?;
        let update_id = self.allocator.allocate()?;
        entity.set_update_id(update_id);
        let attrs = entity.index_attrs();
        self.check_unique(id, &attrs).await?;

        let old: Vec<IndexRow> = previous
            .iter()
            .flat_map(|p| {
                let prev_update = p.update_id().unwrap_or(id);
                p.index_attrs()
                    .into_iter()
                    .filter(|a| a.scope == IndexScope::Entity)
                    .map(move |a| a.row(id, prev_update))
            })
            .collect();
        let new: Vec<(IndexRow, IndexScope)> = attrs.iter().map(|a| (a.row(id, update_id), a.scope)).collect();
        let new_entity_rows: HashSet<&IndexRow> =
            new.iter().filter(|(_, s)| *s == IndexScope::Entity).map(|(r, _)| r).collect();
        let old_rows: HashSet<&IndexRow> = old.iter().collect();

        let expires_at_ms = self.expires_at();
        let mut set = WriteSet::new(id, WriteKind::Update, PrimaryWrite::Put(self.version_row(&entity, id, update_id)?));
        set.inserts = new
            .iter()
            .filter(|(row, scope)| *scope == IndexScope::Version || !old_rows.contains(row))
            .map(|(row, _)| IndexOp::Insert { row: row.clone(), expires_at_ms })
            .collect();
        set.retracts = old
            .iter()
            .filter(|row| !new_entity_rows.contains(row))
            .map(|row| IndexOp::Retract(row.clone()))
            .collect();

        let fan_out = self.execute(set).await?;
        tracing::debug!(table = E::TABLE, %id, %update_id, "entity updated");
        Ok(Written { value: entity, fan_out })
    }

    /// The version with the greatest update id, read fresh every time.
    pub async fn current(&self, id: Tuid) -> Result<Option<E>, VersoError> {
        match self.tables.latest_version(E::TABLE, id).await? {
            Some(row) => Ok(Some(decode(&row)?)),
            None => Ok(None),
        }
    }

    pub async fn version(&self, id: Tuid, update_id: Tuid) -> Result<Option<E>, VersoError> {
        match self.tables.get_version(E::TABLE, id, update_id).await? {
            Some(row) => Ok(Some(decode(&row)?)),
            None => Ok(None),
        }
    }

    /// Every version of `id`, oldest first.
    pub async fn history(&self, id: Tuid) -> Result<Vec<E>, VersoError> {
        self.tables
            .versions(E::TABLE, id)
            .await?
            .iter()
            .map(decode::<E>)
            .collect()
    }

    /// Remove every version of `id`, then retract the index rows of the
    /// current version. Rows produced only by superseded versions are left
    /// in place. Counters are never decremented.
    ///
    /// The returned value is the version that was current, if any.
    pub async fn delete(&self, id: Tuid) -> Result<Written<Option<E>>, VersoError> {
        let current = self.current(id).await?;
        let mut set = WriteSet::new(id, WriteKind::Delete, PrimaryWrite::DeleteAll);
        if let Some(ref entity) = current {
            let update_id = entity.update_id().unwrap_or(id);
            set.retracts = entity
                .index_attrs()
                .iter()
                .map(|a| IndexOp::Retract(a.row(id, update_id)))
                .collect();
        }
        let fan_out = self.execute(set).await?;
        tracing::debug!(table = E::TABLE, %id, found = current.is_some(), "entity deleted");
        Ok(Written { value: current, fan_out })
    }

    /// Current versions of `ids`, read concurrently, returned in `order`.
    /// Missing ids are skipped.
    pub async fn current_many<F>(&self, ids: &[Tuid], order: F) -> Result<Vec<E>, VersoError>
    where
        F: FnMut(&E, &E) -> Ordering,
    {
        let mut reads: FuturesUnordered<_> = ids.iter().map(|id| self.current(*id)).collect();
        let mut found = Vec::with_capacity(ids.len());
        while let Some(res) = reads.next().await {
            if let Some(entity) = res? {
                found.push(entity);
            }
        }
        found.sort_by(order);
        Ok(found)
    }

    /// Distinct entity ids, ascending, strictly after `after`.
    pub async fn ids(&self, after: Option<Tuid>, limit: usize) -> Result<Vec<Tuid>, VersoError> {
        let pager = CursorPaginator::new(EntityIdSource::new(self.tables.clone(), E::TABLE), limit)?;
        Ok(pager.page(after).await?.items)
    }

    /// Current versions of the first `limit` entities after `after`, by id.
    pub async fn list(&self, after: Option<Tuid>, limit: usize) -> Result<Vec<E>, VersoError> {
        let ids = self.ids(after, limit).await?;
        self.current_many(&ids, |a, b| a.id().cmp(&b.id())).await
    }

    /// Entities whose current version carries `(index, value)`, in
    /// clustering order. Hits the primary table contradicts are reported in
    /// `stale` and skipped.
    pub async fn lookup(
        &self,
        index: &str,
        value: &str,
        after: Option<Tuid>,
        limit: usize,
    ) -> Result<IndexPage<E>, VersoError> {
        let pager = CursorPaginator::new(IndexSource::new(self.tables.clone(), index, value), limit)?;
        let page = pager.page(after).await?;
        let mut out = IndexPage { items: Vec::new(), stale: Vec::new(), next: page.next };
        for hit in page.items {
            match self.confirms(hit.entity, index, value).await? {
                Some(entity) => out.items.push(entity),
                None => {
                    tracing::debug!(index, value, id = %hit.entity, "stale index row");
                    out.stale.push(hit.entity);
                }
            }
        }
        Ok(out)
    }

    /// The live entity holding a unique value, if any.
    pub async fn lookup_unique(&self, index: &str, value: &str) -> Result<Option<E>, VersoError> {
        self.live_holder(index, value, None).await
    }

    /// Versions recorded in a version-scoped index, in update-id order. Hits
    /// whose version row is gone are reported in `stale`.
    pub async fn lookup_versions(
        &self,
        index: &str,
        value: &str,
        after: Option<Tuid>,
        limit: usize,
    ) -> Result<IndexPage<E>, VersoError> {
        let pager = CursorPaginator::new(IndexSource::new(self.tables.clone(), index, value), limit)?;
        let page = pager.page(after).await?;
        let mut out = IndexPage { items: Vec::new(), stale: Vec::new(), next: page.next };
        for hit in page.items {
            match self.version(hit.entity, hit.clustering).await? {
                Some(entity) => out.items.push(entity),
                None => {
                    tracing::debug!(index, value, id = %hit.entity, update_id = %hit.clustering, "stale index row");
                    out.stale.push(hit.entity);
                }
            }
        }
        Ok(out)
    }

    /// `(bucket, count)` pairs of a counting index, buckets after `after`.
    pub async fn counts(
        &self,
        counter: &str,
        key: &str,
        after: Option<i64>,
        limit: usize,
    ) -> Result<Vec<(i64, u64)>, VersoError> {
        let pager = CursorPaginator::new(CounterSource::new(self.tables.clone(), counter, key), limit)?;
        Ok(pager.page(after).await?.items)
    }

    /// Versions written within the last `window`, oldest first, read from a
    /// day-bucketed version-scoped index.
    ///
    /// The walk starts just below `range_floor(now - window)` and crosses as
    /// many day partitions as the window spans.
    pub async fn recent(&self, day_index: &str, window: Duration, limit: usize) -> Result<Vec<E>, VersoError> {
        if limit == 0 {
            return Err(VersoError::InvalidArgument("page limit must be positive".into()));
        }
        let now = self.allocator.now_millis();
        let floor = self.allocator.range_floor(now.saturating_sub(window.as_millis() as i64));
        let mut after = Some(floor.predecessor());
        let mut day_start = floor.millis() - floor.millis().rem_euclid(DAY_MS);
        let mut out = Vec::new();

        while day_start <= now {
            let bucket = day_bucket(Tuid::floor(day_start));
            loop {
                let page = self.lookup_versions(day_index, &bucket, after, limit - out.len()).await?;
                out.extend(page.items);
                if out.len() == limit {
                    return Ok(out);
                }
                match page.next {
                    Some(next) => after = Some(next),
                    None => break,
                }
            }
            after = None;
            day_start += DAY_MS;
        }
        Ok(out)
    }
}
