//! Test entities and a fault-injecting table store.

use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use verso_storage::{CounterBump, IndexHit, IndexOp, MemTables, TableStore, VersionRow};
use verso_types::{Tuid, VersoError};

use crate::entity::{day_bucket, Entity, IndexAttr};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub id: Option<Tuid>,
    pub update_id: Option<Tuid>,
    pub email: String,
    pub state: String,
}

impl Account {
    pub fn new(email: &str, state: &str) -> Self {
        Account { id: None, update_id: None, email: email.into(), state: state.into() }
    }
}

impl Entity for Account {
    const TABLE: &'static str = "accounts";

    fn id(&self) -> Option<Tuid> {
        self.id
    }
    fn set_id(&mut self, id: Tuid) {
        self.id = Some(id);
    }
    fn update_id(&self) -> Option<Tuid> {
        self.update_id
    }
    fn set_update_id(&mut self, update_id: Tuid) {
        self.update_id = Some(update_id);
    }

    fn index_attrs(&self) -> Vec<IndexAttr> {
        let mut attrs = vec![
            IndexAttr::entity("accounts_by_email", self.email.to_lowercase()).unique(),
            IndexAttr::entity("accounts_by_state", self.state.clone()),
        ];
        if let Some(update_id) = self.update_id {
            attrs.push(IndexAttr::version("accounts_by_day", day_bucket(update_id)));
        }
        attrs
    }

    fn counters(&self, id: Tuid) -> Vec<CounterBump> {
        vec![
            CounterBump {
                counter: "accounts_per_day".into(),
                key: "all".into(),
                bucket: id.year_month_day() as i64,
                delta: 1,
            },
            CounterBump {
                counter: "accounts_per_day_by_state".into(),
                key: self.state.clone(),
                bucket: id.year_month_day() as i64,
                delta: 1,
            },
        ]
    }
}

/// Short-lived entity with a row TTL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub id: Option<Tuid>,
    pub update_id: Option<Tuid>,
    pub kind: String,
}

impl Entity for Event {
    const TABLE: &'static str = "events";
    const TTL: Option<Duration> = Some(Duration::from_secs(3_600));

    fn id(&self) -> Option<Tuid> {
        self.id
    }
    fn set_id(&mut self, id: Tuid) {
        self.id = Some(id);
    }
    fn update_id(&self) -> Option<Tuid> {
        self.update_id
    }
    fn set_update_id(&mut self, update_id: Tuid) {
        self.update_id = Some(update_id);
    }

    fn index_attrs(&self) -> Vec<IndexAttr> {
        let mut attrs = vec![IndexAttr::entity("events_by_kind", self.kind.clone())];
        if let Some(update_id) = self.update_id {
            attrs.push(IndexAttr::version("events_by_day", day_bucket(update_id)));
        }
        attrs
    }
}

/// Where `FaultyTables` fails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fault {
    None,
    /// `put_version` and `delete_versions`.
    Primary,
    /// Every op (single or batched) touching this index or counter.
    Index(String),
}

/// `MemTables` that fails one position of every write set.
pub struct FaultyTables {
    inner: MemTables,
    fault: Mutex<Fault>,
}

impl FaultyTables {
    pub fn new(inner: MemTables, fault: Fault) -> Self {
        FaultyTables { inner, fault: Mutex::new(fault) }
    }

    pub fn inner(&self) -> &MemTables {
        &self.inner
    }

    pub fn set_fault(&self, fault: Fault) {
        *self.fault.lock() = fault;
    }

    fn check_primary(&self) -> Result<(), VersoError> {
        match *self.fault.lock() {
            Fault::Primary => Err(VersoError::Storage("injected primary failure".into())),
            _ => Ok(()),
        }
    }

    fn check_op(&self, op: &IndexOp) -> Result<(), VersoError> {
        match &*self.fault.lock() {
            Fault::Index(target) if target == op.target() => {
                Err(VersoError::Storage(format!("injected failure on {target}")))
            }
            _ => Ok(()),
        }
    }
}

impl TableStore for FaultyTables {
    async fn put_version(&self, table: &str, row: VersionRow) -> Result<(), VersoError> {
        self.check_primary()?;
        self.inner.put_version(table, row).await
    }

    async fn get_version(&self, table: &str, id: Tuid, update_id: Tuid) -> Result<Option<VersionRow>, VersoError> {
        self.inner.get_version(table, id, update_id).await
    }

    async fn latest_version(&self, table: &str, id: Tuid) -> Result<Option<VersionRow>, VersoError> {
        self.inner.latest_version(table, id).await
    }

    async fn versions(&self, table: &str, id: Tuid) -> Result<Vec<VersionRow>, VersoError> {
        self.inner.versions(table, id).await
    }

    async fn delete_versions(&self, table: &str, id: Tuid) -> Result<usize, VersoError> {
        self.check_primary()?;
        self.inner.delete_versions(table, id).await
    }

    async fn entity_ids(&self, table: &str, after: Option<Tuid>, limit: usize) -> Result<Vec<Tuid>, VersoError> {
        self.inner.entity_ids(table, after, limit).await
    }

    async fn apply_index_op(&self, op: IndexOp) -> Result<(), VersoError> {
        self.check_op(&op)?;
        self.inner.apply_index_op(op).await
    }

    async fn apply_index_batch(&self, ops: Vec<IndexOp>) -> Result<(), VersoError> {
        for op in &ops {
            self.check_op(op)?;
        }
        self.inner.apply_index_batch(ops).await
    }

    async fn index_range(
        &self,
        index: &str,
        value: &str,
        after: Option<Tuid>,
        limit: usize,
    ) -> Result<Vec<IndexHit>, VersoError> {
        self.inner.index_range(index, value, after, limit).await
    }

    async fn counter_range(
        &self,
        counter: &str,
        key: &str,
        after: Option<i64>,
        limit: usize,
    ) -> Result<Vec<(i64, u64)>, VersoError> {
        self.inner.counter_range(counter, key, after, limit).await
    }

    async fn purge_expired(&self, now_ms: i64) -> Result<usize, VersoError> {
        self.inner.purge_expired(now_ms).await
    }
}
