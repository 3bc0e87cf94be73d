use std::collections::HashSet;
use std::sync::Arc;

use verso_storage::{LeaseStore, NodeLease};
use verso_types::{node_id_pool, NodeId, VersoError};

use crate::clock::Clock;

/// Default number of candidates tried before `acquire` reports a conflict.
pub const DEFAULT_ACQUIRE_ATTEMPTS: usize = 8;

/// Assigns node ids to process identities through a shared `LeaseStore`.
///
/// Selection is random over the free ids and relies on the store's
/// first-writer-wins insert. Two processes racing for the same id both see
/// it free; the loser moves on to another candidate.
pub struct NodeLeaseRegistry<L: LeaseStore> {
    store: L,
    clock: Arc<dyn Clock>,
    acquire_attempts: usize,
}

impl<L: LeaseStore> NodeLeaseRegistry<L> {
    pub fn new(store: L, clock: Arc<dyn Clock>, acquire_attempts: usize) -> Self {
        NodeLeaseRegistry { store, clock, acquire_attempts: acquire_attempts.max(1) }
    }

    /// Node id for `identity`, leasing a free one if it holds none.
    ///
    /// Idempotent: an identity that already holds a lease gets the same id
    /// back with a refreshed timestamp.
    pub async fn acquire(&self, identity: &str) -> Result<NodeId, VersoError> {
        if identity.is_empty() {
            return Err(VersoError::InvalidArgument("lease identity must not be empty".into()));
        }
        let now = self.clock.now_millis();

        if let Some(mut lease) = self.store.lease_for_identity(identity).await? {
            lease.assigned_at_ms = now;
            let node_id = lease.node_id;
            self.store.refresh_lease(lease).await?;
            tracing::info!(node_id, identity, "lease refreshed");
            return Ok(node_id);
        }

        let leased: HashSet<NodeId> =
            self.store.leases().await?.into_iter().map(|l| l.node_id).collect();
        let mut free: Vec<NodeId> = node_id_pool().filter(|id| !leased.contains(id)).collect();
        if free.is_empty() {
            return Err(VersoError::PoolExhausted);
        }

        let mut conflicted = None;
        for _ in 0..self.acquire_attempts {
            if free.is_empty() {
                break;
            }
            let candidate = free.swap_remove(rand::random_range(0..free.len()));
            let lease = NodeLease { node_id: candidate, identity: identity.to_string(), assigned_at_ms: now };
            if self.store.insert_lease_if_absent(lease).await? {
                tracing::info!(node_id = candidate, identity, "lease acquired");
                return Ok(candidate);
            }
            tracing::warn!(node_id = candidate, identity, "node id leased concurrently, trying another");
            conflicted = Some(candidate);
        }
        match conflicted {
            Some(node_id) => Err(VersoError::LeaseConflict { node_id }),
            None => Err(VersoError::PoolExhausted),
        }
    }

    /// Free `node_id` for reuse. History is kept.
    pub async fn release(&self, node_id: NodeId) -> Result<Option<NodeLease>, VersoError> {
        let removed = self.store.remove_lease(node_id).await?;
        if let Some(ref lease) = removed {
            tracing::info!(node_id, identity = %lease.identity, "lease released");
        }
        Ok(removed)
    }

    /// Every assignment and refresh of `node_id`, oldest first.
    pub async fn history(&self, node_id: NodeId) -> Result<Vec<NodeLease>, VersoError> {
        self.store.lease_history(node_id).await
    }

    pub async fn lease(&self, node_id: NodeId) -> Result<Option<NodeLease>, VersoError> {
        self.store.lease(node_id).await
    }

    /// Active leases, ascending by node id.
    pub async fn leases(&self) -> Result<Vec<NodeLease>, VersoError> {
        self.store.leases().await
    }
}
