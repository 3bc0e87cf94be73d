use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use parking_lot::Mutex;

use verso_types::{is_valid_node_id, NodeId, Tuid, VersoError, MAX_SEQUENCE};

use crate::clock::{Clock, SystemClock, PAUSE};

/// Default bound on the sequence-exhaustion wait.
pub const DEFAULT_MAX_WAIT: Duration = Duration::from_millis(100);

/// Backdated milliseconds remembered before the oldest is forgotten.
const BACKDATED_WINDOW: usize = 4096;

struct Live {
    last_millis: i64,
    sequence: u16,
}

/// Issues time-ordered identifiers for one process.
///
/// One instance per process. `allocate` never returns a value less than or
/// equal to an earlier one from the same instance. Distinct processes only
/// produce distinct identifiers if they were initialized with distinct node
/// ids, which is the lease registry's job.
pub struct TuidAllocator {
    clock: Arc<dyn Clock>,
    node_id: OnceLock<NodeId>,
    live: Mutex<Live>,
    /// Next sequence per backdated millisecond.
    backdated: Mutex<BTreeMap<i64, u16>>,
    max_pauses: u64,
    waits: AtomicU64,
}

impl TuidAllocator {
    /// `max_wait` bounds how long `allocate` waits for the clock once a
    /// millisecond's 1024 sequence values are used up.
    pub fn new(clock: Arc<dyn Clock>, max_wait: Duration) -> Self {
        let max_pauses = (max_wait.as_micros() / PAUSE.as_micros()).max(1) as u64;
        TuidAllocator {
            clock,
            node_id: OnceLock::new(),
            live: Mutex::new(Live { last_millis: i64::MIN, sequence: 0 }),
            backdated: Mutex::new(BTreeMap::new()),
            max_pauses,
            waits: AtomicU64::new(0),
        }
    }

    pub fn system() -> Self {
        Self::new(Arc::new(SystemClock), DEFAULT_MAX_WAIT)
    }

    /// Assign the node id. Only the first call takes effect; the id in force
    /// is returned either way.
    pub fn initialize(&self, node_id: NodeId) -> Result<NodeId, VersoError> {
        if !is_valid_node_id(node_id) {
            return Err(VersoError::InvalidArgument(format!("node id {node_id} out of range")));
        }
        let assigned = *self.node_id.get_or_init(|| node_id);
        if assigned == node_id {
            tracing::info!(node_id, "identifier allocator initialized");
        } else {
            tracing::info!(node_id = assigned, ignored = node_id, "identifier allocator already initialized");
        }
        Ok(assigned)
    }

    pub fn node_id(&self) -> Option<NodeId> {
        self.node_id.get().copied()
    }

    fn require_node_id(&self) -> Result<NodeId, VersoError> {
        self.node_id().ok_or(VersoError::NotInitialized)
    }

    pub fn now_millis(&self) -> i64 {
        self.clock.now_millis()
    }

    /// Next identifier at the current wall-clock millisecond.
    ///
    /// A clock that steps backwards is treated as still being in the last
    /// issued millisecond. When that millisecond's sequence is used up the
    /// calling thread pauses until the clock moves on, for at most the
    /// configured wait, then fails with `ClockStalled`.
    pub fn allocate(&self) -> Result<Tuid, VersoError> {
        let node_id = self.require_node_id()?;
        let mut live = self.live.lock();
        let mut now = self.clock.now_millis();
        if now > live.last_millis {
            live.last_millis = now;
            live.sequence = 0;
        } else if live.sequence < MAX_SEQUENCE {
            live.sequence += 1;
        } else {
            let mut pauses = 0u64;
            while now <= live.last_millis {
                if pauses == self.max_pauses {
                    return Err(VersoError::ClockStalled { waited_pauses: pauses });
                }
                self.clock.pause();
                pauses += 1;
                now = self.clock.now_millis();
            }
            self.waits.fetch_add(1, Ordering::Relaxed);
            tracing::trace!(millis = now, pauses, "sequence exhausted, moved to next millisecond");
            live.last_millis = now;
            live.sequence = 0;
        }
        Ok(Tuid::pack(live.last_millis, live.sequence, node_id))
    }

    /// Identifier at an explicit millisecond, for historical imports.
    ///
    /// Backdated identifiers do not share state with `allocate` and are not
    /// ordered relative to it. A millisecond that has handed out all 1024
    /// sequence values yields `SequenceExhausted`; there is no clock to wait
    /// for.
    pub fn allocate_at(&self, millis: i64) -> Result<Tuid, VersoError> {
        let node_id = self.require_node_id()?;
        let mut backdated = self.backdated.lock();
        if backdated.len() >= BACKDATED_WINDOW && !backdated.contains_key(&millis) {
            backdated.pop_first();
        }
        let next = backdated.entry(millis).or_insert(0);
        if *next > MAX_SEQUENCE {
            return Err(VersoError::SequenceExhausted { millis });
        }
        let sequence = *next;
        *next += 1;
        Ok(Tuid::pack(millis, sequence, node_id))
    }

    /// Lowest identifier at `millis`. Consumes nothing.
    pub fn range_floor(&self, millis: i64) -> Tuid {
        Tuid::floor(millis)
    }

    /// Highest identifier at `millis`. Consumes nothing.
    pub fn range_ceiling(&self, millis: i64) -> Tuid {
        Tuid::ceiling(millis)
    }

    /// `range_floor` relative to now; `offset_ms` is usually negative.
    pub fn floor_from_now(&self, offset_ms: i64) -> Tuid {
        Tuid::floor(self.clock.now_millis().saturating_add(offset_ms))
    }

    pub fn ceiling_from_now(&self, offset_ms: i64) -> Tuid {
        Tuid::ceiling(self.clock.now_millis().saturating_add(offset_ms))
    }

    /// How many times `allocate` has had to wait for a new millisecond.
    pub fn exhaustion_waits(&self) -> u64 {
        self.waits.load(Ordering::Relaxed)
    }
}
