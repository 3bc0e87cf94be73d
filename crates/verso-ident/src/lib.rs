pub mod allocator;
pub mod clock;
pub mod registry;

pub use allocator::{TuidAllocator, DEFAULT_MAX_WAIT};
pub use clock::{Clock, ManualClock, SystemClock};
pub use registry::{NodeLeaseRegistry, DEFAULT_ACQUIRE_ATTEMPTS};

use verso_storage::LeaseStore;
use verso_types::{NodeId, VersoError};

/// Startup step: lease a node id for `identity` and hand it to the
/// allocator. Any failure here must stop the process.
pub async fn bootstrap<L: LeaseStore>(
    registry: &NodeLeaseRegistry<L>,
    allocator: &TuidAllocator,
    identity: &str,
) -> Result<NodeId, VersoError> {
    let node_id = registry.acquire(identity).await?;
    allocator.initialize(node_id)
}
