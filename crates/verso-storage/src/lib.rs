pub mod fjall;
pub mod keys;
pub mod mem;
pub mod traits;
pub mod ttl;
pub mod types;

pub use fjall::{FjallLeases, FjallStore, FjallTables};
pub use mem::{MemLeases, MemTables};
pub use traits::{LeaseStore, TableStore};
pub use ttl::{TtlSweeper, DEFAULT_SWEEP_INTERVAL};
pub use types::{CounterBump, IndexHit, IndexOp, IndexRow, NodeLease, VersionRow};
