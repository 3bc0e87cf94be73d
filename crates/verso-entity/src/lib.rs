pub mod entity;
pub mod index;
pub mod paginate;
pub mod store;

#[cfg(test)]
mod fixtures;

pub use entity::{day_bucket, Entity, IndexAttr, IndexScope};
pub use index::{FanOut, FanOutFailure, FanOutMode, FanOutReport, PrimaryWrite, WriteKind, WriteSet};
pub use paginate::{CounterSource, CursorPaginator, EntityIdSource, IndexSource, Page, PageSource};
pub use store::{IndexPage, VersionedStore, Written};
