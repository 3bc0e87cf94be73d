use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;

use verso_storage::{CounterBump, IndexRow};
use verso_types::Tuid;

/// Which identifier clusters an index row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IndexScope {
    /// Clustered by the entity id. One row per entity; moved by updates.
    Entity,
    /// Clustered by the update id. One row per version, never retracted by
    /// later updates: a log of writes (e.g. "versions written on day D").
    Version,
}

/// One indexable attribute value of an entity version.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IndexAttr {
    pub index: String,
    pub value: String,
    pub scope: IndexScope,
    /// At most one live entity may hold `value` in `index`.
    pub unique: bool,
}

impl IndexAttr {
    pub fn entity(index: impl Into<String>, value: impl Into<String>) -> Self {
        IndexAttr { index: index.into(), value: value.into(), scope: IndexScope::Entity, unique: false }
    }

    pub fn version(index: impl Into<String>, value: impl Into<String>) -> Self {
        IndexAttr { index: index.into(), value: value.into(), scope: IndexScope::Version, unique: false }
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    /// The row this attribute produces for version `(id, update_id)`.
    pub fn row(&self, id: Tuid, update_id: Tuid) -> IndexRow {
        let clustering = match self.scope {
            IndexScope::Entity => id,
            IndexScope::Version => update_id,
        };
        IndexRow { index: self.index.clone(), value: self.value.clone(), clustering, entity: id }
    }

    pub fn matches(&self, index: &str, value: &str) -> bool {
        self.index == index && self.value == value
    }
}

/// Day bucket of an identifier: `yyyymmdd` in UTC.
pub fn day_bucket(id: Tuid) -> String {
    id.year_month_day().to_string()
}

/// A record type kept as an append-only chain of versions.
///
/// `id` is the identifier of the first version and `update_id` that of the
/// version at hand; both are assigned by the store. `index_attrs` and
/// `counters` are evaluated after both are set.
pub trait Entity: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    /// Primary table name.
    const TABLE: &'static str;

    /// Lifetime of version and index rows, if they expire.
    const TTL: Option<Duration> = None;

    fn id(&self) -> Option<Tuid>;
    fn set_id(&mut self, id: Tuid);
    fn update_id(&self) -> Option<Tuid>;
    fn set_update_id(&mut self, update_id: Tuid);

    fn index_attrs(&self) -> Vec<IndexAttr> {
        Vec::new()
    }

    /// Counter increments issued when the entity is created.
    fn counters(&self, _id: Tuid) -> Vec<CounterBump> {
        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scope_picks_clustering() {
        let id = Tuid::pack(1_000, 0, 1);
        let update_id = Tuid::pack(2_000, 0, 1);
        let by_owner = IndexAttr::entity("by_owner", "u1").row(id, update_id);
        let by_day = IndexAttr::version("by_day", "19700101").row(id, update_id);
        assert_eq!(by_owner.clustering, id);
        assert_eq!(by_day.clustering, update_id);
        assert_eq!(by_day.entity, id);
    }

    #[test]
    fn day_bucket_is_utc_date() {
        assert_eq!(day_bucket(Tuid::floor(1_417_880_305_468)), "20141206");
    }
}
