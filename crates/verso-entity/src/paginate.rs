use std::future::Future;
use std::sync::Arc;

use futures_util::stream::{self, Stream};

use verso_storage::{IndexHit, TableStore};
use verso_types::{Tuid, VersoError};

/// An ordered, range-scannable source of rows.
///
/// `fetch` returns rows with a cursor strictly greater than `after`,
/// ascending, at most `limit`.
pub trait PageSource: Send + Sync + 'static {
    type Cursor: Copy + Send + Sync + 'static;
    type Item: Send + 'static;

    fn fetch(&self, after: Option<Self::Cursor>, limit: usize)
        -> impl Future<Output = Result<Vec<Self::Item>, VersoError>> + Send;

    fn cursor(item: &Self::Item) -> Self::Cursor;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page<T, C> {
    pub items: Vec<T>,
    /// Cursor for the following page; `None` once a short page shows the
    /// source is exhausted.
    pub next: Option<C>,
}

/// Stateless cursor pagination: the last-seen cursor is the exclusive lower
/// bound of the next page.
///
/// Pages never overlap as long as nothing at or below an already-returned
/// cursor is inserted or removed mid-walk. Rows written later with larger
/// identifiers show up on a later page.
pub struct CursorPaginator<P: PageSource> {
    source: P,
    limit: usize,
}

impl<P: PageSource> CursorPaginator<P> {
    pub fn new(source: P, limit: usize) -> Result<Self, VersoError> {
        if limit == 0 {
            return Err(VersoError::InvalidArgument("page limit must be positive".into()));
        }
        Ok(CursorPaginator { source, limit })
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub async fn page(&self, after: Option<P::Cursor>) -> Result<Page<P::Item, P::Cursor>, VersoError> {
        let items = self.source.fetch(after, self.limit).await?;
        let next = if items.len() == self.limit { items.last().map(P::cursor) } else { None };
        Ok(Page { items, next })
    }

    /// Every page from `after` on, until a short page.
    pub fn into_stream(self, after: Option<P::Cursor>) -> impl Stream<Item = Result<Vec<P::Item>, VersoError>> {
        stream::unfold(Some((self, after)), |state| async move {
            let (pager, after) = state?;
            match pager.page(after).await {
                Ok(page) if page.items.is_empty() => None,
                Ok(page) => {
                    let rest = page.next.map(|c| (pager, Some(c)));
                    Some((Ok(page.items), rest))
                }
                Err(e) => Some((Err(e), None)),
            }
        })
    }
}

/// Rows of one `(index, value)` pair, cursored by clustering id.
pub struct IndexSource<S: TableStore> {
    tables: Arc<S>,
    index: String,
    value: String,
}

impl<S: TableStore> IndexSource<S> {
    pub fn new(tables: Arc<S>, index: impl Into<String>, value: impl Into<String>) -> Self {
        IndexSource { tables, index: index.into(), value: value.into() }
    }
}

impl<S: TableStore> PageSource for IndexSource<S> {
    type Cursor = Tuid;
    type Item = IndexHit;

    async fn fetch(&self, after: Option<Tuid>, limit: usize) -> Result<Vec<IndexHit>, VersoError> {
        self.tables.index_range(&self.index, &self.value, after, limit).await
    }

    fn cursor(item: &IndexHit) -> Tuid {
        item.clustering
    }
}

/// `(bucket, count)` rows of one counting index key, cursored by bucket.
pub struct CounterSource<S: TableStore> {
    tables: Arc<S>,
    counter: String,
    key: String,
}

impl<S: TableStore> CounterSource<S> {
    pub fn new(tables: Arc<S>, counter: impl Into<String>, key: impl Into<String>) -> Self {
        CounterSource { tables, counter: counter.into(), key: key.into() }
    }
}

impl<S: TableStore> PageSource for CounterSource<S> {
    type Cursor = i64;
    type Item = (i64, u64);

    async fn fetch(&self, after: Option<i64>, limit: usize) -> Result<Vec<(i64, u64)>, VersoError> {
        self.tables.counter_range(&self.counter, &self.key, after, limit).await
    }

    fn cursor(item: &(i64, u64)) -> i64 {
        item.0
    }
}

/// Distinct entity ids of one primary table.
pub struct EntityIdSource<S: TableStore> {
    tables: Arc<S>,
    table: String,
}

impl<S: TableStore> EntityIdSource<S> {
    pub fn new(tables: Arc<S>, table: impl Into<String>) -> Self {
        EntityIdSource { tables, table: table.into() }
    }
}

impl<S: TableStore> PageSource for EntityIdSource<S> {
    type Cursor = Tuid;
    type Item = Tuid;

    async fn fetch(&self, after: Option<Tuid>, limit: usize) -> Result<Vec<Tuid>, VersoError> {
        self.tables.entity_ids(&self.table, after, limit).await
    }

    fn cursor(item: &Tuid) -> Tuid {
        *item
    }
}
