//! Document store adapters.
//!
//! Everything that touches persistent state goes through [`DocumentStore`].
//! The service ships two implementations: [`PgStore`] keeps documents in
//! Postgres `jsonb` tables, [`MemoryStore`] keeps them in process ("fake"
//! mode). [`Backend`] picks one at start-up.

use crate::Document;
use crate::error::Result;
use crate::matcher::{Direction, Projection};
use crate::write_concern::WriteConcern;
use serde_json::{Value, json};
use std::future::Future;

pub mod memory;
pub mod postgres;

pub use memory::{MemoryCursor, MemoryStore};
pub use postgres::{PgCursor, PgStore};

/// Batch size used when a whole result set is drained in one go.
const DRAIN_CHUNK: usize = 256;

/// A query as opened against a collection. Everything is applied at open time.
#[derive(Debug, Clone, Default)]
pub struct Query {
    pub matcher: Document,
    pub projection: Option<Projection>,
    pub sort: Vec<(String, Direction)>,
    pub skip: u64,
    pub limit: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpdateAck {
    pub matched: u64,
    pub upserted: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CollectionStats {
    pub server_used: String,
    pub ns: String,
    pub count: u64,
    pub size: u64,
    pub storage_size: u64,
    pub nindexes: u32,
}

impl CollectionStats {
    pub fn to_document(&self) -> Document {
        let avg = if self.count > 0 { self.size / self.count } else { 0 };
        let v = json!({
            "serverUsed": self.server_used,
            "ns": self.ns,
            "count": self.count,
            "size": self.size,
            "avgObjSize": avg,
            "storageSize": self.storage_size,
            "nindexes": self.nindexes,
            "ok": 1.0,
        });
        match v {
            Value::Object(m) => m,
            _ => Document::new(),
        }
    }
}

/// Server-side iteration over a query's results.
pub trait StoreCursor: Send + 'static {
    /// Up to `n` further documents; fewer than `n` means the cursor is drained.
    fn fetch(&mut self, n: usize) -> impl Future<Output = Result<Vec<Document>>> + Send;

    /// Release whatever the cursor holds in the store.
    fn close(self) -> impl Future<Output = ()> + Send;
}

pub trait DocumentStore: Send + Sync + 'static {
    type Cursor: StoreCursor;

    /// Insert a document that already carries `_id`; returns that id.
    fn insert(&self, collection: &str, doc: Document, wc: WriteConcern) -> impl Future<Output = Result<Value>> + Send;

    /// Replace the document with `_id == id`, inserting it when absent.
    fn update_by_id(
        &self,
        collection: &str,
        id: &Value,
        doc: Document,
        wc: WriteConcern,
    ) -> impl Future<Output = Result<UpdateAck>> + Send;

    fn open_cursor(&self, collection: &str, query: &Query) -> impl Future<Output = Result<Self::Cursor>> + Send;

    /// Run a query to completion.
    fn find(&self, collection: &str, query: &Query) -> impl Future<Output = Result<Vec<Document>>> + Send {
        async move {
            let mut cursor = self.open_cursor(collection, query).await?;
            let mut out = Vec::new();
            loop {
                let batch = match cursor.fetch(DRAIN_CHUNK).await {
                    Ok(b) => b,
                    Err(e) => {
                        cursor.close().await;
                        return Err(e);
                    }
                };
                let drained = batch.len() < DRAIN_CHUNK;
                out.extend(batch);
                if drained {
                    break;
                }
            }
            cursor.close().await;
            Ok(out)
        }
    }

    fn remove(&self, collection: &str, matcher: &Document, wc: WriteConcern) -> impl Future<Output = Result<u64>> + Send;

    fn count(&self, collection: &str, matcher: &Document) -> impl Future<Output = Result<u64>> + Send;

    fn list_collections(&self) -> impl Future<Output = Result<Vec<String>>> + Send;

    fn drop_collection(&self, collection: &str) -> impl Future<Output = Result<()>> + Send;

    fn stats(&self, collection: &str) -> impl Future<Output = Result<CollectionStats>> + Send;

    fn ping(&self) -> impl Future<Output = Result<()>> + Send;
}

/// The store selected by configuration.
pub enum Backend {
    Memory(MemoryStore),
    Postgres(PgStore),
}

pub enum BackendCursor {
    Memory(MemoryCursor),
    Postgres(PgCursor),
}

impl Backend {
    pub fn kind(&self) -> &'static str {
        match self {
            Backend::Memory(_) => "memory",
            Backend::Postgres(_) => "postgres",
        }
    }
}

impl StoreCursor for BackendCursor {
    async fn fetch(&mut self, n: usize) -> Result<Vec<Document>> {
        match self {
            BackendCursor::Memory(c) => c.fetch(n).await,
            BackendCursor::Postgres(c) => c.fetch(n).await,
        }
    }

    async fn close(self) {
        match self {
            BackendCursor::Memory(c) => c.close().await,
            BackendCursor::Postgres(c) => c.close().await,
        }
    }
}

impl DocumentStore for Backend {
    type Cursor = BackendCursor;

    async fn insert(&self, collection: &str, doc: Document, wc: WriteConcern) -> Result<Value> {
        match self {
            Backend::Memory(s) => s.insert(collection, doc, wc).await,
            Backend::Postgres(s) => s.insert(collection, doc, wc).await,
        }
    }

    async fn update_by_id(&self, collection: &str, id: &Value, doc: Document, wc: WriteConcern) -> Result<UpdateAck> {
        match self {
            Backend::Memory(s) => s.update_by_id(collection, id, doc, wc).await,
            Backend::Postgres(s) => s.update_by_id(collection, id, doc, wc).await,
        }
    }

    async fn open_cursor(&self, collection: &str, query: &Query) -> Result<BackendCursor> {
        match self {
            Backend::Memory(s) => s.open_cursor(collection, query).await.map(BackendCursor::Memory),
            Backend::Postgres(s) => s.open_cursor(collection, query).await.map(BackendCursor::Postgres),
        }
    }

    async fn find(&self, collection: &str, query: &Query) -> Result<Vec<Document>> {
        match self {
            Backend::Memory(s) => s.find(collection, query).await,
            Backend::Postgres(s) => s.find(collection, query).await,
        }
    }

    async fn remove(&self, collection: &str, matcher: &Document, wc: WriteConcern) -> Result<u64> {
        match self {
            Backend::Memory(s) => s.remove(collection, matcher, wc).await,
            Backend::Postgres(s) => s.remove(collection, matcher, wc).await,
        }
    }

    async fn count(&self, collection: &str, matcher: &Document) -> Result<u64> {
        match self {
            Backend::Memory(s) => s.count(collection, matcher).await,
            Backend::Postgres(s) => s.count(collection, matcher).await,
        }
    }

    async fn list_collections(&self) -> Result<Vec<String>> {
        match self {
            Backend::Memory(s) => s.list_collections().await,
            Backend::Postgres(s) => s.list_collections().await,
        }
    }

    async fn drop_collection(&self, collection: &str) -> Result<()> {
        match self {
            Backend::Memory(s) => s.drop_collection(collection).await,
            Backend::Postgres(s) => s.drop_collection(collection).await,
        }
    }

    async fn stats(&self, collection: &str) -> Result<CollectionStats> {
        match self {
            Backend::Memory(s) => s.stats(collection).await,
            Backend::Postgres(s) => s.stats(collection).await,
        }
    }

    async fn ping(&self) -> Result<()> {
        match self {
            Backend::Memory(s) => s.ping().await,
            Backend::Postgres(s) => s.ping().await,
        }
    }
}
