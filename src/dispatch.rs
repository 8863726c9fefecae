//! Executes requests against a [`DocumentStore`] and shapes the replies.
//!
//! Nothing escapes as an error: every failure becomes a `status: "error"`
//! reply. Batched finds hand back the cursor handle alongside the reply so the
//! bus endpoint can route continuations to [`Dispatcher::continue_cursor`].

use crate::Document;
use crate::cursor::{CursorHandle, CursorManager};
use crate::error::{Error, Result};
use crate::matcher::validate_matcher;
use crate::reply;
use crate::request::{CommandArgs, Request};
use crate::store::DocumentStore;
use crate::write_concern::{self, WriteConcern};
use serde_json::{Value, json};
use std::time::Duration;

/// A reply, plus the cursor to continue when the reply is `more-exist`.
#[derive(Debug)]
pub struct Outcome {
    pub reply: Document,
    pub cursor: Option<CursorHandle>,
}

impl Outcome {
    fn reply(reply: Document) -> Self {
        Self { reply, cursor: None }
    }
}

pub struct Dispatcher<S: DocumentStore> {
    store: S,
    cursors: CursorManager<S::Cursor>,
    db_name: String,
    default_write_concern: WriteConcern,
}

impl<S: DocumentStore> Dispatcher<S> {
    pub fn new(store: S, db_name: impl Into<String>, default_write_concern: WriteConcern) -> Self {
        Self { store, cursors: CursorManager::new(), db_name: db_name.into(), default_write_concern }
    }

    pub fn cursors(&self) -> &CursorManager<S::Cursor> {
        &self.cursors
    }

    pub async fn handle(&self, body: &[u8]) -> Outcome {
        let req = match Request::parse(body) {
            Ok(r) => r,
            Err(e) => {
                tracing::debug!(error = %e, "rejected request");
                return Outcome::reply(reply::error(e.to_string()));
            }
        };
        let action = req.action();
        let collection = req.collection().unwrap_or("").to_string();
        tracing::debug!(action, collection = %collection, "request");
        match self.execute(req).await {
            Ok(outcome) => outcome,
            Err(e) => {
                if matches!(e, Error::Store(_) | Error::Io(_)) {
                    tracing::warn!(action, collection = %collection, error = %e, "request failed");
                } else {
                    tracing::debug!(action, collection = %collection, error = %e, "request rejected");
                }
                Outcome::reply(reply::error(e.to_string()))
            }
        }
    }

    /// Next batch of a cursor opened by a batched find.
    pub async fn continue_cursor(&self, handle: CursorHandle) -> Outcome {
        match self.next_batch(handle).await {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::debug!(?handle, error = %e, "continuation failed");
                Outcome::reply(reply::error(e.to_string()))
            }
        }
    }

    /// The client will not ask for more.
    pub async fn release_cursor(&self, handle: CursorHandle) {
        self.cursors.close(handle).await;
    }

    pub async fn sweep_cursors(&self, ttl: Duration) -> usize {
        self.cursors.sweep(ttl).await
    }

    async fn next_batch(&self, handle: CursorHandle) -> Result<Outcome> {
        let batch = self.cursors.next(handle).await?;
        let more = !batch.exhausted;
        Ok(Outcome { reply: reply::results(batch.docs, more), cursor: more.then_some(handle) })
    }

    async fn execute(&self, req: Request) -> Result<Outcome> {
        let reply = match req {
            Request::Save(args) => {
                let wc = write_concern::resolve(args.write_concern.as_deref(), self.default_write_concern)?;
                let mut doc = args.document;
                match doc.get("_id").cloned() {
                    Some(id) if !id.is_null() => {
                        let ack = self.store.update_by_id(&args.collection, &id, doc, wc).await?;
                        tracing::trace!(collection = %args.collection, upserted = ack.upserted, "saved by id");
                        reply::ok()
                    }
                    _ => {
                        doc.shift_remove("_id");
                        let id = Value::String(uuid::Uuid::new_v4().to_string());
                        let mut with_id = Document::with_capacity(doc.len() + 1);
                        with_id.insert("_id".to_string(), id);
                        with_id.extend(doc);
                        let id = self.store.insert(&args.collection, with_id, wc).await?;
                        reply::ok_with("_id", id)
                    }
                }
            }
            Request::Find(args) => {
                let query = args.query()?;
                match args.batching() {
                    Some(batch_size) => {
                        let cursor = self.store.open_cursor(&args.collection, &query).await?;
                        let handle = self.cursors.open(cursor, batch_size).await;
                        return self.next_batch(handle).await;
                    }
                    None => reply::results(self.store.find(&args.collection, &query).await?, false),
                }
            }
            Request::FindOne(args) => {
                let query = args.query()?;
                let found = self.store.find(&args.collection, &query).await?.into_iter().next();
                reply::ok_with("result", found.map(Value::Object).unwrap_or(Value::Null))
            }
            Request::Delete(args) => {
                let wc = write_concern::resolve(args.write_concern.as_deref(), self.default_write_concern)?;
                validate_matcher(&args.matcher)?;
                let n = self.store.remove(&args.collection, &args.matcher, wc).await?;
                reply::ok_with("number", n)
            }
            Request::Count(args) => {
                let matcher = args.matcher.unwrap_or_default();
                validate_matcher(&matcher)?;
                reply::ok_with("count", self.store.count(&args.collection, &matcher).await?)
            }
            Request::CollectionStats(args) => {
                let stats = self.store.stats(&args.collection).await?;
                reply::ok_with("stats", Value::Object(stats.to_document()))
            }
            Request::DropCollection(args) => {
                self.store.drop_collection(&args.collection).await?;
                reply::ok()
            }
            Request::GetCollections => {
                let mut names = self.store.list_collections().await?;
                names.sort();
                reply::ok_with("collections", names)
            }
            Request::Command(args) => reply::ok_with("result", Value::Object(self.run_command(&args).await?)),
        };
        Ok(Outcome::reply(reply))
    }

    async fn run_command(&self, args: &CommandArgs) -> Result<Document> {
        let cmd = args.document()?;
        let Some((name, arg)) = cmd.iter().next() else {
            return Err(Error::validation("empty command"));
        };
        let target = || {
            arg.as_str()
                .filter(|s| !s.is_empty())
                .ok_or_else(|| Error::validation(format!("{} needs a collection name", name)))
        };
        let result = match name.as_str() {
            "ping" => json!({"ok": 1.0}),
            "buildInfo" | "buildinfo" => json!({"version": env!("CARGO_PKG_VERSION"), "ok": 1.0}),
            "listCollections" => {
                let mut names = self.store.list_collections().await?;
                names.sort();
                json!({"collections": names, "ok": 1.0})
            }
            "collStats" => Value::Object(self.store.stats(target()?).await?.to_document()),
            "count" => {
                let matcher = match cmd.get("query") {
                    Some(Value::Object(m)) => m.clone(),
                    None | Some(Value::Null) => Document::new(),
                    Some(_) => return Err(Error::validation("count query must be an object")),
                };
                validate_matcher(&matcher)?;
                json!({"n": self.store.count(target()?, &matcher).await?, "ok": 1.0})
            }
            "drop" => {
                let coll = target()?;
                self.store.drop_collection(coll).await?;
                json!({"ns": format!("{}.{}", self.db_name, coll), "ok": 1.0})
            }
            "dbStats" => {
                let names = self.store.list_collections().await?;
                let (mut objects, mut data_size, mut storage_size) = (0u64, 0u64, 0u64);
                for n in &names {
                    let s = self.store.stats(n).await?;
                    objects += s.count;
                    data_size += s.size;
                    storage_size += s.storage_size;
                }
                json!({
                    "db": self.db_name,
                    "collections": names.len(),
                    "objects": objects,
                    "dataSize": data_size,
                    "storageSize": storage_size,
                    "ok": 1.0,
                })
            }
            other => return Err(Error::validation(format!("unsupported command '{}'", other))),
        };
        match result {
            Value::Object(m) => Ok(m),
            _ => Err(Error::Msg("command produced a non-object result".into())),
        }
    }
}
