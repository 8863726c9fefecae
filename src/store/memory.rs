use super::{CollectionStats, DocumentStore, Query, StoreCursor, UpdateAck};
use crate::Document;
use crate::error::{Error, Result};
use crate::matcher::{matches, sort_documents, values_equal};
use crate::write_concern::WriteConcern;
use serde_json::Value;
use std::collections::{BTreeMap, VecDeque};
use tokio::sync::RwLock;

/// In-process document store backing the service's fake mode.
pub struct MemoryStore {
    db_name: String,
    collections: RwLock<BTreeMap<String, Vec<Document>>>,
}

/// Snapshot of a query's results taken when the cursor was opened.
pub struct MemoryCursor {
    docs: VecDeque<Document>,
}

impl MemoryStore {
    pub fn new(db_name: impl Into<String>) -> Self {
        Self { db_name: db_name.into(), collections: RwLock::new(BTreeMap::new()) }
    }
}

fn id_of(doc: &Document) -> Result<&Value> {
    doc.get("_id").ok_or_else(|| Error::Store("document has no _id".into()))
}

impl StoreCursor for MemoryCursor {
    async fn fetch(&mut self, n: usize) -> Result<Vec<Document>> {
        let take = n.min(self.docs.len());
        Ok(self.docs.drain(..take).collect())
    }

    async fn close(self) {}
}

impl DocumentStore for MemoryStore {
    type Cursor = MemoryCursor;

    async fn insert(&self, collection: &str, doc: Document, wc: WriteConcern) -> Result<Value> {
        let id = id_of(&doc)?.clone();
        tracing::trace!(collection, %wc, "memory insert");
        let mut colls = self.collections.write().await;
        let duplicate = colls.get(collection).is_some_and(|docs| {
            docs.iter().any(|d| d.get("_id").is_some_and(|existing| values_equal(existing, &id)))
        });
        if duplicate {
            return Err(Error::Store(format!("duplicate key: _id {}", id)));
        }
        colls.entry(collection.to_string()).or_default().push(doc);
        Ok(id)
    }

    async fn update_by_id(&self, collection: &str, id: &Value, doc: Document, wc: WriteConcern) -> Result<UpdateAck> {
        tracing::trace!(collection, %wc, "memory update");
        let mut colls = self.collections.write().await;
        let docs = colls.entry(collection.to_string()).or_default();
        match docs.iter_mut().find(|d| d.get("_id").is_some_and(|existing| values_equal(existing, id))) {
            Some(slot) => {
                *slot = doc;
                Ok(UpdateAck { matched: 1, upserted: false })
            }
            None => {
                docs.push(doc);
                Ok(UpdateAck { matched: 0, upserted: true })
            }
        }
    }

    async fn open_cursor(&self, collection: &str, query: &Query) -> Result<MemoryCursor> {
        let colls = self.collections.read().await;
        let mut docs: Vec<Document> = colls
            .get(collection)
            .map(|all| all.iter().filter(|d| matches(d, &query.matcher)).cloned().collect())
            .unwrap_or_default();
        drop(colls);

        if !query.sort.is_empty() {
            sort_documents(&mut docs, &query.sort);
        }
        let skip = usize::try_from(query.skip).unwrap_or(usize::MAX);
        let limit = query.limit.and_then(|l| usize::try_from(l).ok()).unwrap_or(usize::MAX);
        let docs = docs
            .into_iter()
            .skip(skip)
            .take(limit)
            .map(|d| match &query.projection {
                Some(p) => p.apply(&d),
                None => d,
            })
            .collect();
        Ok(MemoryCursor { docs })
    }

    async fn remove(&self, collection: &str, matcher: &Document, wc: WriteConcern) -> Result<u64> {
        tracing::trace!(collection, %wc, "memory remove");
        let mut colls = self.collections.write().await;
        let Some(docs) = colls.get_mut(collection) else {
            return Ok(0);
        };
        let before = docs.len();
        docs.retain(|d| !matches(d, matcher));
        Ok((before - docs.len()) as u64)
    }

    async fn count(&self, collection: &str, matcher: &Document) -> Result<u64> {
        let colls = self.collections.read().await;
        Ok(colls
            .get(collection)
            .map(|docs| docs.iter().filter(|d| matches(d, matcher)).count() as u64)
            .unwrap_or(0))
    }

    async fn list_collections(&self) -> Result<Vec<String>> {
        Ok(self.collections.read().await.keys().cloned().collect())
    }

    async fn drop_collection(&self, collection: &str) -> Result<()> {
        self.collections.write().await.remove(collection);
        Ok(())
    }

    async fn stats(&self, collection: &str) -> Result<CollectionStats> {
        let colls = self.collections.read().await;
        let docs = colls.get(collection).map(Vec::as_slice).unwrap_or(&[]);
        let size: u64 = docs
            .iter()
            .map(|d| serde_json::to_vec(d).map(|b| b.len() as u64).unwrap_or(0))
            .sum();
        Ok(CollectionStats {
            server_used: format!("in-memory/{}", self.db_name),
            ns: format!("{}.{}", self.db_name, collection),
            count: docs.len() as u64,
            size,
            storage_size: size,
            nindexes: 1,
        })
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matcher::{Projection, parse_sort};
    use serde_json::json;

    fn doc(v: Value) -> Document {
        v.as_object().cloned().unwrap()
    }

    async fn seeded(n: i64) -> MemoryStore {
        let store = MemoryStore::new("test_db");
        for i in 0..n {
            store
                .insert("people", doc(json!({"_id": format!("id{i}"), "name": "tim", "age": (i * 7) % 11})), WriteConcern::Acknowledged)
                .await
                .unwrap();
        }
        store
    }

    #[tokio::test]
    async fn duplicate_ids_are_rejected() {
        let store = seeded(1).await;
        let err = store.insert("people", doc(json!({"_id": "id0"})), WriteConcern::Acknowledged).await.unwrap_err();
        assert!(err.to_string().contains("duplicate key"));

        let err = store.insert("people", doc(json!({"_id": "id0", "age": 1.0})), WriteConcern::Acknowledged).await;
        assert!(err.is_err());
        assert!(store.insert("fresh", doc(json!({"name": "no id"})), WriteConcern::Acknowledged).await.is_err());
        assert_eq!(store.list_collections().await.unwrap(), vec!["people".to_string()]);
    }

    #[tokio::test]
    async fn equal_numeric_ids_name_one_document() {
        let store = MemoryStore::new("test_db");
        store.update_by_id("c", &json!(1), doc(json!({"_id": 1, "v": "a"})), WriteConcern::Acknowledged).await.unwrap();
        let ack = store
            .update_by_id("c", &json!(1.0), doc(json!({"_id": 1.0, "v": "b"})), WriteConcern::Acknowledged)
            .await
            .unwrap();
        assert!(!ack.upserted);
        assert_eq!(store.count("c", &Document::new()).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn update_replaces_or_upserts() {
        let store = seeded(1).await;
        let ack = store
            .update_by_id("people", &json!("id0"), doc(json!({"_id": "id0", "age": 1000})), WriteConcern::Acknowledged)
            .await
            .unwrap();
        assert_eq!(ack, UpdateAck { matched: 1, upserted: false });
        let found = store.find("people", &Query::default()).await.unwrap();
        assert_eq!(Value::Object(found[0].clone()), json!({"_id": "id0", "age": 1000}));

        let ack = store
            .update_by_id("people", &json!("new"), doc(json!({"_id": "new"})), WriteConcern::Acknowledged)
            .await
            .unwrap();
        assert!(ack.upserted);
        assert_eq!(store.count("people", &Document::new()).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn cursor_applies_sort_skip_limit_projection() {
        let store = seeded(20).await;
        let query = Query {
            sort: parse_sort(&doc(json!({"age": -1}))).unwrap(),
            skip: 2,
            limit: Some(5),
            projection: Projection::parse(&doc(json!({"age": 1, "_id": 0}))).unwrap(),
            ..Query::default()
        };
        let mut cursor = store.open_cursor("people", &query).await.unwrap();
        let first = cursor.fetch(3).await.unwrap();
        let rest = cursor.fetch(3).await.unwrap();
        assert_eq!(first.len(), 3);
        assert_eq!(rest.len(), 2);
        let ages: Vec<i64> = first.iter().chain(&rest).map(|d| d["age"].as_i64().unwrap()).collect();
        assert!(ages.windows(2).all(|w| w[0] >= w[1]));
        assert!(first.iter().all(|d| d.len() == 1));
    }

    #[tokio::test]
    async fn remove_and_drop() {
        let store = seeded(4).await;
        store.insert("other", doc(json!({"_id": 1})), WriteConcern::Acknowledged).await.unwrap();
        let removed = store.remove("people", &doc(json!({"_id": "id1"})), WriteConcern::Acknowledged).await.unwrap();
        assert_eq!(removed, 1);
        assert_eq!(store.count("people", &Document::new()).await.unwrap(), 3);
        assert_eq!(store.remove("missing", &Document::new(), WriteConcern::Acknowledged).await.unwrap(), 0);

        store.drop_collection("people").await.unwrap();
        assert_eq!(store.list_collections().await.unwrap(), vec!["other".to_string()]);
    }

    #[tokio::test]
    async fn stats_report_namespace_and_count() {
        let store = seeded(3).await;
        let stats = store.stats("people").await.unwrap();
        assert_eq!(stats.ns, "test_db.people");
        assert_eq!(stats.count, 3);
        assert!(stats.size > 0);
        assert!(!stats.server_used.is_empty());
    }
}
