use super::{CollectionStats, DocumentStore, Query, StoreCursor, UpdateAck};
use crate::Document;
use crate::error::{Error, Result};
use crate::matcher::Projection;
use crate::translate::{SqlParams, build_order_by, build_where, q_ident};
use crate::write_concern::WriteConcern;
use deadpool_postgres::{Manager, ManagerConfig, Pool, RecyclingMethod};
use serde_json::Value;
use std::collections::{HashMap, HashSet, VecDeque};
use tokio::sync::RwLock;
use tokio_postgres::NoTls;

/// Postgres truncates longer identifiers.
const MAX_IDENT_BYTES: usize = 63;

/// Most ids looked up by one cursor query.
const FETCH_CHUNK: usize = 1000;

/// Documents live in `pdb_<db>.<collection>` tables: `id` is the canonical
/// JSON of `_id`, `doc` is the queryable `jsonb` copy and `body` the document
/// text exactly as saved (key order preserved).
pub struct PgStore {
    pool: Pool,
    db_name: String,
    schema: String,
    server_used: String,
    known: RwLock<HashSet<String>>,
}

/// Holds the ids of a query's results, fixed when the cursor is opened, and
/// reads the bodies batch by batch. Documents removed after the open are
/// skipped; nothing else can be lost or repeated. No connection is pinned.
pub struct PgCursor {
    pool: Pool,
    table: String,
    ids: VecDeque<String>,
    projection: Option<Projection>,
}

impl PgStore {
    pub async fn connect(url: &str, db_name: &str, pool_size: usize, server_used: String) -> Result<Self> {
        let pg_cfg: tokio_postgres::Config = url
            .parse()
            .map_err(|e: tokio_postgres::Error| Error::Config(format!("invalid postgres url: {}", e)))?;
        let mgr = Manager::from_config(pg_cfg, NoTls, ManagerConfig { recycling_method: RecyclingMethod::Fast });
        let pool = Pool::builder(mgr)
            .max_size(pool_size)
            .build()
            .map_err(|e| Error::Store(e.to_string()))?;
        let store = Self {
            pool,
            db_name: db_name.to_string(),
            schema: format!("pdb_{}", db_name),
            server_used,
            known: RwLock::new(HashSet::new()),
        };
        // Fail fast on bad credentials or an unreachable server
        store.ping().await?;
        Ok(store)
    }

    pub async fn bootstrap(&self) -> Result<()> {
        let client = self.pool.get().await?;
        client
            .batch_execute(
                r#"
                CREATE SCHEMA IF NOT EXISTS persistor_meta;
                CREATE TABLE IF NOT EXISTS persistor_meta.collections (
                    db TEXT NOT NULL,
                    coll TEXT NOT NULL,
                    PRIMARY KEY (db, coll)
                );
                "#,
            )
            .await?;
        Ok(())
    }

    fn table(&self, coll: &str) -> String {
        format!("{}.{}", q_ident(&self.schema), q_ident(coll))
    }

    async fn ensure_collection(&self, coll: &str) -> Result<()> {
        if self.known.read().await.contains(coll) {
            return Ok(());
        }
        check_ident(coll)?;
        let mut client = self.pool.get().await?;
        let tx = client.transaction().await?;
        // Serialize DDL per database; concurrent CREATE ... IF NOT EXISTS can still collide
        tx.execute("SELECT pg_advisory_xact_lock(hashtext($1))", &[&self.db_name]).await?;
        let table = self.table(coll);
        let idx = q_ident(&format!("idx_{}_doc_gin", coll));
        let ddl = format!(
            "CREATE SCHEMA IF NOT EXISTS {schema};\nCREATE TABLE IF NOT EXISTS {table} (id TEXT PRIMARY KEY, doc JSONB NOT NULL, body TEXT NOT NULL);\nCREATE INDEX IF NOT EXISTS {idx} ON {table} USING GIN (doc jsonb_path_ops)",
            schema = q_ident(&self.schema),
            table = table,
            idx = idx
        );
        tx.batch_execute(&ddl).await?;
        tx.execute(
            "INSERT INTO persistor_meta.collections(db, coll) VALUES($1,$2) ON CONFLICT (db, coll) DO NOTHING",
            &[&self.db_name, &coll],
        )
        .await?;
        tx.commit().await?;
        self.known.write().await.insert(coll.to_string());
        tracing::debug!(db = %self.db_name, collection = coll, "created collection");
        Ok(())
    }

    async fn exists(&self, coll: &str) -> Result<bool> {
        if self.known.read().await.contains(coll) {
            return Ok(true);
        }
        let client = self.pool.get().await?;
        let row = client
            .query_opt(
                "SELECT 1 FROM persistor_meta.collections WHERE db = $1 AND coll = $2",
                &[&self.db_name, &coll],
            )
            .await?;
        if row.is_some() {
            self.known.write().await.insert(coll.to_string());
        }
        Ok(row.is_some())
    }

    fn select_sql(&self, column: &str, coll: &str, query: &Query, params: &mut SqlParams) -> Result<String> {
        let where_sql = build_where(&query.matcher, params)?;
        let order = build_order_by(&query.sort, params);
        let limit = query.limit.map(|l| l.to_string()).unwrap_or_else(|| "ALL".to_string());
        Ok(format!(
            "SELECT {} FROM {} WHERE {} {} LIMIT {} OFFSET {}",
            column,
            self.table(coll),
            where_sql,
            order,
            limit,
            query.skip
        ))
    }
}

fn check_ident(coll: &str) -> Result<()> {
    if coll.is_empty() || coll.len() > MAX_IDENT_BYTES || coll.contains('\0') {
        return Err(Error::validation(format!(
            "collection name must be 1-{} bytes without NUL characters",
            MAX_IDENT_BYTES
        )));
    }
    Ok(())
}

/// Row key for `_id`. Numbers that compare equal share a key, so `1` and
/// `1.0` name the same document.
fn id_key(id: &Value) -> String {
    canonical(id).to_string()
}

fn canonical(v: &Value) -> Value {
    match v {
        Value::Number(n) if n.as_i64().is_none() && n.as_u64().is_none() => match n.as_f64() {
            Some(f) if f.fract() == 0.0 && f >= i64::MIN as f64 && f < i64::MAX as f64 => Value::from(f as i64),
            _ => v.clone(),
        },
        Value::Array(items) => Value::Array(items.iter().map(canonical).collect()),
        Value::Object(m) => Value::Object(m.iter().map(|(k, x)| (k.clone(), canonical(x))).collect()),
        _ => v.clone(),
    }
}

fn decode(body: &str, projection: Option<&Projection>) -> Result<Document> {
    let doc: Document = serde_json::from_str(body)?;
    Ok(match projection {
        Some(p) => p.apply(&doc),
        None => doc,
    })
}

fn synchronous_commit(wc: WriteConcern) -> String {
    format!("SET LOCAL synchronous_commit TO {}", wc.synchronous_commit())
}

impl StoreCursor for PgCursor {
    async fn fetch(&mut self, n: usize) -> Result<Vec<Document>> {
        let mut out = Vec::new();
        // Rows deleted since the open leave gaps; keep reading until the batch is full
        while out.len() < n && !self.ids.is_empty() {
            let take = (n - out.len()).min(self.ids.len()).min(FETCH_CHUNK);
            let wanted: Vec<String> = self.ids.drain(..take).collect();
            let sql = format!("SELECT id, body FROM {} WHERE id = ANY($1)", self.table);
            let client = self.pool.get().await?;
            let rows = client.query(&sql, &[&wanted]).await?;
            let mut bodies: HashMap<String, String> =
                rows.into_iter().map(|r| (r.get::<_, String>(0), r.get::<_, String>(1))).collect();
            for id in &wanted {
                if let Some(body) = bodies.remove(id) {
                    out.push(decode(&body, self.projection.as_ref())?);
                }
            }
        }
        Ok(out)
    }

    async fn close(self) {}
}

impl DocumentStore for PgStore {
    type Cursor = PgCursor;

    async fn insert(&self, collection: &str, doc: Document, wc: WriteConcern) -> Result<Value> {
        self.ensure_collection(collection).await?;
        let id = doc.get("_id").cloned().ok_or_else(|| Error::Store("document has no _id".into()))?;
        let key = id_key(&id);
        let body = serde_json::to_string(&doc)?;
        let json = Value::Object(doc);
        let mut client = self.pool.get().await?;
        let tx = client.transaction().await?;
        tx.batch_execute(&synchronous_commit(wc)).await?;
        let sql = format!(
            "INSERT INTO {} (id, doc, body) VALUES ($1, $2, $3) ON CONFLICT (id) DO NOTHING",
            self.table(collection)
        );
        let n = tx.execute(&sql, &[&key, &json, &body]).await?;
        if n == 0 {
            return Err(Error::Store(format!("duplicate key: _id {}", id)));
        }
        tx.commit().await?;
        Ok(id)
    }

    async fn update_by_id(&self, collection: &str, id: &Value, doc: Document, wc: WriteConcern) -> Result<UpdateAck> {
        self.ensure_collection(collection).await?;
        let key = id_key(id);
        let body = serde_json::to_string(&doc)?;
        let json = Value::Object(doc);
        let mut client = self.pool.get().await?;
        let tx = client.transaction().await?;
        tx.batch_execute(&synchronous_commit(wc)).await?;
        let sql = format!(
            "INSERT INTO {} (id, doc, body) VALUES ($1, $2, $3) ON CONFLICT (id) DO UPDATE SET doc = EXCLUDED.doc, body = EXCLUDED.body RETURNING (xmax = 0) AS inserted",
            self.table(collection)
        );
        let row = tx.query_one(&sql, &[&key, &json, &body]).await?;
        tx.commit().await?;
        let inserted: bool = row.get(0);
        Ok(UpdateAck { matched: if inserted { 0 } else { 1 }, upserted: inserted })
    }

    async fn open_cursor(&self, collection: &str, query: &Query) -> Result<PgCursor> {
        let mut cursor = PgCursor {
            pool: self.pool.clone(),
            table: self.table(collection),
            ids: VecDeque::new(),
            projection: query.projection.clone(),
        };
        if !self.exists(collection).await? {
            return Ok(cursor);
        }
        let mut params = SqlParams::default();
        let sql = self.select_sql("id", collection, query, &mut params)?;
        let client = self.pool.get().await?;
        let rows = client.query(&sql, &params.as_refs()).await?;
        cursor.ids = rows.into_iter().map(|r| r.get::<_, String>(0)).collect();
        Ok(cursor)
    }

    async fn find(&self, collection: &str, query: &Query) -> Result<Vec<Document>> {
        if !self.exists(collection).await? {
            return Ok(Vec::new());
        }
        let mut params = SqlParams::default();
        let sql = self.select_sql("body", collection, query, &mut params)?;
        let client = self.pool.get().await?;
        let rows = client.query(&sql, &params.as_refs()).await?;
        rows.iter()
            .map(|r| decode(r.get::<_, &str>(0), query.projection.as_ref()))
            .collect()
    }

    async fn remove(&self, collection: &str, matcher: &Document, wc: WriteConcern) -> Result<u64> {
        if !self.exists(collection).await? {
            return Ok(0);
        }
        let mut params = SqlParams::default();
        let where_sql = build_where(matcher, &mut params)?;
        let sql = format!("DELETE FROM {} WHERE {}", self.table(collection), where_sql);
        let mut client = self.pool.get().await?;
        let tx = client.transaction().await?;
        tx.batch_execute(&synchronous_commit(wc)).await?;
        let n = tx.execute(&sql, &params.as_refs()).await?;
        tx.commit().await?;
        Ok(n)
    }

    async fn count(&self, collection: &str, matcher: &Document) -> Result<u64> {
        if !self.exists(collection).await? {
            return Ok(0);
        }
        let mut params = SqlParams::default();
        let where_sql = build_where(matcher, &mut params)?;
        let sql = format!("SELECT count(*) FROM {} WHERE {}", self.table(collection), where_sql);
        let client = self.pool.get().await?;
        let row = client.query_one(&sql, &params.as_refs()).await?;
        let n: i64 = row.get(0);
        Ok(n as u64)
    }

    async fn list_collections(&self) -> Result<Vec<String>> {
        let client = self.pool.get().await?;
        let rows = client
            .query("SELECT coll FROM persistor_meta.collections WHERE db = $1 ORDER BY coll", &[&self.db_name])
            .await?;
        Ok(rows.into_iter().map(|r| r.get::<_, String>(0)).collect())
    }

    async fn drop_collection(&self, collection: &str) -> Result<()> {
        let mut client = self.pool.get().await?;
        let tx = client.transaction().await?;
        tx.execute("SELECT pg_advisory_xact_lock(hashtext($1))", &[&self.db_name]).await?;
        tx.batch_execute(&format!("DROP TABLE IF EXISTS {}", self.table(collection))).await?;
        tx.execute(
            "DELETE FROM persistor_meta.collections WHERE db = $1 AND coll = $2",
            &[&self.db_name, &collection],
        )
        .await?;
        tx.commit().await?;
        self.known.write().await.remove(collection);
        Ok(())
    }

    async fn stats(&self, collection: &str) -> Result<CollectionStats> {
        let mut stats = CollectionStats {
            server_used: self.server_used.clone(),
            ns: format!("{}.{}", self.db_name, collection),
            count: 0,
            size: 0,
            storage_size: 0,
            nindexes: 0,
        };
        if !self.exists(collection).await? {
            return Ok(stats);
        }
        let client = self.pool.get().await?;
        let sql = format!(
            "SELECT count(*), COALESCE(sum(octet_length(body)), 0)::bigint, pg_total_relation_size($1::text::regclass) FROM {}",
            self.table(collection)
        );
        let row = client.query_one(&sql, &[&self.table(collection)]).await?;
        let indexes = client
            .query_one(
                "SELECT count(*) FROM pg_indexes WHERE schemaname = $1 AND tablename = $2",
                &[&self.schema, &collection],
            )
            .await?;
        stats.count = row.get::<_, i64>(0) as u64;
        stats.size = row.get::<_, i64>(1) as u64;
        stats.storage_size = row.get::<_, i64>(2) as u64;
        stats.nindexes = indexes.get::<_, i64>(0) as u32;
        Ok(stats)
    }

    async fn ping(&self) -> Result<()> {
        let client = self.pool.get().await?;
        client.simple_query("SELECT 1").await?;
        Ok(())
    }
}
