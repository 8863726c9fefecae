mod common;

use common::postgres::TestDb;
use common::server::{ADDRESS, TestServer, test_config};
use persistor::Document;
use persistor::config::Config;
use persistor::matcher::{Projection, parse_sort};
use persistor::store::{DocumentStore, PgStore, Query, StoreCursor};
use persistor::write_concern::WriteConcern;
use serde_json::{Value, json};

fn doc(v: Value) -> Document {
    v.as_object().cloned().unwrap()
}

async fn connect(td: &TestDb) -> PgStore {
    let store = PgStore::connect(&td.url, "test_db", 4, "test-server".into()).await.expect("connect");
    store.bootstrap().await.expect("bootstrap");
    store
}

#[tokio::test]
async fn pg_insert_update_find_round_trip() {
    let Some(td) = TestDb::provision_from_env().await else {
        eprintln!("skipping: set PERSISTOR_TEST_POSTGRES_URL");
        return;
    };
    let store = connect(&td).await;

    let original = doc(json!({"_id": "a1", "zeta": 1, "alpha": {"b": [1, 2, {"c": null}]}, "name": "tim"}));
    store.insert("people", original.clone(), WriteConcern::Journaled).await.unwrap();
    let err = store.insert("people", original.clone(), WriteConcern::Acknowledged).await.unwrap_err();
    assert!(err.to_string().contains("duplicate key"));

    let found = store.find("people", &Query::default()).await.unwrap();
    assert_eq!(found.len(), 1);
    // Key order survives storage
    let keys: Vec<&str> = found[0].keys().map(String::as_str).collect();
    assert_eq!(keys, vec!["_id", "zeta", "alpha", "name"]);

    let ack = store
        .update_by_id("people", &json!("a1"), doc(json!({"_id": "a1", "name": "fox"})), WriteConcern::Unacknowledged)
        .await
        .unwrap();
    assert_eq!((ack.matched, ack.upserted), (1, false));
    let ack = store
        .update_by_id("people", &json!(7), doc(json!({"_id": 7, "name": "new"})), WriteConcern::Acknowledged)
        .await
        .unwrap();
    assert!(ack.upserted);

    let q = Query { matcher: doc(json!({"_id": "a1"})), ..Query::default() };
    let found = store.find("people", &q).await.unwrap();
    assert_eq!(Value::Object(found[0].clone()), json!({"_id": "a1", "name": "fox"}));
    assert_eq!(store.count("people", &Document::new()).await.unwrap(), 2);
}

#[tokio::test]
async fn pg_matchers_sort_projection_and_paging() {
    let Some(td) = TestDb::provision_from_env().await else {
        eprintln!("skipping: set PERSISTOR_TEST_POSTGRES_URL");
        return;
    };
    let store = connect(&td).await;
    for i in 0..30i64 {
        let tag = if i % 2 == 0 { "even" } else { "odd" };
        let d = doc(json!({"_id": i, "age": i % 7, "name": format!("n{i}"), "tags": [tag]}));
        store.insert("people", d, WriteConcern::Acknowledged).await.unwrap();
    }

    let count = |m: Value| {
        let store = &store;
        async move { store.count("people", &doc(m)).await.unwrap() }
    };
    assert_eq!(count(json!({"tags": "even"})).await, 15);
    assert_eq!(count(json!({"age": {"$gte": 5}})).await, 8);
    assert_eq!(count(json!({"$or": [{"age": 0}, {"age": 6}]})).await, 9);
    assert_eq!(count(json!({"age": {"$in": [1, 2]}, "tags": "odd"})).await, 5);
    assert_eq!(count(json!({"missing": {"$exists": false}})).await, 30);
    assert_eq!(count(json!({"missing": null})).await, 30);

    let query = Query {
        matcher: Document::new(),
        projection: Projection::parse(&doc(json!({"age": 1, "_id": 0}))).unwrap(),
        sort: parse_sort(&doc(json!({"age": -1}))).unwrap(),
        skip: 3,
        limit: Some(20),
    };
    let mut cursor = store.open_cursor("people", &query).await.unwrap();
    let mut ages = Vec::new();
    loop {
        let batch = cursor.fetch(6).await.unwrap();
        let drained = batch.len() < 6;
        for d in &batch {
            assert_eq!(d.len(), 1);
            ages.push(d["age"].as_i64().unwrap());
        }
        if drained {
            break;
        }
    }
    cursor.close().await;
    assert_eq!(ages.len(), 20);
    assert!(ages.windows(2).all(|w| w[0] >= w[1]));
}

#[tokio::test]
async fn pg_collections_stats_and_drop() {
    let Some(td) = TestDb::provision_from_env().await else {
        eprintln!("skipping: set PERSISTOR_TEST_POSTGRES_URL");
        return;
    };
    let store = connect(&td).await;
    assert_eq!(store.count("nothing", &Document::new()).await.unwrap(), 0);
    assert!(store.find("nothing", &Query::default()).await.unwrap().is_empty());

    for i in 0..3 {
        store.insert("b_coll", doc(json!({"_id": i})), WriteConcern::Acknowledged).await.unwrap();
    }
    store.insert("a_coll", doc(json!({"_id": 1})), WriteConcern::Acknowledged).await.unwrap();
    assert_eq!(store.list_collections().await.unwrap(), vec!["a_coll", "b_coll"]);

    let stats = store.stats("b_coll").await.unwrap();
    assert_eq!(stats.ns, "test_db.b_coll");
    assert_eq!(stats.count, 3);
    assert_eq!(stats.server_used, "test-server");
    assert!(stats.size > 0);
    assert!(stats.nindexes >= 1);

    assert_eq!(store.remove("b_coll", &doc(json!({"_id": {"$gt": 0}})), WriteConcern::Acknowledged).await.unwrap(), 2);
    store.drop_collection("b_coll").await.unwrap();
    assert_eq!(store.list_collections().await.unwrap(), vec!["a_coll"]);
    assert_eq!(store.count("b_coll", &Document::new()).await.unwrap(), 0);
    assert!(store.insert(&"x".repeat(64), doc(json!({"_id": 1})), WriteConcern::Acknowledged).await.is_err());
}

#[tokio::test]
async fn pg_cursor_keeps_its_results_across_writes() {
    let Some(td) = TestDb::provision_from_env().await else {
        eprintln!("skipping: set PERSISTOR_TEST_POSTGRES_URL");
        return;
    };
    let store = connect(&td).await;
    for i in 0..30i64 {
        store.insert("people", doc(json!({"_id": i, "n": i})), WriteConcern::Acknowledged).await.unwrap();
    }
    let query = Query { sort: parse_sort(&doc(json!({"n": 1}))).unwrap(), ..Query::default() };
    let mut cursor = store.open_cursor("people", &query).await.unwrap();
    let mut seen: Vec<i64> = cursor.fetch(10).await.unwrap().iter().map(|d| d["n"].as_i64().unwrap()).collect();
    assert_eq!(seen, (0..10).collect::<Vec<i64>>());

    // Delivered rows go away and a new row sorts ahead of everything
    let removed = store.remove("people", &doc(json!({"n": {"$lt": 10}})), WriteConcern::Acknowledged).await.unwrap();
    assert_eq!(removed, 10);
    store.insert("people", doc(json!({"_id": 100, "n": -1})), WriteConcern::Acknowledged).await.unwrap();
    // An undelivered row goes away too; the batch is still filled
    store.remove("people", &doc(json!({"n": 15})), WriteConcern::Acknowledged).await.unwrap();

    let next = cursor.fetch(10).await.unwrap();
    assert_eq!(next.len(), 10);
    seen.extend(next.iter().map(|d| d["n"].as_i64().unwrap()));
    loop {
        let batch = cursor.fetch(10).await.unwrap();
        let drained = batch.len() < 10;
        seen.extend(batch.iter().map(|d| d["n"].as_i64().unwrap()));
        if drained {
            break;
        }
    }
    cursor.close().await;
    let expected: Vec<i64> = (0..30).filter(|&n| n != 15).collect();
    assert_eq!(seen, expected);
}

#[tokio::test]
async fn pg_equal_numeric_ids_name_one_document() {
    let Some(td) = TestDb::provision_from_env().await else {
        eprintln!("skipping: set PERSISTOR_TEST_POSTGRES_URL");
        return;
    };
    let store = connect(&td).await;
    store.update_by_id("c", &json!(1), doc(json!({"_id": 1, "v": "a"})), WriteConcern::Acknowledged).await.unwrap();
    let ack = store
        .update_by_id("c", &json!(1.0), doc(json!({"_id": 1.0, "v": "b"})), WriteConcern::Acknowledged)
        .await
        .unwrap();
    assert!(!ack.upserted);
    assert_eq!(store.count("c", &Document::new()).await.unwrap(), 1);
    let found = store.find("c", &Query::default()).await.unwrap();
    assert_eq!(found[0]["v"], "b");

    store.insert("c", doc(json!({"_id": 2})), WriteConcern::Acknowledged).await.unwrap();
    let err = store.insert("c", doc(json!({"_id": 2.0})), WriteConcern::Acknowledged).await.unwrap_err();
    assert!(err.to_string().contains("duplicate key"));
}

#[tokio::test]
async fn pg_errors_name_the_cause_and_large_limits_work() {
    let Some(td) = TestDb::provision_from_env().await else {
        eprintln!("skipping: set PERSISTOR_TEST_POSTGRES_URL");
        return;
    };
    let (client, conn) = tokio_postgres::connect(&td.url, tokio_postgres::NoTls).await.expect("connect");
    tokio::spawn(async move {
        let _ = conn.await;
    });
    let err = client.batch_execute("SELECT 1/0").await.unwrap_err();
    let msg = persistor::error::Error::from(err).to_string();
    assert!(msg.contains("division by zero"), "{}", msg);
    assert!(msg.contains("22012"), "{}", msg);

    let store = connect(&td).await;
    for i in 0..3 {
        store.insert("c", doc(json!({"_id": i})), WriteConcern::Acknowledged).await.unwrap();
    }
    let q = Query { limit: Some(i64::MAX as u64), skip: 1, ..Query::default() };
    assert_eq!(store.find("c", &q).await.unwrap().len(), 2);
    let mut cursor = store.open_cursor("c", &q).await.unwrap();
    assert_eq!(cursor.fetch(usize::MAX).await.unwrap().len(), 2);
}

#[tokio::test]
async fn e2e_pg_batched_find() {
    let Some(td) = TestDb::provision_from_env().await else {
        eprintln!("skipping: set PERSISTOR_TEST_POSTGRES_URL");
        return;
    };
    let cfg = Config { postgres_url: Some(td.url.clone()), ..test_config() };
    let server = TestServer::start(cfg).await;
    let mut c = server.client().await;
    for i in 0..103 {
        let r = c
            .send(ADDRESS, &json!({"action": "save", "collection": "testcoll", "document": {"n": i}}))
            .await
            .unwrap();
        assert_eq!(r.status(), "ok");
    }

    let mut reply = c
        .send(ADDRESS, &json!({"action": "find", "collection": "testcoll", "sort": {"n": 1}, "batch_size": 10}))
        .await
        .unwrap();
    let mut seen = Vec::new();
    let mut replies = 1;
    loop {
        for d in reply.body["results"].as_array().unwrap() {
            seen.push(d["n"].as_i64().unwrap());
        }
        if reply.status() != "more-exist" {
            break;
        }
        reply = c.continue_from(reply.id).await.unwrap();
        replies += 1;
    }
    assert_eq!(reply.status(), "ok");
    assert_eq!(replies, 11);
    assert_eq!(seen, (0..103).collect::<Vec<i64>>());

    let r = c.send(ADDRESS, &json!({"action": "collectionStats", "collection": "testcoll"})).await.unwrap();
    assert_eq!(r.body["stats"]["count"], 103);
    server.stop().await;
}
