use rand::{Rng, distributions::Alphanumeric};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio_postgres::NoTls;

/// A throwaway database created on the server named by
/// `PERSISTOR_TEST_POSTGRES_URL`, dropped again when the value goes away.
pub struct TestDb {
    admin_url: String,
    pub dbname: String,
    pub url: String,
}

impl TestDb {
    pub async fn provision_from_env() -> Option<Self> {
        let admin_url = std::env::var("PERSISTOR_TEST_POSTGRES_URL").ok()?;
        let millis = SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_millis()).unwrap_or(0);
        let dbname = format!("persistor_test_{}_{}", millis, rand_suffix(6).to_lowercase());
        let url = replace_db_name(&admin_url, &dbname);

        let (client, conn) = tokio_postgres::connect(&admin_url, NoTls).await.ok()?;
        tokio::spawn(async move {
            let _ = conn.await;
        });
        client
            .batch_execute(&format!("CREATE DATABASE {} TEMPLATE template0", q_ident(&dbname)))
            .await
            .ok()?;
        drop(client);

        Some(Self { admin_url, dbname, url })
    }
}

impl Drop for TestDb {
    fn drop(&mut self) {
        // The test's runtime may already be gone; drop from a private one
        let admin_url = self.admin_url.clone();
        let dbname = self.dbname.clone();
        let _ = std::thread::spawn(move || {
            let Ok(rt) = tokio::runtime::Builder::new_current_thread().enable_all().build() else {
                return;
            };
            rt.block_on(async move {
                if let Ok((client, conn)) = tokio_postgres::connect(&admin_url, NoTls).await {
                    tokio::spawn(async move {
                        let _ = conn.await;
                    });
                    let _ = client
                        .execute(
                            "SELECT pg_terminate_backend(pid) FROM pg_stat_activity WHERE datname = $1 AND pid <> pg_backend_pid()",
                            &[&dbname],
                        )
                        .await;
                    let _ = client.batch_execute(&format!("DROP DATABASE IF EXISTS {}", q_ident(&dbname))).await;
                }
            });
        })
        .join();
    }
}

pub fn rand_suffix(n: usize) -> String {
    rand::thread_rng().sample_iter(&Alphanumeric).take(n).map(char::from).collect()
}

fn q_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

fn replace_db_name(url: &str, new_db: &str) -> String {
    let (base, query) = match url.split_once('?') {
        Some((b, q)) => (b, Some(q)),
        None => (url, None),
    };
    let pos = base.rfind('/').unwrap_or(base.len());
    let mut out = String::from(&base[..pos + 1]);
    out.push_str(new_db);
    if let Some(q) = query {
        out.push('?');
        out.push_str(q);
    }
    out
}
