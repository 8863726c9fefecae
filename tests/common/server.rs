use persistor::client::Client;
use persistor::config::Config;
use persistor::server::{AppState, spawn_with_shutdown};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

pub const ADDRESS: &str = "test.persistor";

/// A persistor listening on an ephemeral port.
pub struct TestServer {
    pub state: Arc<AppState>,
    pub addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    handle: Option<JoinHandle<persistor::error::Result<()>>>,
}

impl TestServer {
    pub async fn fake() -> Self {
        Self::start(Config { fake: true, ..test_config() }).await
    }

    pub async fn start(cfg: Config) -> Self {
        let (state, addr, shutdown, handle) = spawn_with_shutdown(cfg).await.unwrap();
        Self { state, addr, shutdown, handle: Some(handle) }
    }

    pub async fn client(&self) -> Client {
        Client::connect(self.addr).await.unwrap()
    }

    pub async fn stop(mut self) {
        let _ = self.shutdown.send(true);
        if let Some(h) = self.handle.take() {
            let _ = h.await;
        }
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}

pub fn test_config() -> Config {
    Config {
        listen_addr: "127.0.0.1:0".into(),
        address: ADDRESS.into(),
        db_name: "test_db".into(),
        ..Config::default()
    }
}
