use crate::error::{Error, Result};
use serde::Deserialize;
use std::fs;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub listen_addr: String,
    /// Bus address the persistor answers on.
    pub address: String,
    pub db_name: String,
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Full connection string; takes precedence over host/port/credentials.
    pub postgres_url: Option<String>,
    /// Serve from the in-memory store instead of Postgres.
    pub fake: bool,
    pub pool_size: usize,
    pub default_write_concern: String,
    pub cursor_timeout_secs: Option<u64>,
    pub cursor_sweep_interval_secs: Option<u64>,
    pub max_message_bytes: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:7601".to_string(),
            address: "persistor".to_string(),
            db_name: "default_db".to_string(),
            host: "localhost".to_string(),
            port: 5432,
            username: None,
            password: None,
            postgres_url: None,
            fake: false,
            pool_size: 16,
            default_write_concern: "SAFE".to_string(),
            cursor_timeout_secs: None,
            cursor_sweep_interval_secs: None,
            max_message_bytes: 16 * 1024 * 1024,
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        // Priority: explicit file (PERSISTOR_CONFIG) or ./persistor.toml → env → defaults
        let path = std::env::var("PERSISTOR_CONFIG").unwrap_or_else(|_| "persistor.toml".to_string());
        Self::load_from(&path)
    }

    pub fn load_from(path: &str) -> Result<Self> {
        let mut cfg = match fs::read_to_string(path) {
            Ok(contents) => toml::from_str::<Config>(&contents)
                .map_err(|e| Error::Config(format!("failed to parse {}: {}", path, e)))?,
            Err(_) => Config::default(),
        };
        cfg.apply_env();
        Ok(cfg)
    }

    fn apply_env(&mut self) {
        if let Ok(addr) = std::env::var("PERSISTOR_LISTEN_ADDR") {
            self.listen_addr = addr;
        }
        if let Ok(address) = std::env::var("PERSISTOR_ADDRESS") {
            self.address = address;
        }
        if let Ok(db) = std::env::var("PERSISTOR_DB_NAME") {
            self.db_name = db;
        }
        if let Ok(pg) = std::env::var("PERSISTOR_POSTGRES_URL") {
            self.postgres_url = Some(pg);
        }
        if let Ok(user) = std::env::var("PERSISTOR_USERNAME") {
            self.username = Some(user);
        }
        if let Ok(pass) = std::env::var("PERSISTOR_PASSWORD") {
            self.password = Some(pass);
        }
        if let Ok(fake) = std::env::var("PERSISTOR_FAKE") {
            self.fake = matches!(fake.as_str(), "1" | "true" | "yes");
        }
    }

    /// Connection string for the backing Postgres, built from host/port and
    /// credentials unless `postgres_url` is given.
    pub fn connection_url(&self) -> String {
        if let Some(url) = &self.postgres_url {
            return url.clone();
        }
        let auth = match (&self.username, &self.password) {
            (Some(u), Some(p)) => format!("{}:{}@", u, p),
            (Some(u), None) => format!("{}@", u),
            _ => String::new(),
        };
        format!("postgres://{}{}:{}/{}", auth, self.host, self.port, self.db_name)
    }

    /// Human-readable "host:port" of the backing store, reported in collection stats.
    pub fn server_used(&self) -> String {
        if self.fake {
            return format!("in-memory/{}", self.db_name);
        }
        match &self.postgres_url {
            Some(url) => url
                .rsplit_once('@')
                .map(|(_, rest)| rest)
                .unwrap_or(url.as_str())
                .trim_start_matches("postgres://")
                .trim_start_matches("postgresql://")
                .split('/')
                .next()
                .unwrap_or("")
                .to_string(),
            None => format!("{}:{}", self.host, self.port),
        }
    }
}
