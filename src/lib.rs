pub mod client;
pub mod config;
pub mod cursor;
pub mod dispatch;
pub mod error;
pub mod matcher;
pub mod protocol;
pub mod reply;
pub mod request;
pub mod server;
pub mod store;
pub mod translate;
pub mod write_concern;

/// A stored document: a JSON object with its key order preserved.
pub type Document = serde_json::Map<String, serde_json::Value>;
