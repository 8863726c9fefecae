//! Reply bodies. `status` is always the first key.

use crate::Document;
use serde_json::Value;

pub const STATUS_OK: &str = "ok";
pub const STATUS_ERROR: &str = "error";
pub const STATUS_MORE_EXIST: &str = "more-exist";

fn with_status(status: &str) -> Document {
    let mut doc = Document::new();
    doc.insert("status".to_string(), Value::String(status.to_string()));
    doc
}

pub fn ok() -> Document {
    with_status(STATUS_OK)
}

pub fn ok_with(field: &str, value: impl Into<Value>) -> Document {
    let mut doc = ok();
    doc.insert(field.to_string(), value.into());
    doc
}

/// A batch of query results; `more` marks a batch with a continuation.
pub fn results(docs: Vec<Document>, more: bool) -> Document {
    let mut doc = with_status(if more { STATUS_MORE_EXIST } else { STATUS_OK });
    doc.insert("results".to_string(), Value::Array(docs.into_iter().map(Value::Object).collect()));
    doc
}

pub fn error(message: impl Into<String>) -> Document {
    let mut doc = with_status(STATUS_ERROR);
    doc.insert("message".to_string(), Value::String(message.into()));
    doc
}

pub fn status(reply: &Document) -> Option<&str> {
    reply.get("status").and_then(Value::as_str)
}
