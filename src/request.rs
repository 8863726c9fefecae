//! Request messages, validated at the message boundary.
//!
//! A request body is a JSON object tagged by `action`. Fields the action does
//! not use are ignored.

use crate::Document;
use crate::error::{Error, Result};
use crate::matcher::{Projection, parse_sort, validate_matcher};
use crate::store::Query;
use serde::{Deserialize, Deserializer};
use serde_json::Value;

#[derive(Debug, Deserialize)]
#[serde(tag = "action")]
pub enum Request {
    #[serde(rename = "save")]
    Save(SaveArgs),
    #[serde(rename = "find")]
    Find(FindArgs),
    #[serde(rename = "findone")]
    FindOne(FindOneArgs),
    #[serde(rename = "delete")]
    Delete(DeleteArgs),
    #[serde(rename = "count")]
    Count(CountArgs),
    #[serde(rename = "collectionStats")]
    CollectionStats(CollectionArgs),
    #[serde(rename = "dropCollection")]
    DropCollection(CollectionArgs),
    #[serde(rename = "getCollections")]
    GetCollections,
    #[serde(rename = "command")]
    Command(CommandArgs),
}

#[derive(Debug, Deserialize)]
pub struct SaveArgs {
    pub collection: String,
    pub document: Document,
    #[serde(rename = "writeConcern")]
    pub write_concern: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct FindArgs {
    pub collection: String,
    #[serde(default)]
    pub matcher: Option<Document>,
    #[serde(default)]
    pub keys: Option<Document>,
    #[serde(default)]
    pub sort: Option<Document>,
    #[serde(default, deserialize_with = "non_negative")]
    pub skip: Option<u64>,
    #[serde(default, deserialize_with = "non_negative")]
    pub limit: Option<u64>,
    #[serde(default, deserialize_with = "non_negative")]
    pub batch_size: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct FindOneArgs {
    pub collection: String,
    #[serde(default)]
    pub matcher: Option<Document>,
    /// Accepted as the matcher when `matcher` is absent.
    #[serde(default)]
    pub document: Option<Document>,
    #[serde(default)]
    pub keys: Option<Document>,
    #[serde(default)]
    pub sort: Option<Document>,
}

#[derive(Debug, Deserialize)]
pub struct DeleteArgs {
    pub collection: String,
    pub matcher: Document,
    #[serde(rename = "writeConcern")]
    pub write_concern: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CountArgs {
    pub collection: String,
    #[serde(default)]
    pub matcher: Option<Document>,
}

#[derive(Debug, Deserialize)]
pub struct CollectionArgs {
    pub collection: String,
}

#[derive(Debug, Deserialize)]
pub struct CommandArgs {
    pub command: Value,
}

/// Largest `skip`, `limit` or `batch_size` accepted; the store takes them as `bigint`.
const MAX_COUNT: u64 = i64::MAX as u64;

// Counts arrive from loosely typed clients; `10.0` is as good as `10`.
fn non_negative<'de, D>(d: D) -> std::result::Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    let v = Option::<Value>::deserialize(d)?;
    match v {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => {
            let parsed = match n.as_u64() {
                Some(u) => Some(u),
                None => n
                    .as_f64()
                    .filter(|f| *f >= 0.0 && f.fract() == 0.0 && *f < MAX_COUNT as f64)
                    .map(|f| f as u64),
            };
            match parsed {
                Some(u) if u <= MAX_COUNT => Ok(Some(u)),
                _ => Err(serde::de::Error::custom(format!(
                    "expected an integer between 0 and {}, got {}",
                    MAX_COUNT, n
                ))),
            }
        }
        Some(other) => Err(serde::de::Error::custom(format!("expected a non-negative integer, got {}", other))),
    }
}

impl Request {
    pub fn parse(body: &[u8]) -> Result<Self> {
        serde_json::from_slice(body).map_err(|e| Error::validation(e.to_string()))
    }

    pub fn action(&self) -> &'static str {
        match self {
            Request::Save(_) => "save",
            Request::Find(_) => "find",
            Request::FindOne(_) => "findone",
            Request::Delete(_) => "delete",
            Request::Count(_) => "count",
            Request::CollectionStats(_) => "collectionStats",
            Request::DropCollection(_) => "dropCollection",
            Request::GetCollections => "getCollections",
            Request::Command(_) => "command",
        }
    }

    pub fn collection(&self) -> Option<&str> {
        match self {
            Request::Save(a) => Some(&a.collection),
            Request::Find(a) => Some(&a.collection),
            Request::FindOne(a) => Some(&a.collection),
            Request::Delete(a) => Some(&a.collection),
            Request::Count(a) => Some(&a.collection),
            Request::CollectionStats(a) | Request::DropCollection(a) => Some(&a.collection),
            Request::GetCollections | Request::Command(_) => None,
        }
    }
}

fn build_query(matcher: Option<&Document>, keys: Option<&Document>, sort: Option<&Document>) -> Result<Query> {
    let matcher = matcher.cloned().unwrap_or_default();
    validate_matcher(&matcher)?;
    let projection = match keys {
        Some(k) => Projection::parse(k)?,
        None => None,
    };
    let sort = match sort {
        Some(s) => parse_sort(s)?,
        None => Vec::new(),
    };
    Ok(Query { matcher, projection, sort, skip: 0, limit: None })
}

impl FindArgs {
    pub fn query(&self) -> Result<Query> {
        let mut q = build_query(self.matcher.as_ref(), self.keys.as_ref(), self.sort.as_ref())?;
        q.skip = self.skip.unwrap_or(0);
        q.limit = self.limit.filter(|&l| l > 0);
        Ok(q)
    }

    /// Batch size when the results are to be delivered through a cursor.
    pub fn batching(&self) -> Option<usize> {
        self.batch_size
            .filter(|&b| b > 0)
            .map(|b| usize::try_from(b).unwrap_or(usize::MAX))
    }
}

impl FindOneArgs {
    pub fn query(&self) -> Result<Query> {
        let matcher = self.matcher.as_ref().or(self.document.as_ref());
        let mut q = build_query(matcher, self.keys.as_ref(), self.sort.as_ref())?;
        q.limit = Some(1);
        Ok(q)
    }
}

impl CommandArgs {
    /// The command as a mapping; strings are read as relaxed JSON (`{ping:1}`).
    pub fn document(&self) -> Result<Document> {
        match &self.command {
            Value::Object(m) => Ok(m.clone()),
            Value::String(s) => match serde_json::from_str::<Value>(&quote_bare_keys(s)) {
                Ok(Value::Object(m)) => Ok(m),
                Ok(_) => Err(Error::validation("command must be an object")),
                Err(e) => Err(Error::validation(format!("invalid command: {}", e))),
            },
            _ => Err(Error::validation("command must be an object or a string")),
        }
    }
}

/// Quote unquoted object keys and turn single-quoted strings into JSON strings.
fn quote_bare_keys(src: &str) -> String {
    let chars: Vec<char> = src.chars().collect();
    let mut out = String::with_capacity(src.len() + 8);
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        match c {
            '"' | '\'' => {
                let quote = c;
                let mut lit = String::new();
                i += 1;
                while i < chars.len() && chars[i] != quote {
                    if chars[i] == '\\' && i + 1 < chars.len() {
                        lit.push(chars[i]);
                        i += 1;
                    } else if chars[i] == '"' {
                        lit.push('\\');
                    }
                    lit.push(chars[i]);
                    i += 1;
                }
                out.push('"');
                out.push_str(&lit);
                out.push('"');
                i += 1;
            }
            c if c.is_ascii_alphabetic() || c == '_' || c == '$' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '_' || chars[i] == '$') {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                let mut j = i;
                while j < chars.len() && chars[j].is_whitespace() {
                    j += 1;
                }
                if j < chars.len() && chars[j] == ':' {
                    out.push('"');
                    out.push_str(&word);
                    out.push('"');
                } else {
                    out.push_str(&word);
                }
            }
            _ => {
                out.push(c);
                i += 1;
            }
        }
    }
    out
}
