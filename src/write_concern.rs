//! Write concern resolution.
//!
//! Requests name a durability level with the legacy driver vocabulary
//! (`NORMAL`, `SAFE`, `JOURNAL_SAFE`, ...). Names are matched
//! case-insensitively; an absent name falls back to the configured default.

use crate::error::{Error, Result};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteConcern {
    /// Fire and forget.
    Unacknowledged,
    /// Acknowledged by the primary.
    Acknowledged,
    /// Acknowledged after the write is in the journal / WAL.
    Journaled,
    /// Acknowledged after the write is flushed to disk.
    Fsynced,
    /// Acknowledged after replicas applied the write.
    Replicated,
}

impl WriteConcern {
    /// Value for Postgres' `synchronous_commit` matching this level.
    pub fn synchronous_commit(self) -> &'static str {
        match self {
            WriteConcern::Unacknowledged => "off",
            WriteConcern::Acknowledged => "local",
            WriteConcern::Journaled | WriteConcern::Fsynced => "on",
            WriteConcern::Replicated => "remote_apply",
        }
    }
}

impl FromStr for WriteConcern {
    type Err = Error;

    fn from_str(name: &str) -> Result<Self> {
        let level = match name.to_ascii_uppercase().as_str() {
            "NONE" | "ERRORS_IGNORED" | "NORMAL" | "UNACKNOWLEDGED" => WriteConcern::Unacknowledged,
            "SAFE" | "ACKNOWLEDGED" => WriteConcern::Acknowledged,
            "JOURNAL_SAFE" | "JOURNALED" => WriteConcern::Journaled,
            "FSYNC_SAFE" | "FSYNCED" => WriteConcern::Fsynced,
            "REPLICAS_SAFE" | "REPLICA_ACKNOWLEDGED" | "MAJORITY" => WriteConcern::Replicated,
            _ => return Err(Error::validation(format!("unknown writeConcern '{}'", name))),
        };
        Ok(level)
    }
}

impl fmt::Display for WriteConcern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            WriteConcern::Unacknowledged => "UNACKNOWLEDGED",
            WriteConcern::Acknowledged => "ACKNOWLEDGED",
            WriteConcern::Journaled => "JOURNALED",
            WriteConcern::Fsynced => "FSYNCED",
            WriteConcern::Replicated => "REPLICA_ACKNOWLEDGED",
        };
        f.write_str(name)
    }
}

/// Resolve the level for a single write. Holds no state across requests.
pub fn resolve(requested: Option<&str>, default: WriteConcern) -> Result<WriteConcern> {
    match requested {
        Some(name) => name.parse(),
        None => Ok(default),
    }
}
