//! Coordination Strategy Selection
//!
//! A mirror runs one of two coordination policies, chosen at construction:
//!
//! - `remote-first`: the remote replica is the source of truth for all
//!   writes, and for reads until the local replica has caught up. No write
//!   conflicts can occur, but the remote must be reachable.
//! - `local-first`: after a bootstrap two-way sync, the local replica serves
//!   all reads and writes and a debounced delta sync pushes local mutations
//!   back to the remote. Works offline; conflicts are possible.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Coordination policy for a mirrored pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum Strategy {
    /// Remote replica stays authoritative for writes
    #[default]
    RemoteFirst,
    /// Local replica becomes authoritative after the bootstrap sync
    LocalFirst,
}

impl Strategy {
    /// Canonical configuration token for this strategy
    pub fn as_str(&self) -> &'static str {
        match self {
            Strategy::RemoteFirst => "remote-first",
            Strategy::LocalFirst => "local-first",
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Strategy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "remote-first" => Ok(Strategy::RemoteFirst),
            "local-first" => Ok(Strategy::LocalFirst),
            other => Err(Error::Config(format!("unknown strategy: {}", other))),
        }
    }
}
