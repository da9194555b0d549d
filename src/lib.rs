//! MirrorSync - Replication-Aware Mirror Coordinator
//!
//! Coordinates reads and writes across a pair of document replicas: a
//! remote replica treated as the durable source of truth and a local
//! replica kept eventually consistent with it via live replication.
//! Callers observe a single logical database while the replicas converge
//! asynchronously.
//!
//! # Architecture
//!
//! A [`Mirror`](mirror::Mirror) owns one sync session per replica pair. The
//! session decides which replica serves reads and which serves writes as
//! sync progresses from "not yet synced" to "caught up" and back to idle on
//! failure. Writes block until their revision surfaces on the confirming
//! replica's live change feed, correlated race-safely by the change
//! correlator. Reconnect attempts are paced by a randomized exponential
//! backoff.
//!
//! # Features
//!
//! - Remote-first strategy: no write conflicts, remote stays authoritative
//! - Local-first strategy: offline-capable, with debounced delta syncs
//! - Race-safe write confirmation against the live change feed
//! - Randomized exponential reconnect backoff with a configurable ceiling
//! - Engine-agnostic: any store implementing the [`Replica`](replica::Replica)
//!   contract, with an in-memory reference engine included

pub mod backoff;
pub mod config;
pub mod correlator;
pub mod error;
pub mod memory;
pub mod mirror;
pub mod replica;
pub mod session;
pub mod strategy;

pub use config::MirrorConfig;
pub use error::{Error, Result};
pub use mirror::Mirror;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::backoff::Backoff;
    pub use crate::config::MirrorConfig;
    pub use crate::error::{Error, Result};
    pub use crate::memory::MemoryReplica;
    pub use crate::mirror::Mirror;
    pub use crate::replica::{Attachment, Document, Replica, WriteResult};
    pub use crate::session::{SessionEvent, SessionStatus, StartOptions, Target};
    pub use crate::strategy::Strategy;
}
