//! Steadily is a minimalistic crate that exposes the building blocks for
//! optimistic-concurrency event-sourced deciders in Rust.
//!
//! Application code supplies a pure decision function producing Domain
//! Events from stream state; the crate loads that state from a pluggable
//! append-only [Backend][store::Backend], runs the decision, appends the
//! produced events under a version precondition, and retries on conflict
//! with bounded attempts.
//!
//! The moving parts:
//!
//! * a [`Decider`][decider::Decider] running the decision loop against one
//!   stream;
//! * a [`Category`][category::Category] binding a codec, a fold and an
//!   [access strategy][category::AccessStrategy] (forward scans, latest
//!   known event, rolling snapshots) to a backend;
//! * an opaque [`StreamToken`][token::StreamToken] carrying version and
//!   snapshot-headroom metadata between loads and syncs;
//! * a [`StateCache`][cache::StateCache] serving stale reads and
//!   incremental tail replays, with supersede-guarded updates;
//! * a reference in-memory [backend][memory::MemoryStore].

#![deny(unsafe_code, unused_qualifications, trivial_casts)]

pub mod cache;
pub mod category;
pub mod codec;
pub mod compaction;
pub mod decider;
pub mod memory;
pub mod store;
pub mod telemetry;
pub mod token;

use crate::store::StoreError;

/// All possible error types surfaced to application code by this crate.
///
/// Conflicts never appear here: the decision loop consumes them as retry
/// attempts, and only their exhaustion becomes an error.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Every sync attempt of a transaction hit a conflicting writer.
    #[error("every one of the {attempts} sync attempt(s) hit a conflicting writer")]
    MaxResyncsExhausted { attempts: u32 },

    /// An invalid combination of construction parameters; the offending
    /// call never began.
    #[error("invalid configuration: {reason}")]
    InvalidConfig { reason: String },

    /// A failure reported by the backend.
    #[error(transparent)]
    Store(#[from] StoreError),
}
