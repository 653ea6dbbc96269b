//! Reconciliation engine for rollcalld
//!
//! This crate is the heart of rollcalld, containing:
//! - Submission normalization (timestamps, durations, names)
//! - Identity resolution against the roster
//! - Session registration, one session per (meet code, day)
//! - Participant presence state machine (join, leave, return, synchronize)
//! - Instructor detection and meeting-end propagation
//! - Tardiness evaluation and finalization
//! - Submission tokens

mod engine;
mod events;
mod finalizer;
mod identity;
mod instructor;
mod normalize;
mod participant;
mod registrar;
mod tardiness;
mod tokens;

pub use engine::*;
pub use events::*;
pub use finalizer::*;
pub use identity::*;
pub use instructor::*;
pub use normalize::*;
pub use participant::*;
pub use registrar::*;
pub use tardiness::*;
pub use tokens::*;

/// Convert a configured std duration to a chrono span
pub(crate) fn span(d: std::time::Duration) -> chrono::Duration {
    chrono::Duration::milliseconds(i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
}
