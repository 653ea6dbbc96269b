//! Shared utilities for rollcall
//!
//! This crate provides:
//! - ID types (SessionId, UserId, SubjectId, MeetCode, ClientId)
//! - Error taxonomy for the reconciliation engine
//! - Wall-clock helpers (mockable `now()`, schedule windows, timestamp formatting)
//! - A bounded TTL key-value cache
//! - Default paths for socket, config, data, and log directories

mod cache;
mod error;
mod ids;
mod paths;
mod time;

pub use cache::*;
pub use error::*;
pub use ids::*;
pub use paths::*;
pub use time::*;
