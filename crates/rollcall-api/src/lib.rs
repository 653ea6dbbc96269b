//! Protocol types for rollcalld
//!
//! This crate defines the stable API between rollcalld and its clients:
//! - Inbound attendance submissions and progress pings (scraper shape)
//! - Outbound participant records, receipts and token grants
//! - IPC commands and responses
//! - Realtime events for dashboards
//! - Versioning

mod commands;
mod events;
mod submission;
mod types;

pub use commands::*;
pub use events::*;
pub use submission::*;
pub use types::*;

/// Current API version
pub const API_VERSION: u32 = 1;
