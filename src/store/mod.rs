//! Durable local state.
//!
//! - `pending`: per-user snapshot store of not-yet-confirmed uploads
//! - `relaunch`: deep-link routes surviving a process restart

pub mod pending;
pub mod relaunch;

pub use pending::{PendingStore, PendingStoreError};
pub use relaunch::{RelaunchRoute, RelaunchStore};
