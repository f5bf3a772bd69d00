//! Points Ledger
//!
//! Client-side reconciled points ledger: normalizes raw history events,
//! builds a running-balance ledger anchored to the server's authoritative
//! total, and keeps it current from a live feed.

pub mod api;
pub mod config;
pub mod ledger;
pub mod live;
pub mod models;
pub mod sources;

pub use config::Config;
pub use ledger::{build, merge, normalize, reconcile, Ledger, LedgerEntry, LedgerError};
pub use live::{LedgerController, LedgerRegistry, LedgerSession};
pub use models::{ActionKind, RawEvent, Transaction};
