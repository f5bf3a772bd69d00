//! Live ledger maintenance: per-entity controllers, the registry that owns
//! them, and the session that feeds them from the history and live sources.

pub mod controller;
pub mod registry;
pub mod session;

pub use controller::{
    InstallOutcome, LedgerController, LedgerStatsSnapshot, LedgerUpdate, LoadTicket, UpdateCause,
};
pub use registry::LedgerRegistry;
pub use session::LedgerSession;
