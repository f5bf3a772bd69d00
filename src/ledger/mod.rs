//! Points ledger reconstruction
//!
//! raw events → [`normalizer`] → [`builder`] (bulk) → [`Ledger`],
//! then each live event → [`normalizer`] → [`merge`] (incremental).

pub mod book;
pub mod builder;
pub mod error;
pub mod merge;
pub mod normalizer;

pub use book::{Ledger, LedgerEntry};
pub use builder::{build, build_from_raw, RawBuild};
pub use error::{LedgerError, Result};
pub use merge::{merge, reconcile, MergeOutcome};
pub use normalizer::{normalize, normalize_batch, NormalizationTable, DEFAULT_TABLE};
