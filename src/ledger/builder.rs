//! Ledger Builder
//!
//! Bulk reconstruction: sort, accumulate, then anchor the whole sequence to
//! the authoritative balance through the latest entry.

use std::collections::HashSet;
use tracing::warn;

use crate::ledger::book::{Ledger, LedgerEntry};
use crate::ledger::error::LedgerError;
use crate::ledger::normalizer::normalize_batch;
use crate::models::{ActionKind, RawEvent, Transaction};

/// Build a reconciled ledger.
///
/// Duplicate ids keep their first occurrence. Equal timestamps keep arrival
/// order. A missing or non-finite `authoritative` leaves the offset at 0.
pub fn build(transactions: Vec<Transaction>, authoritative: Option<f64>) -> Ledger {
    let mut ids = HashSet::with_capacity(transactions.len());
    let mut unique: Vec<Transaction> = transactions
        .into_iter()
        .filter(|tx| ids.insert(tx.id.clone()))
        .collect();

    // Vec::sort_by_key is stable
    unique.sort_by_key(|tx| tx.timestamp);

    let entries = unique
        .into_iter()
        .map(|transaction| LedgerEntry {
            transaction,
            running_balance: 0.0,
            display_balance: 0.0,
        })
        .collect();

    let mut ledger = Ledger {
        entries,
        ids,
        offset: 0.0,
        authoritative: authoritative.filter(|b| b.is_finite()),
    };
    ledger.recompute_running_from(0);
    ledger.anchor_offset();
    ledger.apply_offset();
    ledger
}

/// Ledger built straight from raw events, with what it had to skip or neutralize.
#[derive(Debug, Clone)]
pub struct RawBuild {
    pub ledger: Ledger,
    pub rejected: Vec<LedgerError>,
    /// Ids of entries whose action was not recognized (kept with a zero delta)
    pub unknown_actions: Vec<String>,
}

/// Normalize and [`build`] in one step, logging every skipped event and every
/// unrecognized action.
pub fn build_from_raw(raws: &[RawEvent], authoritative: Option<f64>) -> RawBuild {
    let (transactions, rejected) = normalize_batch(raws);
    for err in &rejected {
        warn!(error = %err, "Skipping malformed event");
    }

    let unknown_actions: Vec<String> = transactions
        .iter()
        .filter(|tx| tx.action == ActionKind::Unknown)
        .map(|tx| {
            warn!(
                id = %tx.id,
                action = tx.metadata.action_tag.as_deref().unwrap_or("<missing>"),
                "Unrecognized action kind; treating as balance-neutral"
            );
            tx.id.clone()
        })
        .collect();

    RawBuild {
        ledger: build(transactions, authoritative),
        rejected,
        unknown_actions,
    }
}
