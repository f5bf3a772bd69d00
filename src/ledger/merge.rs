//! Incremental merge and reconciliation.
//!
//! The live feed is at-least-once and unordered, so a merge must:
//! - absorb redelivered ids,
//! - insert by timestamp rather than at the head,
//! - shift every later running balance by the inserted delta.
//!
//! The offset is re-anchored only when the inserted entry becomes the latest,
//! or when [`reconcile`] is called with a fresh authoritative balance.

use crate::ledger::book::{Ledger, LedgerEntry};
use crate::ledger::error::{LedgerError, Result};
use crate::models::Transaction;

/// What a merge did to the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    /// Id already present; nothing changed.
    Duplicate,
    /// Inserted as the chronologically latest entry; offset re-anchored.
    Appended,
    /// Inserted before the latest entry (late delivery); offset kept.
    Inserted { index: usize },
}

impl MergeOutcome {
    pub fn changed(&self) -> bool {
        !matches!(self, MergeOutcome::Duplicate)
    }
}

impl Ledger {
    /// Merge one transaction in place.
    ///
    /// On error the ledger is left untouched.
    pub fn merge(&mut self, tx: Transaction) -> Result<MergeOutcome> {
        if self.ids.contains(&tx.id) {
            return Ok(MergeOutcome::Duplicate);
        }

        // Upper bound: equal timestamps stay in delivery order.
        let index = self.entries.partition_point(|e| e.timestamp() <= tx.timestamp);
        self.check_insertion(index, &tx)?;

        let is_latest = index == self.entries.len();
        self.ids.insert(tx.id.clone());
        self.entries.insert(
            index,
            LedgerEntry {
                transaction: tx,
                running_balance: 0.0,
                display_balance: 0.0,
            },
        );
        self.recompute_running_from(index);

        if is_latest {
            self.anchor_offset();
            self.apply_offset();
            Ok(MergeOutcome::Appended)
        } else {
            self.apply_offset();
            Ok(MergeOutcome::Inserted { index })
        }
    }

    /// Re-anchor the offset to a fresh authoritative balance.
    pub fn reconcile(&mut self, authoritative: f64) -> Result<()> {
        if !authoritative.is_finite() {
            return Err(LedgerError::MissingAuthoritativeBalance);
        }
        self.authoritative = Some(authoritative);
        self.anchor_offset();
        self.apply_offset();
        Ok(())
    }

    fn check_insertion(&self, index: usize, tx: &Transaction) -> Result<()> {
        let len = self.entries.len();
        let out_of_range = || LedgerError::OutOfRangeInsertion { index, len };
        if index > len {
            return Err(out_of_range());
        }
        if index > 0 && self.entries[index - 1].timestamp() > tx.timestamp {
            return Err(out_of_range());
        }
        if index < len && self.entries[index].timestamp() <= tx.timestamp {
            return Err(out_of_range());
        }
        // the neighborhood itself must already be ordered
        if index >= 2 && self.entries[index - 2].timestamp() > self.entries[index - 1].timestamp() {
            return Err(out_of_range());
        }
        if index + 1 < len && self.entries[index].timestamp() > self.entries[index + 1].timestamp() {
            return Err(out_of_range());
        }
        Ok(())
    }
}

/// Pure form of [`Ledger::merge`].
pub fn merge(ledger: &Ledger, tx: Transaction) -> Result<Ledger> {
    let mut next = ledger.clone();
    next.merge(tx)?;
    Ok(next)
}

/// Pure form of [`Ledger::reconcile`].
pub fn reconcile(ledger: &Ledger, authoritative: f64) -> Result<Ledger> {
    let mut next = ledger.clone();
    next.reconcile(authoritative)?;
    Ok(next)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::builder::build;
    use crate::models::ActionKind;
    use chrono::{TimeZone, Utc};

    fn tx(id: &str, ms: i64, action: ActionKind, amount: f64) -> Transaction {
        Transaction::new(id, action, Utc.timestamp_millis_opt(ms).unwrap(), amount)
    }

    fn running(ledger: &Ledger) -> Vec<f64> {
        ledger.entries().iter().map(|e| e.running_balance).collect()
    }

    fn display(ledger: &Ledger) -> Vec<f64> {
        ledger.entries().iter().map(|e| e.display_balance).collect()
    }

    fn base() -> Ledger {
        build(
            vec![
                tx("t1", 1_000, ActionKind::Scan, 10.0),
                tx("t2", 2_000, ActionKind::Redemption, 3.0),
            ],
            Some(9.0),
        )
    }

    #[test]
    fn test_append_reanchors_offset() {
        let mut ledger = base();
        assert_eq!(ledger.offset(), 2.0);

        let outcome = ledger.merge(tx("t3", 3_000, ActionKind::Scan, 5.0)).unwrap();
        assert_eq!(outcome, MergeOutcome::Appended);
        assert_eq!(running(&ledger), vec![10.0, 7.0, 12.0]);
        // authoritative is still 9, so the new latest entry shows 9
        assert_eq!(ledger.offset(), -3.0);
        assert_eq!(display(&ledger), vec![7.0, 4.0, 9.0]);
    }

    #[test]
    fn test_late_insert_shifts_later_entries_and_keeps_offset() {
        let mut ledger = base();
        let outcome = ledger.merge(tx("t0", 500, ActionKind::PointAdd, 5.0)).unwrap();
        assert_eq!(outcome, MergeOutcome::Inserted { index: 0 });
        assert_eq!(running(&ledger), vec![5.0, 15.0, 12.0]);
        assert_eq!(ledger.offset(), 2.0);
        assert_eq!(display(&ledger), vec![7.0, 17.0, 14.0]);
    }

    #[test]
    fn test_middle_insert() {
        let mut ledger = base();
        let outcome = ledger.merge(tx("t15", 1_500, ActionKind::Manual, 1.0)).unwrap();
        assert_eq!(outcome, MergeOutcome::Inserted { index: 1 });
        assert_eq!(running(&ledger), vec![10.0, 9.0, 6.0]);
    }

    #[test]
    fn test_equal_timestamp_goes_after_existing() {
        let mut ledger = base();
        let outcome = ledger.merge(tx("t2b", 2_000, ActionKind::Scan, 1.0)).unwrap();
        assert_eq!(outcome, MergeOutcome::Appended);
        assert_eq!(ledger.entries().last().unwrap().id(), "t2b");
    }

    #[test]
    fn test_duplicate_is_noop() {
        let mut ledger = base();
        let before = ledger.clone();
        let outcome = ledger.merge(tx("t2", 9_000, ActionKind::Scan, 100.0)).unwrap();
        assert_eq!(outcome, MergeOutcome::Duplicate);
        assert_eq!(ledger, before);
    }

    #[test]
    fn test_merge_into_empty_without_balance() {
        let mut ledger = Ledger::empty();
        ledger.merge(tx("a", 1_000, ActionKind::Scan, 4.0)).unwrap();
        assert_eq!(ledger.offset(), 0.0);
        assert_eq!(ledger.current_balance(), 4.0);
    }

    #[test]
    fn test_merge_into_empty_with_balance() {
        let mut ledger = build(Vec::new(), Some(20.0));
        ledger.merge(tx("a", 1_000, ActionKind::Scan, 4.0)).unwrap();
        assert_eq!(ledger.offset(), 16.0);
        assert_eq!(ledger.current_balance(), 20.0);
    }

    #[test]
    fn test_reconcile_only_moves_offset() {
        let ledger = base();
        let next = reconcile(&ledger, 30.0).unwrap();
        assert_eq!(running(&next), running(&ledger));
        assert_eq!(next.offset(), 23.0);
        assert_eq!(next.current_balance(), 30.0);
        assert_eq!(next.authoritative(), Some(30.0));
    }

    #[test]
    fn test_reconcile_rejects_nan() {
        let mut ledger = base();
        let before = ledger.clone();
        assert_eq!(
            ledger.reconcile(f64::NAN),
            Err(LedgerError::MissingAuthoritativeBalance)
        );
        assert_eq!(ledger, before);
    }

    #[test]
    fn test_out_of_order_storage_is_surfaced() {
        let mut ledger = base();
        // corrupt the ordering behind the merge's back
        ledger.entries.swap(0, 1);
        let before = ledger.clone();
        let err = ledger.merge(tx("x", 3_000, ActionKind::Scan, 1.0)).unwrap_err();
        assert!(matches!(err, LedgerError::OutOfRangeInsertion { .. }));
        assert_eq!(ledger, before);
    }

    #[test]
    fn test_pure_merge_leaves_input_untouched() {
        let ledger = base();
        let next = merge(&ledger, tx("t3", 3_000, ActionKind::Scan, 1.0)).unwrap();
        assert_eq!(ledger.len(), 2);
        assert_eq!(next.len(), 3);
    }
}
