use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::models::Transaction;

/// A transaction with its derived balances.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    #[serde(flatten)]
    pub transaction: Transaction,
    /// Cumulative sum of deltas up to and including this entry
    pub running_balance: f64,
    /// `running_balance + offset`
    pub display_balance: f64,
}

impl LedgerEntry {
    pub fn id(&self) -> &str {
        &self.transaction.id
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.transaction.timestamp
    }

    pub fn delta(&self) -> f64 {
        self.transaction.delta
    }
}

/// Reconciled ledger for one entity.
///
/// Entries are kept in ascending timestamp order; use [`Ledger::display_entries`]
/// for the newest-first view.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(from = "LedgerParts")]
pub struct Ledger {
    pub(crate) entries: Vec<LedgerEntry>,
    #[serde(skip)]
    pub(crate) ids: HashSet<String>,
    pub(crate) offset: f64,
    pub(crate) authoritative: Option<f64>,
}

impl Ledger {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Chronological (ascending) entries.
    pub fn entries(&self) -> &[LedgerEntry] {
        &self.entries
    }

    /// Newest-first view.
    pub fn display_entries(&self) -> Vec<LedgerEntry> {
        self.entries.iter().rev().cloned().collect()
    }

    /// Newest-first view restricted to `from..=to`.
    pub fn display_entries_between(
        &self,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> Vec<LedgerEntry> {
        self.entries
            .iter()
            .rev()
            .filter(|e| from.map_or(true, |f| e.timestamp() >= f))
            .filter(|e| to.map_or(true, |t| e.timestamp() <= t))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.ids.contains(id)
    }

    pub fn latest(&self) -> Option<&LedgerEntry> {
        self.entries.last()
    }

    pub fn offset(&self) -> f64 {
        self.offset
    }

    /// Last known authoritative balance, if any.
    pub fn authoritative(&self) -> Option<f64> {
        self.authoritative
    }

    /// Display balance of the latest entry, else the authoritative balance, else 0.
    pub fn current_balance(&self) -> f64 {
        match self.entries.last() {
            Some(entry) => entry.display_balance,
            None => self.authoritative.unwrap_or(0.0),
        }
    }

    pub fn transactions(&self) -> impl Iterator<Item = &Transaction> {
        self.entries.iter().map(|e| &e.transaction)
    }

    /// Recompute running balances from `start` onward.
    pub(crate) fn recompute_running_from(&mut self, start: usize) {
        let mut running = match start {
            0 => 0.0,
            i => self.entries[i - 1].running_balance,
        };
        for entry in self.entries[start..].iter_mut() {
            running += entry.transaction.delta;
            entry.running_balance = running;
        }
    }

    /// Derive `offset` from the authoritative balance and the latest running balance.
    pub(crate) fn anchor_offset(&mut self) {
        self.offset = match (self.authoritative, self.entries.last()) {
            (Some(auth), Some(last)) => auth - last.running_balance,
            _ => 0.0,
        };
    }

    pub(crate) fn apply_offset(&mut self) {
        let offset = self.offset;
        for entry in self.entries.iter_mut() {
            entry.display_balance = entry.running_balance + offset;
        }
    }

    fn reindex(&mut self) {
        self.ids = self.entries.iter().map(|e| e.transaction.id.clone()).collect();
    }
}

/// Serialized form; the id index is rebuilt on the way in.
#[derive(Deserialize)]
struct LedgerParts {
    entries: Vec<LedgerEntry>,
    offset: f64,
    authoritative: Option<f64>,
}

impl From<LedgerParts> for Ledger {
    fn from(parts: LedgerParts) -> Self {
        let mut ledger = Ledger {
            entries: parts.entries,
            ids: HashSet::new(),
            offset: parts.offset,
            authoritative: parts.authoritative,
        };
        ledger.reindex();
        ledger
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::{build, MergeOutcome};
    use crate::models::ActionKind;
    use chrono::TimeZone;

    fn tx(id: &str, ms: i64, action: ActionKind, amount: f64) -> Transaction {
        Transaction::new(id, action, Utc.timestamp_millis_opt(ms).unwrap(), amount)
    }

    #[test]
    fn test_deserialized_ledger_still_dedupes() {
        let ledger = build(
            vec![
                tx("t1", 1_000, ActionKind::Scan, 10.0),
                tx("t2", 2_000, ActionKind::Redemption, 3.0),
            ],
            Some(9.0),
        );
        let json = serde_json::to_string(&ledger).unwrap();
        let mut restored: Ledger = serde_json::from_str(&json).unwrap();

        assert_eq!(restored, ledger);
        assert!(restored.contains("t2"));
        assert_eq!(
            restored.merge(tx("t2", 2_000, ActionKind::Redemption, 3.0)).unwrap(),
            MergeOutcome::Duplicate
        );
        assert_eq!(restored.len(), 2);
    }

    #[test]
    fn test_date_range_is_inclusive() {
        let ledger = build(
            vec![
                tx("a", 1_000, ActionKind::Scan, 1.0),
                tx("b", 2_000, ActionKind::Scan, 1.0),
                tx("c", 3_000, ActionKind::Scan, 1.0),
            ],
            None,
        );
        let from = Utc.timestamp_millis_opt(2_000).unwrap();
        let to = Utc.timestamp_millis_opt(3_000).unwrap();
        let ids: Vec<String> = ledger
            .display_entries_between(Some(from), Some(to))
            .iter()
            .map(|e| e.id().to_string())
            .collect();
        assert_eq!(ids, vec!["c", "b"]);
    }
}
