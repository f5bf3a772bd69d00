//! Live Merge Controller
//!
//! Sole owner of one entity's ledger. Writers are serialized by a mutex and
//! each mutation works on a private copy; the finished ledger is published
//! through `ArcSwap`, so readers see either the previous snapshot or the new
//! one, never a half-merged state.

use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::ledger::{self, Ledger, LedgerEntry, LedgerError, MergeOutcome};
use crate::models::{ActionKind, RawEvent, Transaction};

/// Why a new snapshot was published.
#[derive(Debug, Clone, PartialEq)]
pub enum UpdateCause {
    Built { transactions: usize },
    Merged { id: String, outcome: MergeOutcome },
    Reconciled { authoritative: f64 },
    Reset,
}

impl UpdateCause {
    pub fn as_str(&self) -> &'static str {
        match self {
            UpdateCause::Built { .. } => "built",
            UpdateCause::Merged { .. } => "merged",
            UpdateCause::Reconciled { .. } => "reconciled",
            UpdateCause::Reset => "reset",
        }
    }
}

/// Change notification carrying the new snapshot.
#[derive(Debug, Clone)]
pub struct LedgerUpdate {
    pub entity: String,
    pub revision: u64,
    pub cause: UpdateCause,
    pub ledger: Arc<Ledger>,
}

/// Issued when a bulk load starts; presented again when it finishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadTicket {
    epoch: u64,
    balance_seq: u64,
    live_seq: u64,
}

impl LoadTicket {
    pub fn epoch(&self) -> u64 {
        self.epoch
    }
}

/// Result of installing a bulk load.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InstallOutcome {
    pub transactions: usize,
    /// Live-merged entries that were not in the bulk history and got re-applied
    pub carried_over: usize,
    /// A balance-changed event arrived during the load and won over the fetched balance
    pub kept_live_balance: bool,
}

/// Counters
#[derive(Debug, Default)]
pub struct LedgerStats {
    merged: AtomicU64,
    late_inserts: AtomicU64,
    duplicates: AtomicU64,
    unknown_actions: AtomicU64,
    malformed_events: AtomicU64,
    reconciliations: AtomicU64,
    bulk_loads: AtomicU64,
    stale_loads: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LedgerStatsSnapshot {
    pub merged: u64,
    pub late_inserts: u64,
    pub duplicates: u64,
    pub unknown_actions: u64,
    pub malformed_events: u64,
    pub reconciliations: u64,
    pub bulk_loads: u64,
    pub stale_loads: u64,
}

impl LedgerStats {
    #[inline]
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> LedgerStatsSnapshot {
        LedgerStatsSnapshot {
            merged: self.merged.load(Ordering::Relaxed),
            late_inserts: self.late_inserts.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            unknown_actions: self.unknown_actions.load(Ordering::Relaxed),
            malformed_events: self.malformed_events.load(Ordering::Relaxed),
            reconciliations: self.reconciliations.load(Ordering::Relaxed),
            bulk_loads: self.bulk_loads.load(Ordering::Relaxed),
            stale_loads: self.stale_loads.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Default)]
struct WriteState {
    /// Bumped on reset; bulk loads from an older epoch are discarded
    epoch: u64,
    revision: u64,
    /// Bumped on every explicit balance change
    balance_seq: u64,
    /// Bumped on every live merge that changed the ledger
    live_seq: u64,
    /// Live-merged ids not yet covered by an installed bulk load, tagged with
    /// their `live_seq`
    live_merged: Vec<(u64, String)>,
}

/// A published ledger and the revision it was published under.
#[derive(Debug, Default)]
struct Published {
    revision: u64,
    ledger: Arc<Ledger>,
}

pub struct LedgerController {
    entity: String,
    current: ArcSwap<Published>,
    write: Mutex<WriteState>,
    update_tx: broadcast::Sender<LedgerUpdate>,
    stats: LedgerStats,
}

impl LedgerController {
    pub fn new(entity: impl Into<String>, update_capacity: usize) -> Self {
        let (update_tx, _) = broadcast::channel(update_capacity.max(1));
        Self {
            entity: entity.into(),
            current: ArcSwap::new(Arc::new(Published::default())),
            write: Mutex::new(WriteState::default()),
            update_tx,
            stats: LedgerStats::default(),
        }
    }

    pub fn entity(&self) -> &str {
        &self.entity
    }

    /// Subscribe to snapshot updates.
    pub fn subscribe(&self) -> broadcast::Receiver<LedgerUpdate> {
        self.update_tx.subscribe()
    }

    pub fn snapshot(&self) -> Arc<Ledger> {
        Arc::clone(&self.current.load().ledger)
    }

    /// The current ledger together with its revision, read atomically.
    pub fn versioned_snapshot(&self) -> (u64, Arc<Ledger>) {
        let published = self.current.load();
        (published.revision, Arc::clone(&published.ledger))
    }

    /// Newest-first entries.
    pub fn display_ledger(&self) -> Vec<LedgerEntry> {
        self.current.load().ledger.display_entries()
    }

    pub fn display_ledger_between(
        &self,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> Vec<LedgerEntry> {
        self.current.load().ledger.display_entries_between(from, to)
    }

    pub fn current_balance(&self) -> f64 {
        self.current.load().ledger.current_balance()
    }

    pub fn stats(&self) -> LedgerStatsSnapshot {
        self.stats.snapshot()
    }

    pub fn revision(&self) -> u64 {
        self.current.load().revision
    }

    /// Normalize and merge one raw live event.
    pub fn apply_raw(&self, raw: &RawEvent) -> ledger::Result<MergeOutcome> {
        match ledger::normalize(raw) {
            Ok(tx) => self.apply_transaction(tx),
            Err(e) => {
                self.note_malformed(&e);
                Err(e)
            }
        }
    }

    /// Count and log an event that could not be placed.
    pub fn note_malformed(&self, err: &LedgerError) {
        LedgerStats::bump(&self.stats.malformed_events);
        warn!(entity = %self.entity, error = %err, "Dropping malformed event");
    }

    /// Merge one normalized transaction.
    pub fn apply_transaction(&self, tx: Transaction) -> ledger::Result<MergeOutcome> {
        self.note_unknown(&tx);
        let id = tx.id.clone();

        let mut state = self.write.lock();
        let mut next = Ledger::clone(&self.current.load().ledger);
        let outcome = next.merge(tx).map_err(|e| {
            warn!(entity = %self.entity, id = %id, error = %e, "Merge rejected");
            e
        })?;

        match outcome {
            MergeOutcome::Duplicate => {
                LedgerStats::bump(&self.stats.duplicates);
                debug!(entity = %self.entity, id = %id, "Duplicate delivery absorbed");
                return Ok(outcome);
            }
            MergeOutcome::Inserted { index } => {
                LedgerStats::bump(&self.stats.late_inserts);
                debug!(entity = %self.entity, id = %id, index, "Late transaction inserted");
            }
            MergeOutcome::Appended => {}
        }
        LedgerStats::bump(&self.stats.merged);
        state.live_seq += 1;
        let seq = state.live_seq;
        state.live_merged.push((seq, id.clone()));

        self.publish(&mut state, next, UpdateCause::Merged { id, outcome });
        Ok(outcome)
    }

    /// Re-anchor to a fresh authoritative balance.
    pub fn reconcile(&self, authoritative: f64) -> ledger::Result<()> {
        let mut state = self.write.lock();
        let mut next = Ledger::clone(&self.current.load().ledger);
        if let Err(e) = next.reconcile(authoritative) {
            warn!(entity = %self.entity, error = %e, "Ignoring balance update");
            return Err(e);
        }
        state.balance_seq += 1;
        LedgerStats::bump(&self.stats.reconciliations);
        self.publish(&mut state, next, UpdateCause::Reconciled { authoritative });
        Ok(())
    }

    /// Start a bulk load.
    pub fn begin_load(&self) -> LoadTicket {
        let state = self.write.lock();
        LoadTicket {
            epoch: state.epoch,
            balance_seq: state.balance_seq,
            live_seq: state.live_seq,
        }
    }

    /// Install a bulk-built ledger.
    ///
    /// Rejected with [`LedgerError::StaleLoad`] when the controller was reset
    /// after `ticket` was issued. Transactions merged live while the load was
    /// in flight are re-applied on top of the fresh history; anything else the
    /// history no longer reports is dropped. A balance
    /// received live during the load wins over `authoritative`.
    pub fn install_bulk(
        &self,
        ticket: LoadTicket,
        transactions: Vec<Transaction>,
        authoritative: Option<f64>,
    ) -> ledger::Result<InstallOutcome> {
        for tx in &transactions {
            self.note_unknown(tx);
        }

        let mut state = self.write.lock();
        if ticket.epoch != state.epoch {
            LedgerStats::bump(&self.stats.stale_loads);
            warn!(
                entity = %self.entity,
                ticket_epoch = ticket.epoch,
                current_epoch = state.epoch,
                "Discarding stale bulk load"
            );
            return Err(LedgerError::StaleLoad {
                ticket_epoch: ticket.epoch,
                current_epoch: state.epoch,
            });
        }

        let previous = Arc::clone(&self.current.load().ledger);
        let kept_live_balance = state.balance_seq != ticket.balance_seq;
        let anchor = if kept_live_balance {
            previous.authoritative()
        } else {
            authoritative
        };

        let count = transactions.len();
        let bulk_ids: HashSet<String> = transactions.iter().map(|t| t.id.clone()).collect();
        let mut next = ledger::build(transactions, anchor);

        let live_ids: HashSet<&str> = state
            .live_merged
            .iter()
            .filter(|(seq, _)| *seq > ticket.live_seq)
            .map(|(_, id)| id.as_str())
            .collect();

        let mut carried_over = 0;
        for tx in previous
            .transactions()
            .filter(|t| live_ids.contains(t.id.as_str()) && !bulk_ids.contains(&t.id))
        {
            if next.merge(tx.clone())?.changed() {
                carried_over += 1;
            }
        }
        // anything merged before this load began is now covered by its history
        state.live_merged.retain(|(seq, _)| *seq > ticket.live_seq);

        LedgerStats::bump(&self.stats.bulk_loads);
        info!(
            entity = %self.entity,
            transactions = count,
            carried_over,
            kept_live_balance,
            balance = next.current_balance(),
            "✅ Ledger built from history"
        );

        self.publish(&mut state, next, UpdateCause::Built { transactions: count });
        Ok(InstallOutcome {
            transactions: count,
            carried_over,
            kept_live_balance,
        })
    }

    /// Discard the ledger (logout / entity switch). Pending bulk loads become stale.
    pub fn reset(&self) {
        let mut state = self.write.lock();
        state.epoch += 1;
        state.balance_seq = 0;
        state.live_merged.clear();
        info!(entity = %self.entity, epoch = state.epoch, "Ledger reset");
        self.publish(&mut state, Ledger::empty(), UpdateCause::Reset);
    }

    fn publish(&self, state: &mut WriteState, ledger: Ledger, cause: UpdateCause) {
        state.revision += 1;
        let ledger = Arc::new(ledger);
        self.current.store(Arc::new(Published {
            revision: state.revision,
            ledger: Arc::clone(&ledger),
        }));
        // no receivers is fine
        let _ = self.update_tx.send(LedgerUpdate {
            entity: self.entity.clone(),
            revision: state.revision,
            cause,
            ledger,
        });
    }

    fn note_unknown(&self, tx: &Transaction) {
        if tx.action == ActionKind::Unknown {
            LedgerStats::bump(&self.stats.unknown_actions);
            warn!(
                entity = %self.entity,
                id = %tx.id,
                action = tx.metadata.action_tag.as_deref().unwrap_or("<missing>"),
                "Unrecognized action kind; treating as balance-neutral"
            );
        }
    }
}
