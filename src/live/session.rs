//! Ledger session for one entity
//!
//! Drives the bulk history load and the live event pump against a single
//! [`LedgerController`]. The bulk load is the only step that waits on I/O;
//! it can be cancelled, and its result is dropped if the controller was reset
//! in the meantime.

use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use super::controller::{InstallOutcome, LedgerController};
use crate::ledger::{self, LedgerError};
use crate::sources::{HistorySource, LiveEvent};

pub struct LedgerSession {
    controller: Arc<LedgerController>,
    source: Arc<dyn HistorySource>,
}

impl LedgerSession {
    pub fn new(controller: Arc<LedgerController>, source: Arc<dyn HistorySource>) -> Self {
        Self { controller, source }
    }

    pub fn controller(&self) -> &Arc<LedgerController> {
        &self.controller
    }

    /// Fetch history and balance, rebuild, install.
    ///
    /// On any failure the previously installed ledger stays in place.
    pub async fn refresh(&self) -> Result<InstallOutcome> {
        let entity = self.controller.entity();
        let ticket = self.controller.begin_load();
        debug!(entity, epoch = ticket.epoch(), "Starting bulk load");

        let (raws, balance) = tokio::try_join!(
            self.source.fetch_transaction_history(entity),
            self.source.fetch_authoritative_balance(entity),
        )
        .with_context(|| format!("Bulk load for {} failed", entity))?;

        let (transactions, rejected) = ledger::normalize_batch(&raws);
        for err in &rejected {
            self.controller.note_malformed(err);
        }
        if balance.is_none() {
            warn!(
                entity,
                "No authoritative balance reported; trusting ledger arithmetic"
            );
        }

        let outcome = self.controller.install_bulk(ticket, transactions, balance)?;
        Ok(outcome)
    }

    /// [`refresh`](Self::refresh), abandoned if `shutdown` fires first.
    ///
    /// Returns `Ok(None)` when cancelled; nothing is installed in that case.
    pub async fn refresh_or_cancel(
        &self,
        shutdown: &mut broadcast::Receiver<()>,
    ) -> Result<Option<InstallOutcome>> {
        tokio::select! {
            res = self.refresh() => res.map(Some),
            _ = shutdown.recv() => {
                info!(entity = self.controller.entity(), "Bulk load cancelled");
                Ok(None)
            }
        }
    }

    /// Apply one live event.
    pub fn handle_live(&self, event: LiveEvent) -> Result<(), LedgerError> {
        match event {
            LiveEvent::Transaction(raw) => self.controller.apply_raw(&raw).map(|_| ()),
            LiveEvent::BalanceChanged(points) => self.controller.reconcile(points),
        }
    }

    /// Apply live events strictly in delivery order until the channel closes
    /// or shutdown fires. Returns the number of events consumed.
    pub async fn pump(
        &self,
        mut events: mpsc::UnboundedReceiver<LiveEvent>,
        mut shutdown: broadcast::Receiver<()>,
    ) -> u64 {
        let mut consumed = 0u64;
        loop {
            tokio::select! {
                biased;
                _ = shutdown.recv() => break,
                event = events.recv() => match event {
                    Some(event) => {
                        consumed += 1;
                        // already logged and counted by the controller
                        let _ = self.handle_live(event);
                    }
                    None => break,
                },
            }
        }
        debug!(entity = self.controller.entity(), consumed, "Live pump stopped");
        consumed
    }
}
