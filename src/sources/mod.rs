//! External collaborators: the history/balance REST source and the live feed.

pub mod history_rest;
pub mod live_ws;

use anyhow::Result;

use crate::models::RawEvent;

pub use history_rest::HistoryRestClient;
pub use live_ws::{decode_frame, LiveFeedClient};

/// Bulk source for one entity's history and authoritative balance.
#[async_trait::async_trait]
pub trait HistorySource: Send + Sync {
    async fn fetch_transaction_history(&self, entity_id: &str) -> Result<Vec<RawEvent>>;

    /// `None` when the source reports no usable balance.
    async fn fetch_authoritative_balance(&self, entity_id: &str) -> Result<Option<f64>>;
}

/// One message from the live transport.
///
/// Delivery is at-least-once with no ordering guarantee across kinds.
#[derive(Debug, Clone, PartialEq)]
pub enum LiveEvent {
    Transaction(RawEvent),
    BalanceChanged(f64),
}
