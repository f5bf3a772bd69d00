//! Ledger API handlers

use axum::{
    extract::ws::{Message, WebSocket, WebSocketUpgrade},
    extract::{Path, Query, State},
    http::StatusCode,
    response::{Json, Response},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, warn};

use crate::ledger::{Ledger, LedgerEntry};
use crate::live::{LedgerController, LedgerRegistry};

pub type AppState = Arc<LedgerRegistry>;

#[derive(Debug, Deserialize)]
pub struct RangeQuery {
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub entities: usize,
}

#[derive(Debug, Serialize)]
pub struct EntryView {
    #[serde(flatten)]
    pub entry: LedgerEntry,
    /// "A-<barcode>" / "M-<kind>"
    pub label: String,
}

impl From<LedgerEntry> for EntryView {
    fn from(entry: LedgerEntry) -> Self {
        let label = entry.transaction.display_label();
        Self { entry, label }
    }
}

#[derive(Debug, Serialize)]
pub struct LedgerResponse {
    pub entity: String,
    pub revision: u64,
    pub balance: f64,
    pub count: usize,
    pub entries: Vec<EntryView>,
}

#[derive(Debug, Serialize)]
pub struct BalanceResponse {
    pub entity: String,
    pub balance: f64,
    pub authoritative: Option<f64>,
    pub entries: usize,
}

/// Pushed on every ledger change
#[derive(Debug, Serialize)]
pub struct SnapshotMessage {
    pub entity: String,
    pub revision: u64,
    pub cause: &'static str,
    pub balance: f64,
    pub entries: Vec<EntryView>,
}

impl SnapshotMessage {
    fn new(entity: &str, revision: u64, cause: &'static str, ledger: &Ledger) -> Self {
        Self {
            entity: entity.to_string(),
            revision,
            cause,
            balance: ledger.current_balance(),
            entries: ledger.display_entries().into_iter().map(EntryView::from).collect(),
        }
    }
}

pub async fn health(State(registry): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        entities: registry.entities().len(),
    })
}

fn controller_for(registry: &LedgerRegistry, entity: &str) -> Result<Arc<LedgerController>, StatusCode> {
    registry.get(entity).ok_or(StatusCode::NOT_FOUND)
}

/// Newest-first ledger, optionally restricted to `from..=to`.
pub async fn get_ledger(
    State(registry): State<AppState>,
    Path(entity): Path<String>,
    Query(range): Query<RangeQuery>,
) -> Result<Json<LedgerResponse>, StatusCode> {
    if let (Some(from), Some(to)) = (range.from, range.to) {
        if from > to {
            return Err(StatusCode::BAD_REQUEST);
        }
    }

    let controller = controller_for(&registry, &entity)?;
    let (revision, ledger) = controller.versioned_snapshot();
    let entries: Vec<EntryView> = ledger
        .display_entries_between(range.from, range.to)
        .into_iter()
        .map(EntryView::from)
        .collect();

    Ok(Json(LedgerResponse {
        entity,
        revision,
        balance: ledger.current_balance(),
        count: entries.len(),
        entries,
    }))
}

pub async fn get_balance(
    State(registry): State<AppState>,
    Path(entity): Path<String>,
) -> Result<Json<BalanceResponse>, StatusCode> {
    let controller = controller_for(&registry, &entity)?;
    let ledger = controller.snapshot();
    Ok(Json(BalanceResponse {
        entity,
        balance: ledger.current_balance(),
        authoritative: ledger.authoritative(),
        entries: ledger.len(),
    }))
}

pub async fn stream_ledger(
    ws: WebSocketUpgrade,
    State(registry): State<AppState>,
    Path(entity): Path<String>,
) -> Result<Response, StatusCode> {
    let controller = controller_for(&registry, &entity)?;
    Ok(ws.on_upgrade(move |socket| handle_stream(socket, controller)))
}

fn current_snapshot(controller: &LedgerController) -> SnapshotMessage {
    let (revision, ledger) = controller.versioned_snapshot();
    SnapshotMessage::new(controller.entity(), revision, "snapshot", &ledger)
}

async fn send_snapshot(socket: &mut WebSocket, msg: &SnapshotMessage) -> bool {
    let text = match serde_json::to_string(msg) {
        Ok(text) => text,
        Err(e) => {
            warn!("Failed to serialize ledger snapshot: {}", e);
            return true;
        }
    };
    socket.send(Message::Text(text)).await.is_ok()
}

async fn handle_stream(mut socket: WebSocket, controller: Arc<LedgerController>) {
    // subscribe before the initial snapshot so nothing falls in between
    let mut rx = controller.subscribe();
    let initial = current_snapshot(&controller);
    if !send_snapshot(&mut socket, &initial).await {
        return;
    }

    loop {
        tokio::select! {
            update = rx.recv() => {
                let msg = match update {
                    Ok(update) => SnapshotMessage::new(
                        &update.entity,
                        update.revision,
                        update.cause.as_str(),
                        &update.ledger,
                    ),
                    Err(RecvError::Lagged(skipped)) => {
                        debug!(entity = controller.entity(), skipped, "Stream lagged; resending snapshot");
                        current_snapshot(&controller)
                    }
                    Err(RecvError::Closed) => break,
                };
                if !send_snapshot(&mut socket, &msg).await {
                    break;
                }
            }
            incoming = socket.recv() => match incoming {
                Some(Ok(Message::Text(text))) if text == "ping" => {
                    let _ = socket.send(Message::Text("pong".to_string())).await;
                }
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                Some(Ok(_)) => {}
            },
        }
    }
}
