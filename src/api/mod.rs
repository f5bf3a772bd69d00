//! HTTP presentation layer over the ledger registry.

pub mod routes;

use axum::{routing::get, Router};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::live::LedgerRegistry;

pub use routes::{AppState, EntryView, LedgerResponse, SnapshotMessage};

pub fn router(registry: Arc<LedgerRegistry>) -> Router {
    Router::new()
        .route("/health", get(routes::health))
        .route("/v1/ledger/:entity", get(routes::get_ledger))
        .route("/v1/ledger/:entity/stream", get(routes::stream_ledger))
        .route("/v1/balance/:entity", get(routes::get_balance))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(registry)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ActionKind, Transaction};
    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use chrono::{TimeZone, Utc};
    use futures_util::StreamExt;
    use serde_json::Value;
    use tower::ServiceExt;

    fn tx(id: &str, secs: i64, action: ActionKind, amount: f64) -> Transaction {
        Transaction::new(id, action, Utc.timestamp_opt(secs, 0).unwrap(), amount)
    }

    fn registry() -> Arc<LedgerRegistry> {
        let registry = Arc::new(LedgerRegistry::new(16));
        let c = registry.get_or_create("u1");
        let ticket = c.begin_load();
        c.install_bulk(
            ticket,
            vec![
                tx("t1", 1_000, ActionKind::Scan, 10.0),
                tx("t2", 2_000, ActionKind::Redemption, 3.0),
                tx("t3", 3_000, ActionKind::PointAdd, 4.0),
            ],
            Some(13.0),
        )
        .unwrap();
        registry
    }

    async fn get_json(app: Router, uri: &str) -> (StatusCode, Value) {
        let resp = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = resp.status();
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, body)
    }

    #[tokio::test]
    async fn test_health() {
        let (status, body) = get_json(router(registry()), "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["entities"], 1);
    }

    #[tokio::test]
    async fn test_ledger_newest_first() {
        let (status, body) = get_json(router(registry()), "/v1/ledger/u1").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["balance"], 13.0);
        assert_eq!(body["count"], 3);
        assert_eq!(body["revision"], 1);

        let entries = body["entries"].as_array().unwrap();
        let ids: Vec<&str> = entries.iter().map(|e| e["id"].as_str().unwrap()).collect();
        assert_eq!(ids, vec!["t3", "t2", "t1"]);
        assert_eq!(entries[0]["display_balance"], 13.0);
        assert_eq!(entries[0]["label"], "M-Add Point");
        assert_eq!(entries[2]["label"], "A-N/A");
    }

    #[tokio::test]
    async fn test_ledger_date_range() {
        // 1970-01-01T00:33:20Z == 2000s
        let (status, body) = get_json(
            router(registry()),
            "/v1/ledger/u1?from=1970-01-01T00:30:00Z&to=1970-01-01T00:33:20Z",
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["count"], 1);
        assert_eq!(body["entries"][0]["id"], "t2");

        let (status, _) = get_json(
            router(registry()),
            "/v1/ledger/u1?from=1970-01-02T00:00:00Z&to=1970-01-01T00:00:00Z",
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_balance_and_unknown_entity() {
        let (status, body) = get_json(router(registry()), "/v1/balance/u1").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["balance"], 13.0);
        assert_eq!(body["authoritative"], 13.0);
        assert_eq!(body["entries"], 3);

        let (status, _) = get_json(router(registry()), "/v1/balance/nobody").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = get_json(router(registry()), "/v1/ledger/nobody").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_stream_pushes_updates() {
        use tokio_tungstenite::tungstenite::Message;

        let registry = registry();
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = router(Arc::clone(&registry));
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{}/v1/ledger/u1/stream", addr))
            .await
            .unwrap();

        let next_json = |msg: Message| -> Value {
            match msg {
                Message::Text(text) => serde_json::from_str(&text).unwrap(),
                other => panic!("unexpected frame: {:?}", other),
            }
        };

        let initial = next_json(ws.next().await.unwrap().unwrap());
        assert_eq!(initial["cause"], "snapshot");
        assert_eq!(initial["revision"], 1);
        assert_eq!(initial["entries"].as_array().unwrap().len(), 3);

        registry
            .get("u1")
            .unwrap()
            .apply_transaction(tx("t4", 4_000, ActionKind::Scan, 2.0))
            .unwrap();

        let update = next_json(ws.next().await.unwrap().unwrap());
        assert_eq!(update["cause"], "merged");
        assert_eq!(update["revision"], 2);
        assert_eq!(update["entries"][0]["id"], "t4");
    }
}
