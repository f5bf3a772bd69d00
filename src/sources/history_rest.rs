//! History REST client
//!
//! - `GET {base}/history/user/{id}` → array of raw history events
//! - `GET {base}/users/{id}` → profile carrying the authoritative points total

use anyhow::{Context, Result};
use reqwest::Client;
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, warn};

use super::HistorySource;
use crate::models::RawEvent;

#[derive(Clone)]
pub struct HistoryRestClient {
    client: Client,
    base_url: String,
}

impl HistoryRestClient {
    pub fn new(base_url: &str, auth_token: Option<&str>, timeout: Duration) -> Result<Self> {
        let mut headers = reqwest::header::HeaderMap::new();
        if let Some(token) = auth_token {
            // the backend expects the bare token, no scheme
            headers.insert(
                reqwest::header::AUTHORIZATION,
                token.parse().context("Invalid auth token")?,
            );
        }

        let client = Client::builder()
            .timeout(timeout)
            .pool_max_idle_per_host(4)
            .pool_idle_timeout(Duration::from_secs(90))
            .tcp_keepalive(Duration::from_secs(60))
            .default_headers(headers)
            .build()
            .context("Failed to build HistoryRestClient")?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    #[inline]
    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn get_json(&self, path: &str) -> Result<Value> {
        let url = self.url(path);
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("GET {} failed", path))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(anyhow::anyhow!("GET {} {}: {}", path, status, text));
        }

        resp.json::<Value>()
            .await
            .with_context(|| format!("Failed to parse {} response", path))
    }
}

#[async_trait::async_trait]
impl HistorySource for HistoryRestClient {
    async fn fetch_transaction_history(&self, entity_id: &str) -> Result<Vec<RawEvent>> {
        let body = self.get_json(&format!("/history/user/{}", entity_id)).await?;
        let events = history_from_body(body);
        debug!(entity = entity_id, count = events.len(), "Fetched history");
        Ok(events)
    }

    async fn fetch_authoritative_balance(&self, entity_id: &str) -> Result<Option<f64>> {
        let body = self.get_json(&format!("/users/{}", entity_id)).await?;
        Ok(balance_from_profile(&body))
    }
}

/// Anything other than an array is an empty history.
pub fn history_from_body(body: Value) -> Vec<RawEvent> {
    match body {
        Value::Array(items) => items.into_iter().map(RawEvent::new).collect(),
        other => {
            warn!(kind = json_kind(&other), "History response is not an array; treating as empty");
            Vec::new()
        }
    }
}

/// `points`, then `totalPoints`; only real JSON numbers count.
pub fn balance_from_profile(profile: &Value) -> Option<f64> {
    ["points", "totalPoints"]
        .iter()
        .find_map(|key| profile.get(*key).and_then(Value::as_f64))
        .filter(|b| b.is_finite())
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
