//! Transaction Normalizer
//!
//! Turns a raw history/live event into a canonical [`Transaction`].
//! Every accepted field name lives in [`NormalizationTable`], so the input
//! contract can be audited in one place.

use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::ledger::error::{LedgerError, Result};
use crate::models::{ActionKind, RawEvent, Transaction, TransactionMetadata};

/// A nested field path inside a raw event.
pub type FieldPath = &'static [&'static str];

/// Candidate field paths for each canonical field, highest priority first.
#[derive(Debug, Clone, Copy)]
pub struct NormalizationTable {
    pub id: &'static [FieldPath],
    pub action: &'static [FieldPath],
    pub timestamp: &'static [FieldPath],
    pub amount: &'static [FieldPath],
    pub barcode: &'static [FieldPath],
    pub details: FieldPath,
}

pub const DEFAULT_TABLE: NormalizationTable = NormalizationTable {
    id: &[&["_id"], &["id"]],
    action: &[&["action"]],
    timestamp: &[&["createdAt"], &["created_at"], &["timestamp"]],
    amount: &[&["details", "amount"], &["details", "points"], &["points"]],
    barcode: &[&["details", "barcode"], &["details", "value"], &["barcode"]],
    details: &["details"],
};

impl Default for NormalizationTable {
    fn default() -> Self {
        DEFAULT_TABLE
    }
}

/// Normalize with the default table.
pub fn normalize(raw: &RawEvent) -> Result<Transaction> {
    normalize_with(&DEFAULT_TABLE, raw)
}

pub fn normalize_with(table: &NormalizationTable, raw: &RawEvent) -> Result<Transaction> {
    if !raw.0.is_object() {
        return Err(LedgerError::malformed("event is not a JSON object"));
    }

    let timestamp = table
        .timestamp
        .iter()
        .find_map(|path| raw.lookup(path).and_then(parse_timestamp))
        .ok_or_else(|| LedgerError::malformed("no usable timestamp"))?;

    let action_tag = first_string(raw, table.action);
    let action = action_tag
        .as_deref()
        .map(ActionKind::from_tag)
        .unwrap_or(ActionKind::Unknown);

    let raw_amount = table
        .amount
        .iter()
        .find_map(|path| raw.lookup(path).and_then(parse_number))
        .map(f64::abs)
        .unwrap_or(0.0);

    let id = first_string(raw, table.id).unwrap_or_else(|| content_id(raw));

    let metadata = TransactionMetadata {
        action_tag,
        barcode: first_string(raw, table.barcode),
        details: raw.lookup(table.details).cloned(),
    };

    Ok(Transaction::new(id, action, timestamp, raw_amount).with_metadata(metadata))
}

/// Normalize a batch without aborting on bad events.
///
/// Returns the placeable transactions (input order preserved) and the
/// rejected events' errors.
pub fn normalize_batch(raws: &[RawEvent]) -> (Vec<Transaction>, Vec<LedgerError>) {
    let mut transactions = Vec::with_capacity(raws.len());
    let mut rejected = Vec::new();
    for raw in raws {
        match normalize(raw) {
            Ok(tx) => transactions.push(tx),
            Err(e) => rejected.push(e),
        }
    }
    (transactions, rejected)
}

fn first_string(raw: &RawEvent, paths: &[FieldPath]) -> Option<String> {
    paths.iter().find_map(|path| match raw.lookup(path)? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    })
}

/// JSON numbers and numeric strings both count.
fn parse_number(value: &Value) -> Option<f64> {
    let n = match value {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => s.trim().parse::<f64>().ok()?,
        _ => return None,
    };
    n.is_finite().then_some(n)
}

/// RFC 3339 strings or epoch milliseconds.
fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => DateTime::parse_from_rfc3339(s.trim())
            .map(|dt| dt.with_timezone(&Utc))
            .ok()
            .or_else(|| s.trim().parse::<i64>().ok().and_then(millis_to_utc)),
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.is_finite()).map(|f| f as i64))
            .and_then(millis_to_utc),
        _ => None,
    }
}

fn millis_to_utc(ms: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms).single()
}

/// Deterministic id for events that carry none, so redelivery still dedupes.
fn content_id(raw: &RawEvent) -> String {
    let canonical = raw.0.to_string();
    let digest = Sha256::digest(canonical.as_bytes());
    format!("sha256:{}", hex::encode(&digest[..16]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn raw(value: Value) -> RawEvent {
        RawEvent::new(value)
    }

    #[test]
    fn test_amount_priority() {
        let tx = normalize(&raw(json!({
            "_id": "h1",
            "action": "scan",
            "createdAt": "2025-03-01T10:00:00Z",
            "details": {"amount": 10, "points": 99},
            "points": 77
        })))
        .unwrap();
        assert_eq!(tx.raw_amount, 10.0);
        assert_eq!(tx.delta, 10.0);

        let tx = normalize(&raw(json!({
            "_id": "h2",
            "action": "scan",
            "createdAt": "2025-03-01T10:00:00Z",
            "details": {"points": 4},
            "points": 77
        })))
        .unwrap();
        assert_eq!(tx.raw_amount, 4.0);

        let tx = normalize(&raw(json!({
            "_id": "h3",
            "action": "point_add",
            "createdAt": "2025-03-01T10:00:00Z",
            "points": "12"
        })))
        .unwrap();
        assert_eq!(tx.delta, 12.0);
    }

    #[test]
    fn test_non_numeric_candidate_is_skipped() {
        let tx = normalize(&raw(json!({
            "_id": "h1",
            "action": "redemption",
            "createdAt": "2025-03-01T10:00:00Z",
            "details": {"amount": "lots", "points": 6}
        })))
        .unwrap();
        assert_eq!(tx.raw_amount, 6.0);
        assert_eq!(tx.delta, -6.0);
    }

    #[test]
    fn test_missing_amount_defaults_to_zero() {
        let tx = normalize(&raw(json!({
            "_id": "h1",
            "action": "scan",
            "createdAt": 1_700_000_000_000i64
        })))
        .unwrap();
        assert_eq!(tx.raw_amount, 0.0);
        assert_eq!(tx.delta, 0.0);
        assert_eq!(tx.timestamp.timestamp_millis(), 1_700_000_000_000);
    }

    #[test]
    fn test_decreasing_kinds_take_magnitude() {
        for action in ["manual", "point_redeem", "cash_reward", "redemption"] {
            let tx = normalize(&raw(json!({
                "_id": action,
                "action": action,
                "createdAt": "2025-03-01T10:00:00Z",
                "details": {"amount": -8}
            })))
            .unwrap();
            assert_eq!(tx.raw_amount, 8.0, "{}", action);
            assert_eq!(tx.delta, -8.0, "{}", action);
        }
    }

    #[test]
    fn test_unknown_action_is_balance_neutral() {
        let tx = normalize(&raw(json!({
            "_id": "h1",
            "action": "bonus_spin",
            "createdAt": "2025-03-01T10:00:00Z",
            "details": {"amount": 50}
        })))
        .unwrap();
        assert_eq!(tx.action, ActionKind::Unknown);
        assert_eq!(tx.raw_amount, 50.0);
        assert_eq!(tx.delta, 0.0);
        assert_eq!(tx.metadata.action_tag.as_deref(), Some("bonus_spin"));
    }

    #[test]
    fn test_missing_timestamp_is_malformed() {
        let err = normalize(&raw(json!({"_id": "h1", "action": "scan", "points": 3}))).unwrap_err();
        assert!(matches!(err, LedgerError::MalformedEvent { .. }));

        let err = normalize(&raw(json!(["not", "an", "object"]))).unwrap_err();
        assert!(matches!(err, LedgerError::MalformedEvent { .. }));
    }

    #[test]
    fn test_synthesized_id_is_deterministic() {
        let event = json!({"action": "scan", "createdAt": "2025-03-01T10:00:00Z", "points": 3});
        let a = normalize(&raw(event.clone())).unwrap();
        let b = normalize(&raw(event)).unwrap();
        assert!(a.id.starts_with("sha256:"));
        assert_eq!(a.id, b.id);

        let other = normalize(&raw(json!({"action": "scan", "createdAt": "2025-03-01T10:00:00Z", "points": 4})))
            .unwrap();
        assert_ne!(a.id, other.id);
    }

    #[test]
    fn test_numeric_id_and_barcode_metadata() {
        let tx = normalize(&raw(json!({
            "id": 42,
            "action": "scan",
            "timestamp": "1700000000000",
            "details": {"value": "8901234567890", "amount": 5}
        })))
        .unwrap();
        assert_eq!(tx.id, "42");
        assert_eq!(tx.metadata.barcode.as_deref(), Some("8901234567890"));
        assert_eq!(tx.display_label(), "A-8901234567890");
    }

    #[test]
    fn test_batch_keeps_going_past_bad_events() {
        let raws = vec![
            raw(json!({"_id": "a", "action": "scan", "createdAt": "2025-03-01T10:00:00Z", "points": 1})),
            raw(json!({"_id": "b", "action": "scan"})),
            raw(json!({"_id": "c", "action": "scan", "createdAt": "2025-03-01T11:00:00Z", "points": 2})),
        ];
        let (txs, rejected) = normalize_batch(&raws);
        assert_eq!(txs.iter().map(|t| t.id.as_str()).collect::<Vec<_>>(), vec!["a", "c"]);
        assert_eq!(rejected.len(), 1);
    }
}
