use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Raw transaction event as delivered by the history endpoint or the live feed.
///
/// The shape is source-defined; the normalizer decides which fields matter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RawEvent(pub Value);

impl RawEvent {
    pub fn new(value: Value) -> Self {
        Self(value)
    }

    /// Walk a nested object path, e.g. `["details", "amount"]`.
    pub fn lookup(&self, path: &[&str]) -> Option<&Value> {
        let mut cursor = &self.0;
        for key in path {
            cursor = cursor.as_object()?.get(*key)?;
        }
        if cursor.is_null() {
            None
        } else {
            Some(cursor)
        }
    }
}

impl From<Value> for RawEvent {
    fn from(value: Value) -> Self {
        Self(value)
    }
}

/// Transaction kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Scan,
    Manual,
    PointAdd,
    PointRedeem,
    CashReward,
    Redemption,
    Unknown,
}

impl ActionKind {
    pub fn from_tag(tag: &str) -> Self {
        match tag {
            "scan" => ActionKind::Scan,
            "manual" => ActionKind::Manual,
            "point_add" => ActionKind::PointAdd,
            "point_redeem" => ActionKind::PointRedeem,
            "cash_reward" => ActionKind::CashReward,
            "redemption" => ActionKind::Redemption,
            _ => ActionKind::Unknown,
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            ActionKind::Scan => "scan",
            ActionKind::Manual => "manual",
            ActionKind::PointAdd => "point_add",
            ActionKind::PointRedeem => "point_redeem",
            ActionKind::CashReward => "cash_reward",
            ActionKind::Redemption => "redemption",
            ActionKind::Unknown => "unknown",
        }
    }

    /// Scans and point grants add to the balance.
    pub fn is_balance_increasing(&self) -> bool {
        matches!(self, ActionKind::Scan | ActionKind::PointAdd)
    }

    /// Signed change for a non-negative magnitude. Unknown kinds never move the balance.
    pub fn signed(&self, raw_amount: f64) -> f64 {
        match self {
            ActionKind::Unknown => 0.0,
            kind if kind.is_balance_increasing() => raw_amount.abs(),
            _ => -raw_amount.abs(),
        }
    }
}

/// Display-only fields carried alongside a transaction.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TransactionMetadata {
    /// Action tag exactly as received (useful when the kind is `Unknown`)
    pub action_tag: Option<String>,
    pub barcode: Option<String>,
    pub details: Option<Value>,
}

/// Canonical transaction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: String,
    pub action: ActionKind,
    pub timestamp: DateTime<Utc>,
    pub raw_amount: f64,
    pub delta: f64,
    #[serde(default)]
    pub metadata: TransactionMetadata,
}

impl Transaction {
    pub fn new(id: impl Into<String>, action: ActionKind, timestamp: DateTime<Utc>, raw_amount: f64) -> Self {
        let raw_amount = raw_amount.abs();
        Self {
            id: id.into(),
            action,
            timestamp,
            raw_amount,
            delta: action.signed(raw_amount),
            metadata: TransactionMetadata::default(),
        }
    }

    pub fn with_metadata(mut self, metadata: TransactionMetadata) -> Self {
        self.metadata = metadata;
        self
    }

    /// Short row label, e.g. `A-8901234567890` for a scan or `M-Redeem`.
    pub fn display_label(&self) -> String {
        let (kind, details) = match self.action {
            ActionKind::Scan => ("A", self.metadata.barcode.as_deref().unwrap_or("N/A")),
            ActionKind::Manual => ("M", "Manual Entry"),
            ActionKind::PointAdd => ("M", "Add Point"),
            ActionKind::PointRedeem | ActionKind::Redemption => ("M", "Redeem"),
            ActionKind::CashReward => ("M", "Cash Reward"),
            ActionKind::Unknown => ("N/A", "N/A"),
        };
        format!("{}-{}", kind, details)
    }
}
