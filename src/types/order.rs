use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn opposite(&self) -> Self {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "buy",
            Side::Sell => "sell",
        }
    }

    pub fn is_buy(&self) -> bool {
        matches!(self, Side::Buy)
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OrderType {
    Market,
    Stop { trigger: f64 },
    Limit { price: f64 },
}

impl OrderType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderType::Market => "market",
            OrderType::Stop { .. } => "stop",
            OrderType::Limit { .. } => "limit",
        }
    }

    pub fn price(&self) -> Option<f64> {
        match self {
            OrderType::Market => None,
            OrderType::Stop { trigger } => Some(*trigger),
            OrderType::Limit { price } => Some(*price),
        }
    }
}

/// Internal order lifecycle: `Pending` until the venue reports a terminal
/// state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    Pending,
    Filled,
    Cancelled,
    Rejected,
}

impl OrderStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, OrderStatus::Pending)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "pending",
            OrderStatus::Filled => "filled",
            OrderStatus::Cancelled => "cancelled",
            OrderStatus::Rejected => "rejected",
        }
    }
}

/// Maps a raw venue status string into the internal lifecycle. A status we do
/// not recognize resolves to `Cancelled` only when there is no local position
/// backing the order; otherwise it is left untouched (`None`).
pub fn map_venue_status(raw: &str, has_local_position: bool) -> Option<OrderStatus> {
    match raw {
        "filled" | "triggered" => Some(OrderStatus::Filled),
        "canceled" | "marginCanceled" => Some(OrderStatus::Cancelled),
        "rejected" => Some(OrderStatus::Rejected),
        "open" | "resting" => Some(OrderStatus::Pending),
        _ if !has_local_position => Some(OrderStatus::Cancelled),
        _ => None,
    }
}

/// Role of an order within a position: the entry itself or one of its
/// protective orders.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderTag {
    Entry,
    StopLoss,
    TakeProfit(u8),
    Trail,
}

impl OrderTag {
    pub fn to_label(&self) -> String {
        match self {
            OrderTag::Entry => "entry".to_string(),
            OrderTag::StopLoss => "sl".to_string(),
            OrderTag::TakeProfit(n) => format!("tp{}", n),
            OrderTag::Trail => "trail".to_string(),
        }
    }

    pub fn from_label(s: &str) -> Option<Self> {
        match s {
            "entry" => Some(OrderTag::Entry),
            "sl" => Some(OrderTag::StopLoss),
            "trail" => Some(OrderTag::Trail),
            _ => s
                .strip_prefix("tp")
                .and_then(|n| n.parse::<u8>().ok())
                .map(OrderTag::TakeProfit),
        }
    }
}

/// Local record of an order we sent to the venue. Cross-references are by id,
/// never by pointer: orders carry the signal's `alert_id`, fills carry the
/// order's `id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderRecord {
    pub id: String,
    pub signal_id: Option<String>,
    pub venue_order_id: Option<u64>,
    pub coin: String,
    pub side: Side,
    pub size: f64,
    pub order_type: OrderType,
    pub tag: OrderTag,
    pub status: OrderStatus,
    pub reduce_only: bool,
    pub mode: String,
    pub created_at: DateTime<Utc>,
    pub filled_at: Option<DateTime<Utc>>,
}

impl OrderRecord {
    pub fn new(
        coin: &str,
        side: Side,
        size: f64,
        order_type: OrderType,
        tag: OrderTag,
        mode: &str,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            signal_id: None,
            venue_order_id: None,
            coin: coin.to_string(),
            side,
            size,
            order_type,
            tag,
            status: OrderStatus::Pending,
            reduce_only: !matches!(tag, OrderTag::Entry),
            mode: mode.to_string(),
            created_at: Utc::now(),
            filled_at: None,
        }
    }

    pub fn with_signal(mut self, alert_id: &str) -> Self {
        self.signal_id = Some(alert_id.to_string());
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fill {
    pub order_id: String,
    pub price: f64,
    pub size: f64,
    pub fee: f64,
    pub timestamp: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn venue_status_mapping() {
        assert_eq!(map_venue_status("filled", true), Some(OrderStatus::Filled));
        assert_eq!(map_venue_status("triggered", true), Some(OrderStatus::Filled));
        assert_eq!(map_venue_status("canceled", true), Some(OrderStatus::Cancelled));
        assert_eq!(
            map_venue_status("marginCanceled", true),
            Some(OrderStatus::Cancelled)
        );
        assert_eq!(map_venue_status("rejected", true), Some(OrderStatus::Rejected));
    }

    #[test]
    fn unknown_status_without_position_cancels() {
        assert_eq!(map_venue_status("weird", false), Some(OrderStatus::Cancelled));
    }

    #[test]
    fn unknown_status_with_position_is_left_alone() {
        assert_eq!(map_venue_status("weird", true), None);
    }

    #[test]
    fn tag_labels_roundtrip() {
        for tag in [
            OrderTag::Entry,
            OrderTag::StopLoss,
            OrderTag::TakeProfit(1),
            OrderTag::TakeProfit(3),
            OrderTag::Trail,
        ] {
            assert_eq!(OrderTag::from_label(&tag.to_label()), Some(tag));
        }
    }
}
