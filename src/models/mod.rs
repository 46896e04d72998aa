pub mod portfolio;
pub mod position;

pub use portfolio::PortfolioSnapshot;
pub use position::{MirrorPosition, Position, PositionKey};

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

// ---------------------------------------------------------------------------
// Side
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn from_api_str(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "BUY" | "0" => Some(Side::Buy),
            "SELL" | "1" => Some(Side::Sell),
            _ => None,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Buy => write!(f, "BUY"),
            Side::Sell => write!(f, "SELL"),
        }
    }
}

// ---------------------------------------------------------------------------
// FillEvent — core pipeline message
// ---------------------------------------------------------------------------

/// A previously-unseen leader fill, enriched with the leader's config by the
/// trade monitor. Consumed exactly once by the risk manager and executor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FillEvent {
    /// Idempotency key. Derived from the transaction hash when the venue
    /// provides one, otherwise from (timestamp, token, side, price).
    pub trade_id: String,
    pub leader_wallet: String,
    pub leader_name: String,
    pub allocated_capital: Decimal,
    /// Market condition id.
    pub market: String,
    pub token_id: String,
    pub side: Side,
    pub size: Decimal,
    pub price: Decimal,
    /// Venue trade timestamp, unix seconds. Monotonically increasing per leader.
    pub timestamp: i64,
    pub title: Option<String>,
    pub outcome: Option<String>,
}

impl FillEvent {
    /// Dollar value of the leader's fill.
    pub fn notional(&self) -> Decimal {
        self.size * self.price
    }

    pub fn timestamp_utc(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp(self.timestamp, 0)
    }
}

impl fmt::Display for FillEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Fill: leader={} market={} side={} size={} price={}",
            self.leader_name,
            &self.market[..8.min(self.market.len())],
            self.side,
            self.size,
            self.price,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn side_parses_api_values() {
        assert_eq!(Side::from_api_str("buy"), Some(Side::Buy));
        assert_eq!(Side::from_api_str("SELL"), Some(Side::Sell));
        assert_eq!(Side::from_api_str("0"), Some(Side::Buy));
        assert_eq!(Side::from_api_str("hold"), None);
    }

    #[test]
    fn fill_notional_is_size_times_price() {
        let fill = FillEvent {
            trade_id: "t1".into(),
            leader_wallet: "0xabc".into(),
            leader_name: "A".into(),
            allocated_capital: Decimal::from(2000),
            market: "0xmarket".into(),
            token_id: "123".into(),
            side: Side::Buy,
            size: Decimal::from(100),
            price: Decimal::new(50, 2),
            timestamp: 1_700_000_000,
            title: None,
            outcome: None,
        };
        assert_eq!(fill.notional(), Decimal::from(50));
    }
}
