use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::models::Side;

// ---------------------------------------------------------------------------
// Trade (Data API)
// ---------------------------------------------------------------------------

/// Raw trade row from `/trades`. Every field is optional; decoding into the
/// domain type happens at the client boundary and drops malformed rows.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ApiTrade {
    #[serde(default, alias = "conditionId")]
    pub condition_id: Option<String>,
    #[serde(default, alias = "asset")]
    pub token_id: Option<String>,
    #[serde(default)]
    pub side: Option<String>,
    #[serde(default)]
    pub size: Option<Decimal>,
    #[serde(default)]
    pub price: Option<Decimal>,
    #[serde(default)]
    pub timestamp: Option<serde_json::Value>,
    #[serde(default, alias = "transactionHash")]
    pub transaction_hash: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub outcome: Option<String>,
}

/// A decoded venue trade, strictly typed for the monitor.
#[derive(Debug, Clone)]
pub struct VenueTrade {
    pub market: String,
    pub token_id: String,
    pub side: Side,
    pub size: Decimal,
    pub price: Decimal,
    /// Unix seconds.
    pub timestamp: i64,
    pub transaction_hash: Option<String>,
    pub title: Option<String>,
    pub outcome: Option<String>,
}

impl ApiTrade {
    /// Decode into a `VenueTrade`, returning None for rows missing any of the
    /// fields the engine depends on.
    pub fn decode(&self) -> Option<VenueTrade> {
        let side = Side::from_api_str(self.side.as_deref()?)?;
        let timestamp = parse_timestamp(self.timestamp.as_ref()?)?;
        Some(VenueTrade {
            market: self.condition_id.clone()?,
            token_id: self.token_id.clone()?,
            side,
            size: self.size?,
            price: self.price?,
            timestamp,
            transaction_hash: self.transaction_hash.clone(),
            title: self.title.clone(),
            outcome: self.outcome.clone(),
        })
    }
}

/// The Data API reports timestamps as either numbers or numeric strings, in
/// seconds or milliseconds.
pub fn parse_timestamp(value: &serde_json::Value) -> Option<i64> {
    let raw = match value {
        serde_json::Value::Number(n) => n.as_i64()?,
        serde_json::Value::String(s) => s.parse::<i64>().ok()?,
        _ => return None,
    };
    if raw > 1_000_000_000_000 {
        Some(raw / 1000)
    } else {
        Some(raw)
    }
}

// ---------------------------------------------------------------------------
// Position (Data API)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ApiPosition {
    #[serde(default)]
    pub asset: Option<String>,
    #[serde(default, alias = "conditionId")]
    pub condition_id: Option<String>,
    #[serde(default)]
    pub size: Option<Decimal>,
    #[serde(default, alias = "avgPrice")]
    pub avg_price: Option<Decimal>,
    #[serde(default, alias = "initialValue")]
    pub initial_value: Option<Decimal>,
    #[serde(default, alias = "currentValue")]
    pub current_value: Option<Decimal>,
    #[serde(default, alias = "curPrice")]
    pub current_price: Option<Decimal>,
    #[serde(default, alias = "cashPnl")]
    pub cash_pnl: Option<Decimal>,
    #[serde(default)]
    pub outcome: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
}

// ---------------------------------------------------------------------------
// Market metadata (Gamma + CLOB)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GammaMarket {
    #[serde(default, alias = "conditionId")]
    pub condition_id: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    /// Gamma returns liquidity as a stringified number.
    #[serde(default)]
    pub liquidity: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ClobMarket {
    pub condition_id: String,
    #[serde(default)]
    pub neg_risk: bool,
    #[serde(default, alias = "minimum_tick_size")]
    pub tick_size: Option<Decimal>,
    #[serde(default, alias = "minimum_order_size")]
    pub min_order_size: Option<Decimal>,
}

/// Merged market metadata the risk manager and executor consume.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketMeta {
    pub condition_id: String,
    pub neg_risk: bool,
    pub tick_size: Decimal,
    pub min_order_size: Decimal,
    pub liquidity: Decimal,
    pub category: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MidpointResponse {
    #[serde(default)]
    pub mid: Option<Decimal>,
}

// ---------------------------------------------------------------------------
// Orders (CLOB)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderType {
    /// Good-till-cancelled; used for BUY mirrors.
    Gtc,
    /// Fill-or-kill; used for SELL reductions.
    Fok,
}

#[derive(Debug, Clone, Serialize)]
pub struct OrderRequest {
    /// Caller-supplied idempotency key, echoed to the venue.
    pub client_order_id: String,
    pub token_id: String,
    pub side: Side,
    pub size: Decimal,
    pub price: Decimal,
    pub neg_risk: bool,
    pub order_type: OrderType,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiOrderResponse {
    #[serde(default)]
    pub success: bool,
    #[serde(default, alias = "orderID")]
    pub order_id: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default, alias = "errorMsg")]
    pub error_msg: Option<String>,
}

/// Acknowledged order placement.
#[derive(Debug, Clone)]
pub struct OrderResult {
    pub order_id: Option<String>,
    pub status: String,
    pub success: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OpenOrder {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub asset_id: Option<String>,
    #[serde(default)]
    pub side: Option<String>,
    #[serde(default)]
    pub original_size: Option<Decimal>,
    #[serde(default)]
    pub price: Option<Decimal>,
}
