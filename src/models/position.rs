use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A leader's open position as reported by the venue positions endpoint.
/// Read-only snapshot; decoded at the client boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    /// CTF token id of the outcome held.
    pub asset: String,
    pub condition_id: String,
    /// Share count.
    pub size: Decimal,
    pub avg_price: Decimal,
    pub initial_value: Decimal,
    pub current_value: Decimal,
    pub current_price: Decimal,
    pub cash_pnl: Decimal,
    pub outcome: String,
    pub title: String,
}

/// Key for the mirror-position map: one entry per outcome token per market.
pub type PositionKey = (String, String);

/// The operator's mirrored position in a single outcome token, together with
/// the dollar exposure each leader contributed to it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MirrorPosition {
    pub market: String,
    pub token_id: String,
    /// Share count, never negative. A position at zero is removed from the map.
    pub size: Decimal,
    pub avg_entry_price: Decimal,
    pub opened_at: DateTime<Utc>,
    pub last_updated_at: DateTime<Utc>,
    /// leader wallet -> USD exposure contributed. Reductions scale every
    /// contributor down proportionally.
    pub contributing_leaders: HashMap<String, Decimal>,
}

impl MirrorPosition {
    pub fn key(&self) -> PositionKey {
        (self.market.clone(), self.token_id.clone())
    }

    /// Current notional at entry prices.
    pub fn cost_basis(&self) -> Decimal {
        self.size * self.avg_entry_price
    }
}
