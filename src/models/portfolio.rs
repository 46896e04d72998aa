use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::Position;

/// Per-leader portfolio snapshot produced by the portfolio tracker.
///
/// `total_value` falls back to the summed initial value when no mark-to-market
/// values exist yet; `deployment_rate` is clamped to [0, 1].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortfolioSnapshot {
    pub total_value: Decimal,
    pub deployed: Decimal,
    pub cash_reserve: Decimal,
    pub deployment_rate: Decimal,
    pub position_count: usize,
    pub fetched_at: DateTime<Utc>,
    /// token id -> share count, used to derive SELL reduction fractions from
    /// consecutive snapshots.
    pub token_sizes: HashMap<String, Decimal>,
}

impl PortfolioSnapshot {
    /// Compute a snapshot from the leader's open positions.
    pub fn from_positions(positions: &[Position], fetched_at: DateTime<Utc>) -> Self {
        if positions.is_empty() {
            return Self::empty(fetched_at);
        }

        let deployed: Decimal = positions.iter().map(|p| p.current_value).sum();
        let initial: Decimal = positions.iter().map(|p| p.initial_value).sum();

        // Deployed reflects mark-to-market; fall back to initial investment
        // only when no marks exist.
        let total_value = if deployed > Decimal::ZERO { deployed } else { initial };
        let deployment_rate = if total_value > Decimal::ZERO {
            (deployed / total_value).min(Decimal::ONE)
        } else {
            Decimal::ZERO
        };

        let token_sizes = positions
            .iter()
            .map(|p| (p.asset.clone(), p.size))
            .collect();

        Self {
            total_value,
            deployed,
            cash_reserve: total_value - deployed,
            deployment_rate,
            position_count: positions.len(),
            fetched_at,
            token_sizes,
        }
    }

    pub fn empty(fetched_at: DateTime<Utc>) -> Self {
        Self {
            total_value: Decimal::ZERO,
            deployed: Decimal::ZERO,
            cash_reserve: Decimal::ZERO,
            deployment_rate: Decimal::ZERO,
            position_count: 0,
            fetched_at,
            token_sizes: HashMap::new(),
        }
    }

    /// Share count the leader holds in a token, zero when absent.
    pub fn token_size(&self, token_id: &str) -> Decimal {
        self.token_sizes
            .get(token_id)
            .copied()
            .unwrap_or(Decimal::ZERO)
    }
}
