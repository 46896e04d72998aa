use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use rust_decimal::Decimal;
use tokio::sync::RwLock;

use crate::errors::VenueError;
use crate::models::PortfolioSnapshot;
use crate::polymarket::VenueApi;

/// Positions smaller than this many shares are ignored when computing a
/// leader's portfolio.
const POSITION_DUST_SHARES: &str = "0.1";

/// Tracks each leader's portfolio value and deployment rate.
///
/// Snapshots are replaced atomically per wallet; readers always see a
/// complete snapshot. The previous snapshot is retained so SELL mirrors can
/// derive the fraction a leader sold from consecutive observations.
pub struct PortfolioTracker {
    venue: Arc<dyn VenueApi>,
    current: RwLock<HashMap<String, PortfolioSnapshot>>,
    previous: RwLock<HashMap<String, PortfolioSnapshot>>,
}

impl PortfolioTracker {
    pub fn new(venue: Arc<dyn VenueApi>) -> Self {
        Self {
            venue,
            current: RwLock::new(HashMap::new()),
            previous: RwLock::new(HashMap::new()),
        }
    }

    /// Fetch the wallet's open positions and swap in a fresh snapshot.
    /// On failure the prior snapshot stays in place and the error surfaces
    /// to the orchestrator.
    pub async fn sync(&self, wallet: &str) -> Result<PortfolioSnapshot, VenueError> {
        let dust: Decimal = POSITION_DUST_SHARES.parse().unwrap_or(Decimal::ZERO);
        let positions = self.venue.fetch_positions(wallet, dust).await?;
        let snapshot = PortfolioSnapshot::from_positions(&positions, Utc::now());

        tracing::debug!(
            wallet = %wallet,
            total_value = %snapshot.total_value,
            deployed = %snapshot.deployed,
            deployment_rate = %snapshot.deployment_rate,
            positions = snapshot.position_count,
            "Portfolio synced"
        );

        let mut current = self.current.write().await;
        if let Some(old) = current.insert(wallet.to_string(), snapshot.clone()) {
            self.previous.write().await.insert(wallet.to_string(), old);
        }
        Ok(snapshot)
    }

    pub async fn get(&self, wallet: &str) -> Option<PortfolioSnapshot> {
        self.current.read().await.get(wallet).cloned()
    }

    /// The snapshot taken before the current one, if two syncs have landed.
    pub async fn get_previous(&self, wallet: &str) -> Option<PortfolioSnapshot> {
        self.previous.read().await.get(wallet).cloned()
    }

    /// Fraction of the leader's portfolio a trade notional represents.
    /// Zero when the portfolio is unknown or empty.
    pub async fn position_fraction(&self, wallet: &str, trade_notional: Decimal) -> Decimal {
        match self.get(wallet).await {
            Some(snap) if snap.total_value > Decimal::ZERO => trade_notional / snap.total_value,
            _ => Decimal::ZERO,
        }
    }

    /// Allocated capital scaled by the leader's deployment rate, clamped to
    /// `[0, allocated_capital]`. Returns the rate alongside for logging.
    pub async fn effective_allocation(
        &self,
        wallet: &str,
        allocated_capital: Decimal,
    ) -> (Decimal, Decimal) {
        let rate = self
            .get(wallet)
            .await
            .map(|s| s.deployment_rate)
            .unwrap_or(Decimal::ONE);
        let effective = (allocated_capital * rate)
            .max(Decimal::ZERO)
            .min(allocated_capital);
        (effective, rate)
    }
}
