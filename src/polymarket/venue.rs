use async_trait::async_trait;
use rust_decimal::Decimal;

use crate::errors::VenueError;
use crate::models::Position;

use super::data_client::DataClient;
use super::clob_client::ClobClient;
use super::types::{MarketMeta, OpenOrder, OrderRequest, OrderResult, VenueTrade};

/// Seam between the engine and the remote venue. The live implementation
/// talks REST; tests substitute a scripted mock.
#[async_trait]
pub trait VenueApi: Send + Sync {
    /// Open positions above `size_threshold` shares.
    async fn fetch_positions(
        &self,
        wallet: &str,
        size_threshold: Decimal,
    ) -> Result<Vec<Position>, VenueError>;

    /// Trades strictly newer than `since` (unix seconds), ascending by
    /// timestamp.
    async fn fetch_trades(
        &self,
        wallet: &str,
        since: i64,
        limit: u32,
    ) -> Result<Vec<VenueTrade>, VenueError>;

    async fn fetch_market(&self, condition_id: &str) -> Result<MarketMeta, VenueError>;

    async fn fetch_midpoint(&self, token_id: &str) -> Result<Option<Decimal>, VenueError>;

    async fn create_order(&self, order: &OrderRequest) -> Result<OrderResult, VenueError>;

    async fn open_orders(&self) -> Result<Vec<OpenOrder>, VenueError>;
}

/// Live venue adapter over the Data, Gamma, and CLOB APIs.
pub struct PolymarketVenue {
    data: DataClient,
    clob: ClobClient,
}

impl PolymarketVenue {
    pub fn new(data: DataClient, clob: ClobClient) -> Self {
        Self { data, clob }
    }
}

#[async_trait]
impl VenueApi for PolymarketVenue {
    async fn fetch_positions(
        &self,
        wallet: &str,
        size_threshold: Decimal,
    ) -> Result<Vec<Position>, VenueError> {
        let raw = self.data.get_positions(wallet, size_threshold).await?;

        let positions = raw
            .into_iter()
            .filter_map(|p| {
                Some(Position {
                    asset: p.asset?,
                    condition_id: p.condition_id.unwrap_or_default(),
                    size: p.size?,
                    avg_price: p.avg_price.unwrap_or_default(),
                    initial_value: p.initial_value.unwrap_or_default(),
                    current_value: p.current_value.unwrap_or_default(),
                    current_price: p.current_price.unwrap_or_default(),
                    cash_pnl: p.cash_pnl.unwrap_or_default(),
                    outcome: p.outcome.unwrap_or_default(),
                    title: p.title.unwrap_or_default(),
                })
            })
            .collect();
        Ok(positions)
    }

    async fn fetch_trades(
        &self,
        wallet: &str,
        since: i64,
        limit: u32,
    ) -> Result<Vec<VenueTrade>, VenueError> {
        let raw = self.data.get_trades(wallet, limit, 0).await?;

        let mut trades: Vec<VenueTrade> = raw
            .iter()
            .filter_map(|t| t.decode())
            .filter(|t| t.timestamp > since)
            .collect();
        trades.sort_by_key(|t| t.timestamp);
        Ok(trades)
    }

    async fn fetch_market(&self, condition_id: &str) -> Result<MarketMeta, VenueError> {
        let clob = self.clob.get_market(condition_id).await?;
        let gamma = self.data.get_gamma_market(condition_id).await?;

        let liquidity = gamma
            .as_ref()
            .and_then(|g| g.liquidity.as_deref())
            .and_then(|s| s.parse::<Decimal>().ok())
            .unwrap_or(Decimal::ZERO);
        let category = gamma.and_then(|g| g.category);

        Ok(MarketMeta {
            condition_id: clob.condition_id,
            neg_risk: clob.neg_risk,
            tick_size: clob.tick_size.unwrap_or_else(|| Decimal::new(1, 2)),
            min_order_size: clob.min_order_size.unwrap_or(Decimal::ZERO),
            liquidity,
            category,
        })
    }

    async fn fetch_midpoint(&self, token_id: &str) -> Result<Option<Decimal>, VenueError> {
        self.clob.get_midpoint(token_id).await
    }

    async fn create_order(&self, order: &OrderRequest) -> Result<OrderResult, VenueError> {
        self.clob.post_order(order).await
    }

    async fn open_orders(&self) -> Result<Vec<OpenOrder>, VenueError> {
        self.clob.get_open_orders().await
    }
}
