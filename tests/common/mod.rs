use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use rust_decimal::Decimal;

use polycopy::config::{
    AccountConfig, GlobalRisk, LoggingConfig, MarketFilters, MonitoringConfig, PerTraderRisk,
    RiskConfig, Settings, TraderConfig, TrackingConfig,
};
use polycopy::errors::VenueError;
use polycopy::models::{Position, Side};
use polycopy::polymarket::types::{MarketMeta, OpenOrder, OrderRequest, OrderResult, VenueTrade};
use polycopy::polymarket::VenueApi;

pub const WALLET_A: &str = "0xaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";
pub const WALLET_B: &str = "0xbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb";

/// Scripted venue for integration tests. Trades and position batches are
/// seeded per wallet; every placed order is recorded.
#[derive(Default)]
pub struct MockVenue {
    trades: Mutex<HashMap<String, Vec<VenueTrade>>>,
    positions: Mutex<HashMap<String, VecDeque<Vec<Position>>>>,
    markets: Mutex<HashMap<String, MarketMeta>>,
    midpoints: Mutex<HashMap<String, Decimal>>,
    pub placed_orders: Mutex<Vec<OrderRequest>>,
    order_failures: Mutex<VecDeque<VenueError>>,
}

impl MockVenue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_trade(&self, wallet: &str, trade: VenueTrade) {
        self.trades
            .lock()
            .unwrap()
            .entry(wallet.to_lowercase())
            .or_default()
            .push(trade);
    }

    /// Queue a positions batch. A fetch advances to the next queued batch
    /// when one is waiting; otherwise the current batch sticks.
    pub fn push_positions(&self, wallet: &str, batch: Vec<Position>) {
        self.positions
            .lock()
            .unwrap()
            .entry(wallet.to_lowercase())
            .or_default()
            .push_back(batch);
    }

    pub fn set_market(&self, meta: MarketMeta) {
        self.markets
            .lock()
            .unwrap()
            .insert(meta.condition_id.clone(), meta);
    }

    pub fn set_midpoint(&self, token_id: &str, mid: Decimal) {
        self.midpoints
            .lock()
            .unwrap()
            .insert(token_id.to_string(), mid);
    }

    pub fn fail_next_order(&self, error: VenueError) {
        self.order_failures.lock().unwrap().push_back(error);
    }

    pub fn order_count(&self) -> usize {
        self.placed_orders.lock().unwrap().len()
    }
}

#[async_trait]
impl VenueApi for MockVenue {
    async fn fetch_positions(
        &self,
        wallet: &str,
        _size_threshold: Decimal,
    ) -> Result<Vec<Position>, VenueError> {
        let mut positions = self.positions.lock().unwrap();
        let queue = positions
            .get_mut(&wallet.to_lowercase())
            .ok_or_else(|| VenueError::NotFound(format!("no positions for {wallet}")))?;
        if queue.len() > 1 {
            queue.pop_front();
        }
        Ok(queue.front().cloned().unwrap_or_default())
    }

    async fn fetch_trades(
        &self,
        wallet: &str,
        since: i64,
        _limit: u32,
    ) -> Result<Vec<VenueTrade>, VenueError> {
        let trades = self.trades.lock().unwrap();
        let mut result: Vec<VenueTrade> = trades
            .get(&wallet.to_lowercase())
            .map(|t| {
                t.iter()
                    .filter(|tr| tr.timestamp > since)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        result.sort_by_key(|t| t.timestamp);
        Ok(result)
    }

    async fn fetch_market(&self, condition_id: &str) -> Result<MarketMeta, VenueError> {
        self.markets
            .lock()
            .unwrap()
            .get(condition_id)
            .cloned()
            .ok_or_else(|| VenueError::NotFound(condition_id.to_string()))
    }

    async fn fetch_midpoint(&self, token_id: &str) -> Result<Option<Decimal>, VenueError> {
        Ok(self.midpoints.lock().unwrap().get(token_id).copied())
    }

    async fn create_order(&self, order: &OrderRequest) -> Result<OrderResult, VenueError> {
        if let Some(error) = self.order_failures.lock().unwrap().pop_front() {
            return Err(error);
        }
        let mut placed = self.placed_orders.lock().unwrap();
        placed.push(order.clone());
        Ok(OrderResult {
            order_id: Some(format!("mock-{}", placed.len())),
            status: "live".into(),
            success: true,
        })
    }

    async fn open_orders(&self) -> Result<Vec<OpenOrder>, VenueError> {
        Ok(vec![])
    }
}

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

pub fn trader(name: &str, wallet: &str, allocated: i64, enabled: bool) -> TraderConfig {
    TraderConfig {
        name: name.into(),
        wallet_address: wallet.into(),
        allocated_capital: Decimal::from(allocated),
        enabled,
    }
}

/// Settings with a single enabled leader "alice" allocated $2000, matching
/// the proportional-sizing examples.
pub fn settings(state_dir: &str, traders: Vec<TraderConfig>) -> Settings {
    Settings {
        your_account: AccountConfig {
            api_key: "key".into(),
            api_secret: "secret".into(),
            api_passphrase: "pass".into(),
            total_capital: Decimal::from(10_000),
            funder_address: None,
        },
        traders,
        risk_management: RiskConfig {
            global: GlobalRisk {
                max_total_exposure: Decimal::from(5000),
                max_single_bet: Decimal::from(500),
                reserve_capital: Decimal::ZERO,
            },
            per_trader: PerTraderRisk {
                min_portfolio_value: Decimal::from(100),
                max_position_pct: Decimal::new(5, 1),
                use_portfolio_proportion: true,
            },
            market_filters: MarketFilters::default(),
        },
        monitoring: MonitoringConfig {
            poll_interval: 5,
            portfolio_sync_interval: 60,
            metrics_listen: None,
        },
        logging: LoggingConfig::default(),
        trade_tracking: TrackingConfig::default(),
        dry_run: false,
        state_dir: state_dir.into(),
    }
}

pub fn venue_trade(
    market: &str,
    token: &str,
    side: Side,
    size: i64,
    price_cents: i64,
    ts: i64,
    hash: &str,
) -> VenueTrade {
    VenueTrade {
        market: market.into(),
        token_id: token.into(),
        side,
        size: Decimal::from(size),
        price: Decimal::new(price_cents, 2),
        timestamp: ts,
        transaction_hash: Some(hash.into()),
        title: Some("Test market".into()),
        outcome: Some("Yes".into()),
    }
}

pub fn position(token: &str, size: i64, current_value: i64) -> Position {
    Position {
        asset: token.into(),
        condition_id: "0xcond".into(),
        size: Decimal::from(size),
        avg_price: Decimal::new(50, 2),
        initial_value: Decimal::from(current_value),
        current_value: Decimal::from(current_value),
        current_price: Decimal::new(50, 2),
        cash_pnl: Decimal::ZERO,
        outcome: "Yes".into(),
        title: "Test market".into(),
    }
}

pub fn market(condition_id: &str) -> MarketMeta {
    MarketMeta {
        condition_id: condition_id.into(),
        neg_risk: false,
        tick_size: Decimal::new(1, 2),
        min_order_size: Decimal::ZERO,
        liquidity: Decimal::from(100_000),
        category: Some("Politics".into()),
    }
}
