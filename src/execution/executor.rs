use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use rust_decimal::Decimal;
use tokio::sync::Mutex;

use crate::errors::{LedgerError, VenueError};
use crate::models::{FillEvent, Side};
use crate::polymarket::{MarketMeta, OrderRequest, OrderResult, OrderType, VenueApi};

use super::ledger::ExposureLedger;

/// Exponential backoff for transient venue failures.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub base: Duration,
    pub factor: u32,
    pub cap: Duration,
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(500),
            factor: 2,
            cap: Duration::from_secs(30),
            max_attempts: 5,
        }
    }
}

impl RetryPolicy {
    /// Delay before the given retry, 1-based.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = self.factor.saturating_pow(attempt.saturating_sub(1));
        self.base.saturating_mul(exp).min(self.cap)
    }
}

/// Final outcome of a mirror attempt.
#[derive(Debug, Clone)]
pub enum ExecutionOutcome {
    Executed {
        mirror_usd: Decimal,
        shares: Decimal,
        price: Decimal,
        order_id: Option<String>,
        status: String,
        /// Proceeds minus the cost basis released; set for reductions only.
        realized_pnl: Option<Decimal>,
    },
    /// The ledger refused the reservation; no order was placed.
    LedgerRejected { reason: String },
    /// The venue refused or kept failing; any reservation was rolled back.
    /// `auth` marks a credential failure, which is fatal for the engine.
    Failed { reason: String, auth: bool },
    /// Reduction requested but no mirror position exists.
    NoPosition,
}

/// Places mirror orders and keeps the exposure ledger consistent with them.
///
/// In dry-run mode orders are logged instead of placed, but the ledger is
/// still updated so sizing behaves exactly as it would live.
pub struct TradeExecutor {
    venue: Arc<dyn VenueApi>,
    ledger: ExposureLedger,
    market_cache: Mutex<HashMap<String, MarketMeta>>,
    retry: RetryPolicy,
    dry_run: bool,
}

impl TradeExecutor {
    pub fn new(
        venue: Arc<dyn VenueApi>,
        ledger: ExposureLedger,
        retry: RetryPolicy,
        dry_run: bool,
    ) -> Self {
        Self {
            venue,
            ledger,
            market_cache: Mutex::new(HashMap::new()),
            retry,
            dry_run,
        }
    }

    /// Cached market metadata lookup. A lookup failure is logged and yields
    /// None; callers fall back to defaults.
    pub async fn market_meta(&self, condition_id: &str) -> Option<MarketMeta> {
        {
            let cache = self.market_cache.lock().await;
            if let Some(meta) = cache.get(condition_id) {
                return Some(meta.clone());
            }
        }
        match self.venue.fetch_market(condition_id).await {
            Ok(meta) => {
                let mut cache = self.market_cache.lock().await;
                cache.insert(condition_id.to_string(), meta.clone());
                Some(meta)
            }
            Err(e) => {
                tracing::warn!(condition_id, error = %e, "Market metadata lookup failed");
                None
            }
        }
    }

    /// Execute an accepted BUY mirror: reserve, submit, commit.
    pub async fn execute_buy(
        &self,
        fill: &FillEvent,
        mirror_usd: Decimal,
        shares: Decimal,
    ) -> Result<ExecutionOutcome, LedgerError> {
        let token = match self
            .ledger
            .reserve(&fill.leader_wallet, fill.allocated_capital, mirror_usd)
            .await
        {
            Ok(token) => token,
            Err(rejection) => {
                return Ok(ExecutionOutcome::LedgerRejected {
                    reason: rejection.to_string(),
                })
            }
        };

        let meta = self.market_meta(&fill.market).await;
        let tick = meta
            .as_ref()
            .map(|m| m.tick_size)
            .filter(|t| *t > Decimal::ZERO)
            .unwrap_or_else(|| Decimal::new(1, 2));
        let neg_risk = meta.as_ref().map(|m| m.neg_risk).unwrap_or(false);

        let price = round_price(fill.price, tick, Side::Buy);
        // Venue accepts share counts at 2-decimal precision.
        let shares = shares.round_dp_with_strategy(2, rust_decimal::RoundingStrategy::ToZero);
        if shares <= Decimal::ZERO {
            self.ledger.release(token).await;
            return Ok(ExecutionOutcome::Failed {
                reason: "rounded share count is zero".into(),
                auth: false,
            });
        }

        if self.dry_run {
            tracing::info!(
                leader = %fill.leader_name,
                token_id = %fill.token_id,
                shares = %shares,
                price = %price,
                "[DRY-RUN] Would place BUY mirror"
            );
            self.ledger
                .commit(
                    token,
                    &fill.trade_id,
                    &fill.market,
                    &fill.token_id,
                    shares,
                    price,
                )
                .await?;
            return Ok(ExecutionOutcome::Executed {
                mirror_usd,
                shares,
                price,
                order_id: None,
                status: "dry_run".into(),
                realized_pnl: None,
            });
        }

        match self
            .submit_with_retry(fill, Side::Buy, shares, price, neg_risk, OrderType::Gtc)
            .await
        {
            Ok(result) => {
                self.ledger
                    .commit(
                        token,
                        &fill.trade_id,
                        &fill.market,
                        &fill.token_id,
                        shares,
                        price,
                    )
                    .await?;
                Ok(ExecutionOutcome::Executed {
                    mirror_usd,
                    shares,
                    price,
                    order_id: result.order_id,
                    status: result.status,
                    realized_pnl: None,
                })
            }
            Err(e) => {
                let auth = matches!(e, VenueError::Auth(_));
                self.ledger.release(token).await;
                Ok(ExecutionOutcome::Failed {
                    reason: e.to_string(),
                    auth,
                })
            }
        }
    }

    /// Execute a SELL reduction: sell `fraction` of the mirror position
    /// fill-or-kill at the midpoint (falling back to the leader's price),
    /// then shrink the ledger.
    pub async fn execute_reduction(
        &self,
        fill: &FillEvent,
        fraction: Decimal,
    ) -> Result<ExecutionOutcome, LedgerError> {
        let position = match self.ledger.position_of(&fill.market, &fill.token_id).await {
            Some(p) => p,
            None => return Ok(ExecutionOutcome::NoPosition),
        };

        let mut sold = (position.size * fraction)
            .round_dp_with_strategy(2, rust_decimal::RoundingStrategy::ToZero);
        // Selling down to dust closes the whole position.
        if position.size - sold < super::ledger::DUST_SHARES {
            sold = position.size;
        }
        if sold <= Decimal::ZERO {
            return Ok(ExecutionOutcome::Failed {
                reason: "reduction rounds to zero shares".into(),
                auth: false,
            });
        }

        let meta = self.market_meta(&fill.market).await;
        let tick = meta
            .as_ref()
            .map(|m| m.tick_size)
            .filter(|t| *t > Decimal::ZERO)
            .unwrap_or_else(|| Decimal::new(1, 2));
        let neg_risk = meta.as_ref().map(|m| m.neg_risk).unwrap_or(false);

        let reference = match self.venue.fetch_midpoint(&fill.token_id).await {
            Ok(Some(mid)) => mid,
            _ => fill.price,
        };
        let price = round_price(reference, tick, Side::Sell);

        if self.dry_run {
            tracing::info!(
                leader = %fill.leader_name,
                token_id = %fill.token_id,
                shares = %sold,
                price = %price,
                "[DRY-RUN] Would place SELL reduction"
            );
            let report = self
                .ledger
                .apply_reduction(&fill.market, &fill.token_id, sold)
                .await;
            let proceeds = sold * price;
            return Ok(ExecutionOutcome::Executed {
                mirror_usd: proceeds,
                shares: sold,
                price,
                order_id: None,
                status: "dry_run".into(),
                realized_pnl: report.map(|r| proceeds - r.freed_usd),
            });
        }

        match self
            .submit_with_retry(fill, Side::Sell, sold, price, neg_risk, OrderType::Fok)
            .await
        {
            Ok(result) => {
                let report = self
                    .ledger
                    .apply_reduction(&fill.market, &fill.token_id, sold)
                    .await;
                let proceeds = sold * price;
                Ok(ExecutionOutcome::Executed {
                    mirror_usd: proceeds,
                    shares: sold,
                    price,
                    order_id: result.order_id,
                    status: result.status,
                    realized_pnl: report.map(|r| proceeds - r.freed_usd),
                })
            }
            Err(e) => Ok(ExecutionOutcome::Failed {
                reason: e.to_string(),
                auth: matches!(e, VenueError::Auth(_)),
            }),
        }
    }

    /// Submit an order, retrying transient failures with exponential backoff.
    /// Before a retry that follows an ambiguous failure, open orders are
    /// checked for a match so an accepted-but-unacknowledged order is not
    /// placed twice.
    async fn submit_with_retry(
        &self,
        fill: &FillEvent,
        side: Side,
        shares: Decimal,
        price: Decimal,
        neg_risk: bool,
        order_type: OrderType,
    ) -> Result<OrderResult, VenueError> {
        let mut last_error: Option<VenueError> = None;

        for attempt in 1..=self.retry.max_attempts {
            if attempt > 1 {
                tokio::time::sleep(self.retry.delay(attempt - 1)).await;

                if let Some(existing) = self.find_matching_open_order(fill, side, shares, price).await
                {
                    tracing::info!(
                        order_id = %existing,
                        "Found matching open order from ambiguous attempt; not resubmitting"
                    );
                    return Ok(OrderResult {
                        order_id: Some(existing),
                        status: "live".into(),
                        success: true,
                    });
                }
            }

            let request = OrderRequest {
                client_order_id: format!("{}-{}", fill.trade_id, attempt),
                token_id: fill.token_id.clone(),
                side,
                size: shares,
                price,
                neg_risk,
                order_type,
            };

            match self.venue.create_order(&request).await {
                Ok(result) => return Ok(result),
                Err(e) if e.is_retryable() && attempt < self.retry.max_attempts => {
                    tracing::warn!(
                        attempt,
                        error = %e,
                        token_id = %fill.token_id,
                        "Order submission failed; will retry"
                    );
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_error.unwrap_or_else(|| VenueError::Fatal("retry loop exhausted".into())))
    }

    async fn find_matching_open_order(
        &self,
        fill: &FillEvent,
        side: Side,
        shares: Decimal,
        price: Decimal,
    ) -> Option<String> {
        let orders = self.venue.open_orders().await.ok()?;
        orders.into_iter().find_map(|o| {
            let matches = o.asset_id.as_deref() == Some(fill.token_id.as_str())
                && o.side.as_deref().and_then(Side::from_api_str) == Some(side)
                && o.original_size == Some(shares)
                && o.price == Some(price);
            if matches {
                o.id
            } else {
                None
            }
        })
    }
}

/// Round a price onto the market's tick grid: down for buys, up for sells.
pub fn round_price(price: Decimal, tick: Decimal, side: Side) -> Decimal {
    if tick <= Decimal::ZERO {
        return price;
    }
    let ticks = price / tick;
    let rounded = match side {
        Side::Buy => ticks.floor(),
        Side::Sell => ticks.ceil(),
    };
    rounded * tick
}
