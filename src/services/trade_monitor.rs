use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use chrono::Utc;
use rust_decimal::Decimal;
use tokio::sync::Mutex;

use crate::config::TraderConfig;
use crate::errors::VenueError;
use crate::models::FillEvent;
use crate::polymarket::{VenueApi, VenueTrade};

/// Recent-id window per leader; old ids are evicted oldest-first.
const RECENT_IDS_CAP: usize = 1024;

/// Per-leader monitor cursor. Serialized into `state/monitor.json`.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct MonitorCursor {
    pub last_seen_ts: i64,
    pub recent_ids: Vec<String>,
}

#[derive(Debug, Default)]
struct MonitorState {
    last_seen_ts: i64,
    baselined: bool,
    recent_order: VecDeque<String>,
    recent_set: HashSet<String>,
}

impl MonitorState {
    fn remember(&mut self, id: String) {
        if self.recent_set.insert(id.clone()) {
            self.recent_order.push_back(id);
            while self.recent_order.len() > RECENT_IDS_CAP {
                if let Some(old) = self.recent_order.pop_front() {
                    self.recent_set.remove(&old);
                }
            }
        }
    }
}

/// Per-leader incremental poller. Each call to `poll` returns the leader's
/// previously-unseen fills in ascending timestamp order, enriched with the
/// leader's config.
///
/// The first poll for a leader records a baseline timestamp and emits
/// nothing, so only trades made after startup are mirrored. Subsequent polls
/// re-fetch an overlap window behind the cursor to absorb clock skew and
/// out-of-order arrival, relying on the recent-id set for dedup.
pub struct TradeMonitor {
    venue: Arc<dyn VenueApi>,
    states: Mutex<HashMap<String, MonitorState>>,
    overlap_secs: i64,
    fetch_limit: u32,
}

impl TradeMonitor {
    pub fn new(venue: Arc<dyn VenueApi>, poll_interval_secs: u64) -> Self {
        Self {
            venue,
            states: Mutex::new(HashMap::new()),
            // Overlap of at least two poll intervals.
            overlap_secs: (poll_interval_secs as i64) * 2,
            fetch_limit: 100,
        }
    }

    pub async fn poll(&self, leader: &TraderConfig) -> Result<Vec<FillEvent>, VenueError> {
        self.poll_at(leader, Utc::now().timestamp()).await
    }

    /// Poll with an explicit clock, used directly by tests.
    pub async fn poll_at(
        &self,
        leader: &TraderConfig,
        now: i64,
    ) -> Result<Vec<FillEvent>, VenueError> {
        let wallet = leader.wallet_address.to_lowercase();

        let since = {
            let mut states = self.states.lock().await;
            let state = states.entry(wallet.clone()).or_default();
            if !state.baselined {
                // First observation: only react to trades after this point.
                state.baselined = true;
                state.last_seen_ts = now;
                return Ok(vec![]);
            }
            (state.last_seen_ts - self.overlap_secs).max(0)
        };

        let trades = self
            .venue
            .fetch_trades(&wallet, since, self.fetch_limit)
            .await?;

        let mut fills = aggregate_fills(&trades, leader);
        fills.sort_by_key(|f| f.timestamp);

        let mut states = self.states.lock().await;
        let state = states.entry(wallet).or_default();
        fills.retain(|f| !state.recent_set.contains(&f.trade_id));
        for fill in &fills {
            state.remember(fill.trade_id.clone());
            state.last_seen_ts = state.last_seen_ts.max(fill.timestamp);
        }
        Ok(fills)
    }

    /// Forget a leader's cursor (leader removed from config).
    pub async fn forget(&self, wallet: &str) {
        self.states.lock().await.remove(&wallet.to_lowercase());
    }

    /// Export per-leader cursors for persistence.
    pub async fn export_cursors(&self) -> HashMap<String, MonitorCursor> {
        let states = self.states.lock().await;
        states
            .iter()
            .filter(|(_, s)| s.baselined)
            .map(|(wallet, s)| {
                (
                    wallet.clone(),
                    MonitorCursor {
                        last_seen_ts: s.last_seen_ts,
                        recent_ids: s.recent_order.iter().cloned().collect(),
                    },
                )
            })
            .collect()
    }

    /// Restore cursors persisted by a prior run.
    pub async fn restore_cursors(&self, cursors: HashMap<String, MonitorCursor>) {
        let mut states = self.states.lock().await;
        for (wallet, cursor) in cursors {
            let mut state = MonitorState {
                last_seen_ts: cursor.last_seen_ts,
                baselined: true,
                ..Default::default()
            };
            for id in cursor.recent_ids {
                state.remember(id);
            }
            states.insert(wallet.to_lowercase(), state);
        }
    }
}

/// Merge partial fills that share an aggregation key into single events with
/// summed size and notional-weighted average price.
fn aggregate_fills(trades: &[VenueTrade], leader: &TraderConfig) -> Vec<FillEvent> {
    struct Bucket {
        template: FillEvent,
        size: Decimal,
        notional: Decimal,
    }

    let mut buckets: HashMap<String, Bucket> = HashMap::new();
    let mut order: Vec<String> = Vec::new();

    for trade in trades {
        let key = aggregation_key(trade);
        let bucket = buckets.entry(key.clone()).or_insert_with(|| {
            order.push(key);
            Bucket {
                template: FillEvent {
                    trade_id: String::new(),
                    leader_wallet: leader.wallet_address.to_lowercase(),
                    leader_name: leader.name.clone(),
                    allocated_capital: leader.allocated_capital,
                    market: trade.market.clone(),
                    token_id: trade.token_id.clone(),
                    side: trade.side,
                    size: Decimal::ZERO,
                    price: Decimal::ZERO,
                    timestamp: trade.timestamp,
                    title: trade.title.clone(),
                    outcome: trade.outcome.clone(),
                },
                size: Decimal::ZERO,
                notional: Decimal::ZERO,
            }
        });
        bucket.size += trade.size;
        bucket.notional += trade.size * trade.price;
        bucket.template.timestamp = bucket.template.timestamp.max(trade.timestamp);
    }

    order
        .into_iter()
        .filter_map(|key| {
            let bucket = buckets.remove(&key)?;
            if bucket.size <= Decimal::ZERO {
                return None;
            }
            let mut fill = bucket.template;
            fill.trade_id = key;
            fill.size = bucket.size;
            fill.price = bucket.notional / bucket.size;
            Some(fill)
        })
        .collect()
}

/// Partial fills of one venue match share a transaction hash; fall back to a
/// time/token/side/price key when the hash is absent.
fn aggregation_key(trade: &VenueTrade) -> String {
    match trade.transaction_hash.as_deref() {
        Some(hash) if !hash.is_empty() => {
            format!("tx:{}:{}:{}", hash.to_lowercase(), trade.token_id, trade.side)
        }
        _ => format!(
            "ts:{}:{}:{}:{}",
            trade.timestamp, trade.token_id, trade.side, trade.price
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Side;

    fn trade(hash: &str, ts: i64, size: i64, price_cents: i64) -> VenueTrade {
        VenueTrade {
            market: "0xcond".into(),
            token_id: "tok".into(),
            side: Side::Buy,
            size: Decimal::from(size),
            price: Decimal::new(price_cents, 2),
            timestamp: ts,
            transaction_hash: if hash.is_empty() { None } else { Some(hash.into()) },
            title: None,
            outcome: None,
        }
    }

    fn leader() -> TraderConfig {
        TraderConfig {
            name: "alice".into(),
            wallet_address: "0x1111111111111111111111111111111111111111".into(),
            allocated_capital: Decimal::from(2000),
            enabled: true,
        }
    }

    #[test]
    fn partial_fills_merge_with_weighted_price() {
        let trades = vec![trade("0xa", 100, 60, 50), trade("0xa", 101, 40, 60)];
        let fills = aggregate_fills(&trades, &leader());

        assert_eq!(fills.len(), 1);
        let fill = &fills[0];
        assert_eq!(fill.size, Decimal::from(100));
        // (60*0.50 + 40*0.60) / 100 = 0.54
        assert_eq!(fill.price, Decimal::new(54, 2));
        assert_eq!(fill.timestamp, 101);
    }

    #[test]
    fn distinct_hashes_stay_separate() {
        let trades = vec![trade("0xa", 100, 60, 50), trade("0xb", 100, 40, 50)];
        let fills = aggregate_fills(&trades, &leader());
        assert_eq!(fills.len(), 2);
    }

    #[test]
    fn hashless_trades_key_on_time_and_price() {
        let trades = vec![trade("", 100, 60, 50), trade("", 100, 40, 50)];
        let fills = aggregate_fills(&trades, &leader());
        assert_eq!(fills.len(), 1);
        assert_eq!(fills[0].size, Decimal::from(100));
    }
}
