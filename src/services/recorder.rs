use std::collections::HashSet;
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::sleep;

use crate::config::{Settings, TraderConfig};
use crate::errors::VenueError;
use crate::polymarket::{DataClient, VenueTrade};
use crate::state::{persist_json, read_json, RecorderCursor, RecorderFile};

/// One CSV row per recorded leader trade.
#[derive(Debug, Serialize)]
struct HistoryRow {
    timestamp_iso: String,
    timestamp_unix: i64,
    transaction_hash: String,
    side: String,
    size: Decimal,
    price: Decimal,
    market: String,
    token_id: String,
    title: String,
    outcome: String,
}

impl HistoryRow {
    fn from_trade(trade: &VenueTrade) -> Self {
        let iso = DateTime::<Utc>::from_timestamp(trade.timestamp, 0)
            .map(|dt| dt.to_rfc3339())
            .unwrap_or_default();
        Self {
            timestamp_iso: iso,
            timestamp_unix: trade.timestamp,
            transaction_hash: trade.transaction_hash.clone().unwrap_or_default(),
            side: trade.side.to_string(),
            size: trade.size,
            price: trade.price,
            market: trade.market.clone(),
            token_id: trade.token_id.clone(),
            title: trade.title.clone().unwrap_or_default(),
            outcome: trade.outcome.clone().unwrap_or_default(),
        }
    }
}

/// Records the full trade history of every enabled leader to per-leader CSV
/// files, then appends new trades each poll. Resume cursors live in
/// `state/trade_history_state.json`; ties at the cursor timestamp are broken
/// by transaction hash.
pub struct TradeRecorder {
    data_client: DataClient,
    traders: Vec<TraderConfig>,
    output_dir: PathBuf,
    state_path: PathBuf,
    poll_interval: Duration,
    page_size: u32,
    cursors: RecorderFile,
}

impl TradeRecorder {
    pub fn new(data_client: DataClient, settings: &Settings, state_path: PathBuf) -> Self {
        let cursors = read_json(&state_path).unwrap_or_default();
        Self {
            data_client,
            traders: settings.enabled_traders().cloned().collect(),
            output_dir: PathBuf::from(&settings.trade_tracking.output_dir),
            state_path,
            poll_interval: Duration::from_secs(settings.trade_tracking.poll_interval.max(5)),
            page_size: 200,
            cursors,
        }
    }

    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        if self.traders.is_empty() {
            tracing::info!("No enabled traders; recorder has nothing to do");
            return Ok(());
        }
        fs::create_dir_all(&self.output_dir)?;

        self.bootstrap().await;

        loop {
            tokio::select! {
                _ = sleep(self.poll_interval) => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
            self.sync_new().await;
        }

        self.persist();
        tracing::info!("Trade recorder stopped");
        Ok(())
    }

    /// Write the complete history for any leader without an existing cursor.
    async fn bootstrap(&mut self) {
        for trader in self.traders.clone() {
            let wallet = trader.wallet_address.to_lowercase();
            let path = self.log_path(&trader);
            if self.cursors.per_trader.contains_key(&wallet) && path.exists() {
                continue;
            }

            match self.fetch_all_trades(&wallet).await {
                Ok(trades) => {
                    tracing::info!(
                        trader = %trader.name,
                        count = trades.len(),
                        "Bootstrapping trade history"
                    );
                    if let Err(e) = write_full_log(&path, &trades) {
                        tracing::error!(error = %e, "Failed to write history file");
                        continue;
                    }
                    self.cursors
                        .per_trader
                        .insert(wallet, cursor_from(&trades));
                    self.persist();
                }
                Err(e) => {
                    tracing::warn!(trader = %trader.name, error = %e, "History bootstrap failed");
                }
            }
        }
    }

    async fn sync_new(&mut self) {
        for trader in self.traders.clone() {
            let wallet = trader.wallet_address.to_lowercase();
            let cursor = self
                .cursors
                .per_trader
                .get(&wallet)
                .cloned()
                .unwrap_or_default();

            let new_trades = match self.fetch_new_trades(&wallet, &cursor).await {
                Ok(t) => t,
                Err(e) => {
                    tracing::warn!(trader = %trader.name, error = %e, "History sync failed");
                    continue;
                }
            };
            if new_trades.is_empty() {
                continue;
            }

            let path = self.log_path(&trader);
            if let Err(e) = append_log(&path, &new_trades) {
                tracing::error!(error = %e, "Failed to append history rows");
                continue;
            }

            tracing::info!(
                trader = %trader.name,
                count = new_trades.len(),
                "Recorded new trades"
            );
            self.cursors
                .per_trader
                .insert(wallet, cursor_from(&new_trades));
            self.persist();
        }
    }

    async fn fetch_all_trades(&self, wallet: &str) -> Result<Vec<VenueTrade>, VenueError> {
        let mut trades = Vec::new();
        let mut offset = 0;
        loop {
            let batch = self
                .data_client
                .get_trades(wallet, self.page_size, offset)
                .await?;
            let batch_len = batch.len();
            trades.extend(batch.iter().filter_map(|t| t.decode()));
            if (batch_len as u32) < self.page_size {
                break;
            }
            offset += self.page_size;
        }
        trades.sort_by_key(|t| t.timestamp);
        Ok(trades)
    }

    /// Page backwards until the cursor timestamp is crossed, then keep only
    /// trades past the cursor (hash tie-break at the boundary).
    async fn fetch_new_trades(
        &self,
        wallet: &str,
        cursor: &RecorderCursor,
    ) -> Result<Vec<VenueTrade>, VenueError> {
        let mut collected: Vec<VenueTrade> = Vec::new();
        let mut offset = 0;
        loop {
            let batch = self
                .data_client
                .get_trades(wallet, self.page_size, offset)
                .await?;
            let batch_len = batch.len();
            let decoded: Vec<VenueTrade> = batch.iter().filter_map(|t| t.decode()).collect();
            let min_ts = decoded.iter().map(|t| t.timestamp).min();
            collected.extend(decoded);

            let crossed = min_ts.map(|ts| ts < cursor.last_timestamp).unwrap_or(true);
            if (batch_len as u32) < self.page_size || crossed {
                break;
            }
            offset += self.page_size;
        }

        let last_hashes: HashSet<&str> = cursor.last_hashes.iter().map(String::as_str).collect();
        collected.sort_by_key(|t| t.timestamp);
        let new_trades = collected
            .into_iter()
            .filter(|t| {
                if t.timestamp < cursor.last_timestamp {
                    return false;
                }
                if t.timestamp == cursor.last_timestamp {
                    let hash = t.transaction_hash.as_deref().unwrap_or("");
                    return !last_hashes.contains(hash);
                }
                true
            })
            .collect();
        Ok(new_trades)
    }

    fn persist(&self) {
        if let Err(e) = persist_json(&self.state_path, &self.cursors) {
            tracing::error!(error = %e, "Failed to persist recorder state");
        }
    }

    fn log_path(&self, trader: &TraderConfig) -> PathBuf {
        let wallet = trader.wallet_address.to_lowercase();
        let safe_name: String = trader
            .name
            .chars()
            .map(|c| if c.is_alphanumeric() { c } else { '_' })
            .collect();
        let safe_name = safe_name.trim_matches('_');
        let stem = if safe_name.is_empty() { "trader" } else { safe_name };
        self.output_dir.join(format!("{stem}_{wallet}.csv"))
    }
}

/// Cursor pointing just past the newest trade in `trades`.
fn cursor_from(trades: &[VenueTrade]) -> RecorderCursor {
    let last_timestamp = trades.iter().map(|t| t.timestamp).max().unwrap_or(0);
    let last_hashes = trades
        .iter()
        .filter(|t| t.timestamp == last_timestamp)
        .filter_map(|t| t.transaction_hash.clone())
        .collect();
    RecorderCursor {
        last_timestamp,
        last_hashes,
    }
}

fn write_full_log(path: &Path, trades: &[VenueTrade]) -> csv::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut writer = csv::Writer::from_path(path)?;
    for trade in trades {
        writer.serialize(HistoryRow::from_trade(trade))?;
    }
    writer.flush()?;
    Ok(())
}

fn append_log(path: &Path, trades: &[VenueTrade]) -> csv::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let exists = path.exists();
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    let mut writer = csv::WriterBuilder::new()
        .has_headers(!exists)
        .from_writer(file);
    for trade in trades {
        writer.serialize(HistoryRow::from_trade(trade))?;
    }
    writer.flush()?;
    Ok(())
}
