use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};

use chrono::Utc;
use rust_decimal::Decimal;
use serde::Serialize;

use crate::models::FillEvent;
use crate::state::LeaderStats;

/// One audit row per attempted mirror, accepted or not.
#[derive(Debug, Clone, Serialize)]
pub struct AuditRow<'a> {
    pub timestamp: String,
    pub event_type: &'a str,
    pub trader_name: &'a str,
    pub trader_wallet: &'a str,
    pub market: &'a str,
    pub title: &'a str,
    pub outcome: &'a str,
    pub side: String,
    pub trader_size: Decimal,
    pub trader_price: Decimal,
    pub mirror_shares: Decimal,
    pub mirror_usd: Decimal,
    pub reason: &'a str,
    pub order_status: &'a str,
    pub order_id: &'a str,
    pub stats_copied_trades: u64,
    pub stats_copied_usd: Decimal,
    pub stats_rejected_trades: u64,
    pub stats_failed_trades: u64,
    pub stats_skipped_trades: u64,
}

/// Append-only CSV audit log. Single writer; the engine owns it.
pub struct AuditLog {
    path: Option<PathBuf>,
}

impl AuditLog {
    pub fn new(path: Option<impl Into<PathBuf>>) -> Self {
        Self {
            path: path.map(Into::into),
        }
    }

    pub fn disabled() -> Self {
        Self { path: None }
    }

    /// Record a mirror attempt. Failures to write are logged and swallowed;
    /// the audit trail never takes the engine down.
    #[allow(clippy::too_many_arguments)]
    pub fn record(
        &self,
        event_type: &str,
        fill: &FillEvent,
        mirror_shares: Decimal,
        mirror_usd: Decimal,
        reason: &str,
        order_status: &str,
        order_id: &str,
        stats: &LeaderStats,
    ) {
        let Some(path) = &self.path else { return };

        let row = AuditRow {
            timestamp: Utc::now().to_rfc3339(),
            event_type,
            trader_name: &fill.leader_name,
            trader_wallet: &fill.leader_wallet,
            market: &fill.market,
            title: fill.title.as_deref().unwrap_or(""),
            outcome: fill.outcome.as_deref().unwrap_or(""),
            side: fill.side.to_string(),
            trader_size: fill.size,
            trader_price: fill.price,
            mirror_shares,
            mirror_usd,
            reason,
            order_status,
            order_id,
            stats_copied_trades: stats.copied_trades,
            stats_copied_usd: stats.copied_usd,
            stats_rejected_trades: stats.rejected_trades,
            stats_failed_trades: stats.failed_trades,
            stats_skipped_trades: stats.skipped_trades,
        };

        if let Err(e) = append_row(path, &row) {
            tracing::error!(error = %e, path = %path.display(), "Failed to write audit row");
        }
    }
}

fn append_row(path: &Path, row: &AuditRow<'_>) -> csv::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let exists = path.exists();
    let file = OpenOptions::new().create(true).append(true).open(path)?;

    let mut writer = csv::WriterBuilder::new()
        .has_headers(!exists)
        .from_writer(file);
    writer.serialize(row)?;
    writer.flush()?;
    Ok(())
}
