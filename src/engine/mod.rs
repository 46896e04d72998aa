use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::join_all;
use metrics::{counter, gauge};
use rust_decimal::Decimal;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::{sleep, Instant};

use crate::audit::AuditLog;
use crate::config::{Settings, TraderConfig};
use crate::errors::{LedgerError, VenueError};
use crate::execution::{
    decide, Decision, ExecutionOutcome, ExposureLedger, RetryPolicy, RiskContext, TradeExecutor,
};
use crate::models::FillEvent;
use crate::polymarket::VenueApi;
use crate::services::{PortfolioTracker, TradeMonitor};
use crate::state::{
    persist_json, read_json, ControlAction, ControlFile, LeaderStats, LeaderStatusRow,
    MonitorFile, StatePaths, StatusFile,
};

/// Consecutive portfolio-sync failures before a leader is marked faulted.
const FAULT_AFTER_SYNC_FAILURES: u32 = 3;

/// Ticks a SELL may wait for a post-fill portfolio snapshot before falling
/// back to fill-derived sizing.
const MAX_SELL_DEFERRALS: u32 = 3;

/// Pending-fill backlog beyond which the slow loop is skipped for a tick.
const BACKLOG_SLOW_LOOP_SKIP: usize = 256;

/// Relative and absolute divergence tolerated between persisted ledger state
/// and the venue's view of our positions before starting in observe mode.
const RECONCILE_REL_TOLERANCE: Decimal = Decimal::from_parts(1, 0, 0, false, 1); // 0.1
const RECONCILE_ABS_TOLERANCE: Decimal = Decimal::from_parts(10, 0, 0, false, 0); // $10

/// Why the engine stopped.
#[derive(Debug, Error)]
pub enum RunError {
    /// Venue credentials were rejected; exit code 2.
    #[error("venue authentication failed")]
    AuthFailure,

    /// Ledger protocol violation; a bug, the engine halts to stay correct.
    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

/// Per-leader lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaderStatus {
    Disabled,
    Enabled,
    Paused,
    Faulted,
}

impl LeaderStatus {
    fn as_str(&self) -> &'static str {
        match self {
            LeaderStatus::Disabled => "disabled",
            LeaderStatus::Enabled => "enabled",
            LeaderStatus::Paused => "paused",
            LeaderStatus::Faulted => "faulted",
        }
    }
}

struct LeaderRuntime {
    config: TraderConfig,
    status: LeaderStatus,
    sync_failures: u32,
    stats: LeaderStats,
}

struct DeferredFill {
    fill: FillEvent,
    attempts: u32,
}

/// The control loop: polls every enabled leader on the fast cadence,
/// refreshes portfolios on the slow cadence, and drives each fill through
/// risk sizing and execution.
pub struct Engine {
    settings: Settings,
    venue: Arc<dyn VenueApi>,
    monitor: TradeMonitor,
    tracker: PortfolioTracker,
    executor: TradeExecutor,
    ledger: ExposureLedger,
    audit: AuditLog,
    paths: StatePaths,
    leaders: HashMap<String, LeaderRuntime>,
    deferred: Vec<DeferredFill>,
    observe_mode: bool,
    stop_requested: bool,
}

impl Engine {
    pub fn new(settings: Settings, venue: Arc<dyn VenueApi>) -> Self {
        let ledger = ExposureLedger::new(settings.risk_management.global.max_total_exposure);
        let monitor = TradeMonitor::new(Arc::clone(&venue), settings.monitoring.poll_interval);
        let tracker = PortfolioTracker::new(Arc::clone(&venue));
        let executor = TradeExecutor::new(
            Arc::clone(&venue),
            ledger.clone(),
            RetryPolicy::default(),
            settings.dry_run,
        );
        let audit = AuditLog::new(settings.logging.trades_file.clone());
        let paths = StatePaths::new(&settings.state_dir);

        let leaders = settings
            .traders
            .iter()
            .map(|t| {
                let status = if t.enabled {
                    LeaderStatus::Enabled
                } else {
                    LeaderStatus::Disabled
                };
                (
                    t.wallet_address.to_lowercase(),
                    LeaderRuntime {
                        config: t.clone(),
                        status,
                        sync_failures: 0,
                        stats: LeaderStats::default(),
                    },
                )
            })
            .collect();

        Self {
            settings,
            venue,
            monitor,
            tracker,
            executor,
            ledger,
            audit,
            paths,
            leaders,
            deferred: Vec::new(),
            observe_mode: false,
            stop_requested: false,
        }
    }

    pub fn ledger(&self) -> ExposureLedger {
        self.ledger.clone()
    }

    pub fn leader_status(&self, wallet: &str) -> Option<LeaderStatus> {
        self.leaders.get(&wallet.to_lowercase()).map(|l| l.status)
    }

    pub fn observe_mode(&self) -> bool {
        self.observe_mode
    }

    /// Restore persisted state, reconcile against the venue, and run the
    /// fast/slow loops until shutdown.
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) -> Result<(), RunError> {
        self.restore_state().await;
        self.reconcile().await;

        let enabled: Vec<String> = self
            .leaders
            .values()
            .filter(|l| l.status == LeaderStatus::Enabled)
            .map(|l| format!("{} ({})", l.config.name, l.config.wallet_address))
            .collect();
        if enabled.is_empty() {
            tracing::info!("Starting with no enabled traders");
        } else {
            tracing::info!(count = enabled.len(), "Watching traders");
            for entry in &enabled {
                tracing::info!("- {entry}");
            }
        }

        // Deployment stats must exist before the first fill is sized.
        self.sync_portfolios().await;
        let mut last_sync = Instant::now();
        let poll_interval = Duration::from_secs(self.settings.monitoring.poll_interval);
        let sync_interval = Duration::from_secs(self.settings.monitoring.portfolio_sync_interval);

        loop {
            if *shutdown.borrow() || self.stop_requested {
                break;
            }

            self.apply_control_commands();
            if self.stop_requested {
                break;
            }

            if last_sync.elapsed() >= sync_interval {
                if self.deferred.len() > BACKLOG_SLOW_LOOP_SKIP {
                    tracing::warn!(
                        backlog = self.deferred.len(),
                        "Fill backlog too deep; skipping portfolio sync this tick"
                    );
                } else {
                    self.sync_portfolios().await;
                    last_sync = Instant::now();
                }
            }

            self.tick().await?;
            self.persist_state().await;

            tokio::select! {
                _ = sleep(poll_interval) => {}
                _ = shutdown.changed() => {}
            }
        }

        tracing::info!("Draining and persisting before shutdown");
        self.persist_state().await;
        Ok(())
    }

    /// One fast-loop pass: poll all watchable leaders concurrently, then
    /// process deferred SELLs and fresh fills in order.
    pub async fn tick(&mut self) -> Result<(), RunError> {
        let watchable: Vec<TraderConfig> = self
            .leaders
            .values()
            .filter(|l| {
                matches!(
                    l.status,
                    LeaderStatus::Enabled | LeaderStatus::Paused | LeaderStatus::Faulted
                )
            })
            .map(|l| l.config.clone())
            .collect();

        let polls = join_all(
            watchable
                .iter()
                .map(|leader| self.monitor.poll(leader)),
        )
        .await;

        let mut fresh: Vec<FillEvent> = Vec::new();
        for (leader, result) in watchable.iter().zip(polls) {
            let wallet = leader.wallet_address.to_lowercase();
            match result {
                Ok(fills) => {
                    if fills.is_empty() {
                        continue;
                    }
                    counter!("fills_observed_total").increment(fills.len() as u64);
                    let status = self
                        .leaders
                        .get(&wallet)
                        .map(|l| l.status)
                        .unwrap_or(LeaderStatus::Disabled);
                    if status == LeaderStatus::Paused {
                        // Cursor advanced; fills are intentionally not mirrored.
                        tracing::debug!(
                            leader = %leader.name,
                            count = fills.len(),
                            "Leader paused; fills observed but not mirrored"
                        );
                        continue;
                    }
                    fresh.extend(fills);
                }
                Err(VenueError::Auth(msg)) => {
                    tracing::error!(leader = %leader.name, error = %msg, "Auth failure while polling");
                    return Err(RunError::AuthFailure);
                }
                Err(e) => {
                    tracing::warn!(leader = %leader.name, error = %e, "Trade poll failed");
                }
            }
        }

        // Deferred SELLs are older than anything just polled.
        let deferred = std::mem::take(&mut self.deferred);
        for entry in deferred {
            let allow_stale = entry.attempts >= MAX_SELL_DEFERRALS;
            self.process_fill(entry.fill, entry.attempts + 1, allow_stale)
                .await?;
        }

        for fill in fresh {
            self.process_fill(fill, 0, false).await?;
        }

        gauge!("global_exposure_usd")
            .set(decimal_to_f64(self.ledger.global_exposure().await));
        Ok(())
    }

    async fn process_fill(
        &mut self,
        fill: FillEvent,
        deferral_attempts: u32,
        allow_stale_sell: bool,
    ) -> Result<(), RunError> {
        if self.ledger.is_processed(&fill.trade_id).await {
            tracing::info!(trade_id = %fill.trade_id, "duplicate trade_id; skipping");
            return Ok(());
        }

        let wallet = fill.leader_wallet.clone();
        let market_meta = self.executor.market_meta(&fill.market).await;
        let snapshot = self.tracker.get(&wallet).await;
        let previous = self.tracker.get_previous(&wallet).await;
        let position = self.ledger.position_of(&fill.market, &fill.token_id).await;
        let view = self.ledger.view().await;

        let ctx = RiskContext {
            snapshot: snapshot.as_ref(),
            previous_snapshot: previous.as_ref(),
            market: market_meta.as_ref(),
            mirror_position: position.as_ref(),
            ledger: &view,
            allow_stale_sell,
        };
        let decision = decide(&fill, &ctx, &self.settings.risk_management);

        match decision {
            Decision::Buy {
                mirror_usd,
                shares,
                note,
            } => {
                if self.observe_mode {
                    tracing::info!(
                        leader = %fill.leader_name,
                        mirror_usd = %mirror_usd,
                        "Observe mode: would mirror BUY"
                    );
                    self.finalize(&fill, "observed", Decimal::ZERO, mirror_usd, &note, "", "")
                        .await;
                    return Ok(());
                }
                let outcome = self.executor.execute_buy(&fill, mirror_usd, shares).await?;
                self.handle_outcome(&fill, outcome, &note).await?;
            }
            Decision::Reduce { fraction, note } => {
                if self.observe_mode {
                    tracing::info!(
                        leader = %fill.leader_name,
                        fraction = %fraction,
                        "Observe mode: would reduce mirror position"
                    );
                    self.finalize(&fill, "observed", Decimal::ZERO, Decimal::ZERO, &note, "", "")
                        .await;
                    return Ok(());
                }
                let outcome = self.executor.execute_reduction(&fill, fraction).await?;
                self.handle_outcome(&fill, outcome, &note).await?;
            }
            Decision::Reject { reason } => {
                tracing::warn!(
                    leader = %fill.leader_name,
                    reason = %reason,
                    "Rejected mirror"
                );
                counter!("mirrors_rejected_total").increment(1);
                self.bump_stats(&wallet, |s| s.rejected_trades += 1);
                self.finalize(&fill, "rejected", Decimal::ZERO, Decimal::ZERO, &reason, "", "")
                    .await;
            }
            Decision::Skip { reason } => {
                tracing::info!(
                    leader = %fill.leader_name,
                    reason = %reason,
                    "Skipping fill"
                );
                counter!("mirrors_skipped_total").increment(1);
                self.bump_stats(&wallet, |s| s.skipped_trades += 1);
                self.finalize(&fill, "skipped", Decimal::ZERO, Decimal::ZERO, &reason, "", "")
                    .await;
            }
            Decision::Defer { reason } => {
                tracing::debug!(
                    leader = %fill.leader_name,
                    reason = %reason,
                    attempts = deferral_attempts,
                    "Deferring SELL one tick"
                );
                self.deferred.push(DeferredFill {
                    fill,
                    attempts: deferral_attempts,
                });
            }
        }
        Ok(())
    }

    async fn handle_outcome(
        &mut self,
        fill: &FillEvent,
        outcome: ExecutionOutcome,
        note: &str,
    ) -> Result<(), RunError> {
        let wallet = fill.leader_wallet.clone();
        match outcome {
            ExecutionOutcome::Executed {
                mirror_usd,
                shares,
                order_id,
                status,
                realized_pnl,
                ..
            } => {
                tracing::info!(
                    leader = %fill.leader_name,
                    side = %fill.side,
                    mirror_usd = %mirror_usd,
                    shares = %shares,
                    order_id = ?order_id,
                    note = %note,
                    "Mirror executed"
                );
                counter!("mirrors_executed_total").increment(1);
                self.bump_stats(&wallet, |s| {
                    s.copied_trades += 1;
                    if fill.side == crate::models::Side::Buy {
                        s.copied_usd += mirror_usd;
                    }
                    if let Some(pnl) = realized_pnl {
                        s.realized_pnl += pnl;
                    }
                });
                self.finalize(
                    fill,
                    "executed",
                    shares,
                    mirror_usd,
                    note,
                    &status,
                    order_id.as_deref().unwrap_or(""),
                )
                .await;
            }
            ExecutionOutcome::LedgerRejected { reason } => {
                tracing::warn!(leader = %fill.leader_name, reason = %reason, "Ledger rejected mirror");
                counter!("mirrors_rejected_total").increment(1);
                self.bump_stats(&wallet, |s| s.rejected_trades += 1);
                self.finalize(fill, "rejected", Decimal::ZERO, Decimal::ZERO, &reason, "", "")
                    .await;
            }
            ExecutionOutcome::Failed { reason, auth } => {
                if auth {
                    tracing::error!(reason = %reason, "Order placement failed authentication");
                    return Err(RunError::AuthFailure);
                }
                tracing::error!(leader = %fill.leader_name, reason = %reason, "Mirror failed");
                counter!("mirrors_failed_total").increment(1);
                self.bump_stats(&wallet, |s| s.failed_trades += 1);
                self.finalize(fill, "failed", Decimal::ZERO, Decimal::ZERO, &reason, "", "")
                    .await;
            }
            ExecutionOutcome::NoPosition => {
                counter!("mirrors_skipped_total").increment(1);
                self.bump_stats(&wallet, |s| s.skipped_trades += 1);
                self.finalize(
                    fill,
                    "skipped",
                    Decimal::ZERO,
                    Decimal::ZERO,
                    "no mirror position to reduce",
                    "",
                    "",
                )
                .await;
            }
        }
        Ok(())
    }

    /// Mark a final verdict: processed-fill bookkeeping plus the audit row.
    #[allow(clippy::too_many_arguments)]
    async fn finalize(
        &mut self,
        fill: &FillEvent,
        event_type: &str,
        shares: Decimal,
        usd: Decimal,
        reason: &str,
        order_status: &str,
        order_id: &str,
    ) {
        self.ledger.mark_processed(&fill.trade_id).await;
        let stats = self
            .leaders
            .get(&fill.leader_wallet)
            .map(|l| l.stats)
            .unwrap_or_default();
        self.audit.record(
            event_type,
            fill,
            shares,
            usd,
            reason,
            order_status,
            order_id,
            &stats,
        );
    }

    fn bump_stats(&mut self, wallet: &str, update: impl FnOnce(&mut LeaderStats)) {
        if let Some(leader) = self.leaders.get_mut(wallet) {
            update(&mut leader.stats);
        }
    }

    /// Slow loop: refresh every enabled leader's portfolio concurrently.
    /// Repeated failures fault a leader; a success restores it.
    pub async fn sync_portfolios(&mut self) {
        let wallets: Vec<String> = self
            .leaders
            .values()
            .filter(|l| matches!(l.status, LeaderStatus::Enabled | LeaderStatus::Faulted))
            .map(|l| l.config.wallet_address.to_lowercase())
            .collect();

        let results = join_all(wallets.iter().map(|w| self.tracker.sync(w))).await;

        for (wallet, result) in wallets.iter().zip(results) {
            let Some(leader) = self.leaders.get_mut(wallet) else {
                continue;
            };
            match result {
                Ok(_) => {
                    leader.sync_failures = 0;
                    if leader.status == LeaderStatus::Faulted {
                        tracing::info!(leader = %leader.config.name, "Leader recovered from faulted state");
                        leader.status = LeaderStatus::Enabled;
                    }
                }
                Err(e) => {
                    leader.sync_failures += 1;
                    tracing::warn!(
                        leader = %leader.config.name,
                        failures = leader.sync_failures,
                        error = %e,
                        "Portfolio sync failed"
                    );
                    if leader.sync_failures >= FAULT_AFTER_SYNC_FAILURES
                        && leader.status == LeaderStatus::Enabled
                    {
                        tracing::error!(leader = %leader.config.name, "Leader faulted after repeated sync failures");
                        leader.status = LeaderStatus::Faulted;
                    }
                }
            }
        }

        let enabled = self
            .leaders
            .values()
            .filter(|l| l.status == LeaderStatus::Enabled)
            .count();
        gauge!("enabled_leaders").set(enabled as f64);
    }

    /// Consume pause/resume/stop commands written by the CLI.
    pub fn apply_control_commands(&mut self) {
        for command in ControlFile::drain(&self.paths.control()) {
            match command.action {
                ControlAction::Stop => {
                    tracing::info!("Stop requested via control file");
                    self.stop_requested = true;
                }
                ControlAction::Pause | ControlAction::Resume => {
                    let Some(name) = command.trader_name.as_deref() else {
                        continue;
                    };
                    let Some(leader) = self
                        .leaders
                        .values_mut()
                        .find(|l| l.config.name == name)
                    else {
                        tracing::warn!(trader = %name, "Control command for unknown trader");
                        continue;
                    };
                    match (command.action, leader.status) {
                        (ControlAction::Pause, LeaderStatus::Enabled | LeaderStatus::Faulted) => {
                            tracing::info!(trader = %name, "Pausing leader");
                            leader.status = LeaderStatus::Paused;
                        }
                        (ControlAction::Resume, LeaderStatus::Paused) => {
                            tracing::info!(trader = %name, "Resuming leader");
                            leader.status = LeaderStatus::Enabled;
                        }
                        _ => {}
                    }
                }
            }
        }
    }

    async fn restore_state(&mut self) {
        if let Some(snapshot) = read_json(&self.paths.ledger()) {
            self.ledger.restore(snapshot).await;
            tracing::info!("Restored ledger state from disk");
        }
        if let Some(monitor) = read_json::<MonitorFile>(&self.paths.monitor()) {
            self.monitor.restore_cursors(monitor.per_leader).await;
            for fill in monitor.deferred_fills {
                self.deferred.push(DeferredFill { fill, attempts: 0 });
            }
            tracing::info!("Restored monitor cursors from disk");
        }
    }

    /// Compare persisted exposure with the venue's view of our own wallet.
    /// A material divergence starts the engine in observe mode: decisions
    /// are logged, no orders are placed, and the discrepancy is surfaced.
    async fn reconcile(&mut self) {
        let Some(funder) = self.settings.your_account.funder_address.clone() else {
            return;
        };
        let ledger_exposure = self.ledger.global_exposure().await;

        match self
            .venue
            .fetch_positions(&funder, Decimal::new(1, 1))
            .await
        {
            Ok(positions) => {
                let venue_notional: Decimal = positions.iter().map(|p| p.current_value).sum();
                let diff = (venue_notional - ledger_exposure).abs();
                let tolerance =
                    (ledger_exposure * RECONCILE_REL_TOLERANCE).max(RECONCILE_ABS_TOLERANCE);
                if diff > tolerance {
                    tracing::error!(
                        ledger = %ledger_exposure,
                        venue = %venue_notional,
                        "Ledger and venue positions diverge; starting in observe mode"
                    );
                    self.observe_mode = true;
                } else {
                    tracing::info!(
                        ledger = %ledger_exposure,
                        venue = %venue_notional,
                        "Reconciliation within tolerance"
                    );
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "Could not reconcile positions at startup");
            }
        }
    }

    pub async fn persist_state(&self) {
        let snapshot = self.ledger.snapshot().await;
        if let Err(e) = persist_json(&self.paths.ledger(), &snapshot) {
            tracing::error!(error = %e, "Failed to persist ledger state");
        }

        let monitor = MonitorFile {
            per_leader: self.monitor.export_cursors().await,
            deferred_fills: self.deferred.iter().map(|d| d.fill.clone()).collect(),
        };
        if let Err(e) = persist_json(&self.paths.monitor(), &monitor) {
            tracing::error!(error = %e, "Failed to persist monitor state");
        }

        let mut leaders = Vec::with_capacity(self.leaders.len());
        for leader in self.leaders.values() {
            let exposure = self
                .ledger
                .exposure_of(&leader.config.wallet_address.to_lowercase())
                .await;
            let utilization = if leader.config.allocated_capital > Decimal::ZERO {
                exposure / leader.config.allocated_capital * Decimal::ONE_HUNDRED
            } else {
                Decimal::ZERO
            };
            leaders.push(LeaderStatusRow {
                name: leader.config.name.clone(),
                wallet: leader.config.wallet_address.clone(),
                state: leader.status.as_str().to_string(),
                allocated_capital: leader.config.allocated_capital,
                exposure,
                utilization_pct: utilization,
                stats: leader.stats,
            });
        }
        leaders.sort_by(|a, b| a.name.cmp(&b.name));

        let status = StatusFile {
            updated_at: Utc::now(),
            poll_interval_secs: self.settings.monitoring.poll_interval,
            observe_mode: self.observe_mode,
            global_exposure: self.ledger.global_exposure().await,
            max_total_exposure: self.settings.risk_management.global.max_total_exposure,
            leaders,
        };
        if let Err(e) = persist_json(&self.paths.status(), &status) {
            tracing::error!(error = %e, "Failed to persist status file");
        }
    }
}

fn decimal_to_f64(d: Decimal) -> f64 {
    use rust_decimal::prelude::ToPrimitive;
    d.to_f64().unwrap_or(0.0)
}
