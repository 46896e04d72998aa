use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::execution::LedgerSnapshot;
use crate::services::trade_monitor::MonitorCursor;

/// Locations of everything the engine persists under the state directory.
#[derive(Debug, Clone)]
pub struct StatePaths {
    dir: PathBuf,
}

impl StatePaths {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn ledger(&self) -> PathBuf {
        self.dir.join("ledger.json")
    }

    pub fn monitor(&self) -> PathBuf {
        self.dir.join("monitor.json")
    }

    pub fn status(&self) -> PathBuf {
        self.dir.join("engine_status.json")
    }

    pub fn control(&self) -> PathBuf {
        self.dir.join("control.json")
    }

    pub fn recorder(&self) -> PathBuf {
        self.dir.join("trade_history_state.json")
    }
}

/// Write a JSON document, creating parent directories as needed.
pub fn persist_json<T: Serialize>(path: &Path, value: &T) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let body = serde_json::to_string_pretty(value)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    fs::write(path, body)
}

/// Read a JSON document; absent or unreadable files yield None.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Option<T> {
    let body = fs::read_to_string(path).ok()?;
    serde_json::from_str(&body).ok()
}

// ---------------------------------------------------------------------------
// File shapes
// ---------------------------------------------------------------------------

/// `state/ledger.json` — exposures and mirror positions for crash recovery.
pub type LedgerFile = LedgerSnapshot;

/// `state/monitor.json` — per-leader poll cursors, plus any SELL fills still
/// waiting on a portfolio sync (their ids are already in the dedup window,
/// so they would otherwise be lost across a restart).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MonitorFile {
    pub per_leader: HashMap<String, MonitorCursor>,
    #[serde(default)]
    pub deferred_fills: Vec<crate::models::FillEvent>,
}

/// Running counters per leader, carried in the status file and audit rows.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct LeaderStats {
    pub copied_trades: u64,
    pub copied_usd: Decimal,
    pub rejected_trades: u64,
    pub failed_trades: u64,
    pub skipped_trades: u64,
    /// Realized P&L from mirror reductions.
    #[serde(default)]
    pub realized_pnl: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaderStatusRow {
    pub name: String,
    pub wallet: String,
    pub state: String,
    pub allocated_capital: Decimal,
    pub exposure: Decimal,
    pub utilization_pct: Decimal,
    #[serde(flatten)]
    pub stats: LeaderStats,
}

/// `state/engine_status.json` — snapshot for the `status` CLI command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusFile {
    pub updated_at: DateTime<Utc>,
    pub poll_interval_secs: u64,
    pub observe_mode: bool,
    pub global_exposure: Decimal,
    pub max_total_exposure: Decimal,
    pub leaders: Vec<LeaderStatusRow>,
}

impl StatusFile {
    /// Whether the writing engine looks alive, given its poll cadence.
    pub fn is_fresh(&self) -> bool {
        let age = Utc::now() - self.updated_at;
        age.num_seconds() >= 0 && (age.num_seconds() as u64) <= self.poll_interval_secs * 3 + 5
    }
}

/// Commands written by the CLI, consumed by the running engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlAction {
    Pause,
    Resume,
    Stop,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlCommand {
    pub action: ControlAction,
    #[serde(default)]
    pub trader_name: Option<String>,
    pub issued_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ControlFile {
    pub commands: Vec<ControlCommand>,
}

impl ControlFile {
    /// Append a command to the control file at `path`.
    pub fn append(path: &Path, command: ControlCommand) -> io::Result<()> {
        let mut file: ControlFile = read_json(path).unwrap_or_default();
        file.commands.push(command);
        persist_json(path, &file)
    }

    /// Take all pending commands, truncating the file.
    pub fn drain(path: &Path) -> Vec<ControlCommand> {
        let file: ControlFile = match read_json(path) {
            Some(f) => f,
            None => return vec![],
        };
        if !file.commands.is_empty() {
            let _ = persist_json(path, &ControlFile::default());
        }
        file.commands
    }
}

/// `state/trade_history_state.json` — recorder resume cursors.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RecorderFile {
    pub per_trader: HashMap<String, RecorderCursor>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RecorderCursor {
    pub last_timestamp: i64,
    /// Hashes seen at `last_timestamp`, to break ties on resume.
    pub last_hashes: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn json_round_trip_creates_directories() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested/state.json");

        let file = MonitorFile {
            per_leader: HashMap::from([(
                "0xw".to_string(),
                MonitorCursor {
                    last_seen_ts: 42,
                    recent_ids: vec!["a".into()],
                },
            )]),
            deferred_fills: vec![],
        };
        persist_json(&path, &file).unwrap();

        let restored: MonitorFile = read_json(&path).unwrap();
        assert_eq!(restored.per_leader["0xw"].last_seen_ts, 42);
    }

    #[test]
    fn missing_file_reads_none() {
        let restored: Option<MonitorFile> = read_json(Path::new("/nonexistent/state.json"));
        assert!(restored.is_none());
    }

    #[test]
    fn control_file_appends_and_drains() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("control.json");

        ControlFile::append(
            &path,
            ControlCommand {
                action: ControlAction::Pause,
                trader_name: Some("alice".into()),
                issued_at: Utc::now(),
            },
        )
        .unwrap();
        ControlFile::append(
            &path,
            ControlCommand {
                action: ControlAction::Stop,
                trader_name: None,
                issued_at: Utc::now(),
            },
        )
        .unwrap();

        let drained = ControlFile::drain(&path);
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].action, ControlAction::Pause);

        assert!(ControlFile::drain(&path).is_empty());
    }

    #[test]
    fn stale_status_detected() {
        let fresh = StatusFile {
            updated_at: Utc::now(),
            poll_interval_secs: 5,
            observe_mode: false,
            global_exposure: Decimal::ZERO,
            max_total_exposure: Decimal::from(5000),
            leaders: vec![],
        };
        assert!(fresh.is_fresh());

        let stale = StatusFile {
            updated_at: Utc::now() - chrono::Duration::minutes(10),
            ..fresh
        };
        assert!(!stale.is_fresh());
    }
}
