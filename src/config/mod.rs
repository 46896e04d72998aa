use std::collections::HashSet;
use std::env;
use std::fs;
use std::path::Path;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::errors::ConfigError;

/// Operator account credentials and capital. Credential fields accept
/// `env:NAME` references resolved at load time.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AccountConfig {
    pub api_key: String,
    pub api_secret: String,
    pub api_passphrase: String,
    pub total_capital: Decimal,
    /// Operator wallet, used only for restart reconciliation.
    #[serde(default)]
    pub funder_address: Option<String>,
}

/// One leader wallet to mirror.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TraderConfig {
    pub name: String,
    pub wallet_address: String,
    pub allocated_capital: Decimal,
    pub enabled: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GlobalRisk {
    pub max_total_exposure: Decimal,
    pub max_single_bet: Decimal,
    #[serde(default)]
    pub reserve_capital: Decimal,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PerTraderRisk {
    pub min_portfolio_value: Decimal,
    /// Fraction of the leader's allocated capital a single mirror may use.
    pub max_position_pct: Decimal,
    #[serde(default = "default_true")]
    pub use_portfolio_proportion: bool,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct MarketFilters {
    #[serde(default)]
    pub whitelist_categories: Vec<String>,
    #[serde(default)]
    pub blacklist_categories: Vec<String>,
    #[serde(default)]
    pub min_liquidity: Decimal,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RiskConfig {
    pub global: GlobalRisk,
    pub per_trader: PerTraderRisk,
    #[serde(default)]
    pub market_filters: MarketFilters,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MonitoringConfig {
    #[serde(default = "default_poll_interval")]
    pub poll_interval: u64,
    #[serde(default = "default_sync_interval")]
    pub portfolio_sync_interval: u64,
    /// Optional Prometheus listen address, e.g. "127.0.0.1:9464".
    #[serde(default)]
    pub metrics_listen: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct LoggingConfig {
    #[serde(default)]
    pub level: Option<String>,
    #[serde(default)]
    pub file: Option<String>,
    #[serde(default)]
    pub trades_file: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TrackingConfig {
    #[serde(default = "default_tracking_interval")]
    pub poll_interval: u64,
    #[serde(default = "default_tracking_dir")]
    pub output_dir: String,
}

impl Default for TrackingConfig {
    fn default() -> Self {
        Self {
            poll_interval: default_tracking_interval(),
            output_dir: default_tracking_dir(),
        }
    }
}

/// Fully expanded and validated settings tree.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Settings {
    pub your_account: AccountConfig,
    pub traders: Vec<TraderConfig>,
    pub risk_management: RiskConfig,
    pub monitoring: MonitoringConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub trade_tracking: TrackingConfig,
    /// Log intent and keep the ledger, but place no orders.
    #[serde(default)]
    pub dry_run: bool,
    #[serde(default = "default_state_dir")]
    pub state_dir: String,
}

fn default_true() -> bool {
    true
}
fn default_poll_interval() -> u64 {
    5
}
fn default_sync_interval() -> u64 {
    60
}
fn default_tracking_interval() -> u64 {
    30
}
fn default_tracking_dir() -> String {
    "state/trader_trades".into()
}
fn default_state_dir() -> String {
    "state".into()
}

impl Settings {
    /// Load, expand `env:` references, and validate a YAML settings file.
    pub fn load(path: &str) -> Result<Self, ConfigError> {
        if !Path::new(path).exists() {
            return Err(ConfigError::NotFound(path.to_string()));
        }
        let raw = fs::read_to_string(path)
            .map_err(|e| ConfigError::Parse(format!("{path}: {e}")))?;
        Self::from_yaml_str(&raw)
    }

    pub fn from_yaml_str(raw: &str) -> Result<Self, ConfigError> {
        let mut value: serde_yaml::Value =
            serde_yaml::from_str(raw).map_err(|e| ConfigError::Parse(e.to_string()))?;
        expand_env_refs(&mut value)?;

        let settings: Settings =
            serde_yaml::from_value(value).map_err(|e| ConfigError::Parse(e.to_string()))?;
        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let allocated: Decimal = self
            .traders
            .iter()
            .filter(|t| t.enabled)
            .map(|t| t.allocated_capital)
            .sum();
        let available =
            self.your_account.total_capital - self.risk_management.global.reserve_capital;
        if allocated > available {
            return Err(ConfigError::Invalid(format!(
                "allocated capital {allocated} exceeds total_capital minus reserve ({available})"
            )));
        }

        for t in &self.traders {
            let addr = t.wallet_address.to_lowercase();
            if !addr.starts_with("0x") || addr.len() != 42 {
                return Err(ConfigError::Invalid(format!(
                    "invalid wallet address for trader '{}': {}",
                    t.name, t.wallet_address
                )));
            }
            if t.allocated_capital <= Decimal::ZERO {
                return Err(ConfigError::Invalid(format!(
                    "allocated_capital must be positive for trader '{}'",
                    t.name
                )));
            }
        }

        let mut seen = HashSet::new();
        for t in &self.traders {
            if !seen.insert(t.wallet_address.to_lowercase()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate trader wallet {}",
                    t.wallet_address
                )));
            }
        }

        if self.risk_management.global.max_total_exposure <= Decimal::ZERO {
            return Err(ConfigError::Invalid(
                "risk_management.global.max_total_exposure must be > 0".into(),
            ));
        }
        if self.monitoring.poll_interval == 0 {
            return Err(ConfigError::Invalid(
                "monitoring.poll_interval must be > 0".into(),
            ));
        }
        let pct = self.risk_management.per_trader.max_position_pct;
        if pct <= Decimal::ZERO || pct > Decimal::ONE {
            return Err(ConfigError::Invalid(
                "risk_management.per_trader.max_position_pct must be in (0, 1]".into(),
            ));
        }
        Ok(())
    }

    pub fn trader_by_name(&self, name: &str) -> Option<&TraderConfig> {
        self.traders.iter().find(|t| t.name == name)
    }

    pub fn enabled_traders(&self) -> impl Iterator<Item = &TraderConfig> {
        self.traders.iter().filter(|t| t.enabled)
    }
}

/// Walk the YAML tree replacing every `env:NAME` string with the value of the
/// environment variable. A missing variable is a fatal config error.
fn expand_env_refs(value: &mut serde_yaml::Value) -> Result<(), ConfigError> {
    match value {
        serde_yaml::Value::String(s) => {
            if let Some(var) = s.strip_prefix("env:") {
                let resolved =
                    env::var(var).map_err(|_| ConfigError::MissingEnv(var.to_string()))?;
                *s = resolved;
            }
            Ok(())
        }
        serde_yaml::Value::Sequence(seq) => {
            for item in seq {
                expand_env_refs(item)?;
            }
            Ok(())
        }
        serde_yaml::Value::Mapping(map) => {
            for (_, v) in map.iter_mut() {
                expand_env_refs(v)?;
            }
            Ok(())
        }
        _ => Ok(()),
    }
}
