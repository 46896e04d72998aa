pub mod executor;
pub mod ledger;
pub mod risk_manager;

pub use executor::{ExecutionOutcome, RetryPolicy, TradeExecutor};
pub use ledger::{ExposureLedger, LedgerSnapshot, LedgerView, ReservationToken};
pub use risk_manager::{decide, Decision, RiskContext, MIN_ORDER_USD};
