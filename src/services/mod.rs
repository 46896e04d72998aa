pub mod portfolio_tracker;
pub mod recorder;
pub mod trade_monitor;

pub use portfolio_tracker::PortfolioTracker;
pub use recorder::TradeRecorder;
pub use trade_monitor::TradeMonitor;
