pub mod auth;
pub mod clob_client;
pub mod data_client;
pub mod types;
pub mod venue;

pub use auth::VenueCredentials;
pub use clob_client::ClobClient;
pub use data_client::DataClient;
pub use types::{MarketMeta, OrderRequest, OrderResult, OrderType, VenueTrade};
pub use venue::{PolymarketVenue, VenueApi};
