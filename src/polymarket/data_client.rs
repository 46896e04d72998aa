use reqwest::Client;
use rust_decimal::Decimal;

use crate::errors::VenueError;

use super::types::{ApiPosition, ApiTrade, GammaMarket};

const DATA_API_BASE: &str = "https://data-api.polymarket.com";
const GAMMA_API_BASE: &str = "https://gamma-api.polymarket.com";

/// Unauthenticated client for the public Data and Gamma APIs: leader trades,
/// leader positions, and market metadata.
#[derive(Debug, Clone)]
pub struct DataClient {
    http: Client,
    base_url: String,
    gamma_url: String,
}

impl DataClient {
    pub fn new(http: Client) -> Self {
        Self {
            http,
            base_url: DATA_API_BASE.into(),
            gamma_url: GAMMA_API_BASE.into(),
        }
    }

    /// Fetch a page of recent trades for a wallet, newest first as the API
    /// returns them.
    pub async fn get_trades(
        &self,
        wallet: &str,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<ApiTrade>, VenueError> {
        let url = format!("{}/trades", self.base_url);
        let resp = self
            .http
            .get(&url)
            .query(&[
                ("user", wallet.to_string()),
                ("limit", limit.to_string()),
                ("offset", offset.to_string()),
                ("takerOnly", "false".into()),
            ])
            .send()
            .await?;

        if !resp.status().is_success() {
            return Err(VenueError::from_status(resp.status(), "fetch trades"));
        }
        let trades: Vec<ApiTrade> = resp.json().await?;
        Ok(trades)
    }

    /// Fetch open positions for a wallet, filtered server-side to positions
    /// above `size_threshold` shares.
    pub async fn get_positions(
        &self,
        wallet: &str,
        size_threshold: Decimal,
    ) -> Result<Vec<ApiPosition>, VenueError> {
        let url = format!("{}/positions", self.base_url);
        let resp = self
            .http
            .get(&url)
            .query(&[
                ("user", wallet.to_string()),
                ("sortBy", "TOKENS".into()),
                ("sortDirection", "DESC".into()),
                ("sizeThreshold", size_threshold.to_string()),
            ])
            .send()
            .await?;

        if !resp.status().is_success() {
            return Err(VenueError::from_status(resp.status(), "fetch positions"));
        }
        let positions: Vec<ApiPosition> = resp.json().await?;
        Ok(positions)
    }

    /// Look up category and liquidity for a market via the Gamma API.
    pub async fn get_gamma_market(
        &self,
        condition_id: &str,
    ) -> Result<Option<GammaMarket>, VenueError> {
        let url = format!("{}/markets", self.gamma_url);
        let resp = self
            .http
            .get(&url)
            .query(&[("condition_ids", condition_id)])
            .send()
            .await?;

        if !resp.status().is_success() {
            return Err(VenueError::from_status(resp.status(), "fetch gamma market"));
        }
        let markets: Vec<GammaMarket> = resp.json().await?;
        Ok(markets.into_iter().next())
    }
}
