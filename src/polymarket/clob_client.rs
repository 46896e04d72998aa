use reqwest::{Client, RequestBuilder};
use rust_decimal::Decimal;
use serde_json::json;

use crate::errors::VenueError;
use crate::models::Side;

use super::auth::VenueCredentials;
use super::types::{
    ApiOrderResponse, ClobMarket, MidpointResponse, OpenOrder, OrderRequest, OrderResult,
    OrderType,
};

const CLOB_API_BASE: &str = "https://clob.polymarket.com";

/// Authenticated client for the CLOB API: market metadata, midpoints, and
/// order placement.
#[derive(Debug, Clone)]
pub struct ClobClient {
    http: Client,
    creds: VenueCredentials,
    base_url: String,
}

impl ClobClient {
    pub fn new(http: Client, creds: VenueCredentials) -> Self {
        Self {
            http,
            creds,
            base_url: CLOB_API_BASE.into(),
        }
    }

    /// Build an authenticated request with HMAC signature headers.
    fn authenticated(
        &self,
        method: reqwest::Method,
        path: &str,
        body: &str,
    ) -> Result<RequestBuilder, VenueError> {
        let timestamp = chrono::Utc::now().timestamp().to_string();
        let signature = self
            .creds
            .sign(&timestamp, method.as_str(), path, body)
            .map_err(|e| VenueError::Auth(e.to_string()))?;

        let url = format!("{}{}", self.base_url, path);
        let req = self
            .http
            .request(method, &url)
            .header("POLY-API-KEY", &self.creds.api_key)
            .header("POLY-SIGNATURE", signature)
            .header("POLY-TIMESTAMP", &timestamp)
            .header("POLY-PASSPHRASE", &self.creds.passphrase);

        Ok(req)
    }

    /// Fetch tick size, min order size, and neg-risk flag for a market.
    pub async fn get_market(&self, condition_id: &str) -> Result<ClobMarket, VenueError> {
        let path = format!("/markets/{condition_id}");
        let resp = self
            .authenticated(reqwest::Method::GET, &path, "")?
            .send()
            .await?;

        if !resp.status().is_success() {
            return Err(VenueError::from_status(resp.status(), "fetch market"));
        }
        let market: ClobMarket = resp.json().await?;
        Ok(market)
    }

    /// Current midpoint for a token, None when the book is empty.
    pub async fn get_midpoint(&self, token_id: &str) -> Result<Option<Decimal>, VenueError> {
        let path = format!("/midpoint?token_id={token_id}");
        let resp = self
            .authenticated(reqwest::Method::GET, &path, "")?
            .send()
            .await?;

        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !resp.status().is_success() {
            return Err(VenueError::from_status(resp.status(), "fetch midpoint"));
        }
        let mid: MidpointResponse = resp.json().await?;
        Ok(mid.mid)
    }

    /// Submit an order. The client order id rides along so a resubmission of
    /// the same mirror attempt is recognizable server-side.
    pub async fn post_order(&self, order: &OrderRequest) -> Result<OrderResult, VenueError> {
        let order_type = match order.order_type {
            OrderType::Gtc => "GTC",
            OrderType::Fok => "FOK",
        };
        let side = match order.side {
            Side::Buy => "BUY",
            Side::Sell => "SELL",
        };
        let payload = json!({
            "order": {
                "tokenID": order.token_id,
                "price": order.price,
                "size": order.size,
                "side": side,
                "negRisk": order.neg_risk,
                "clientOrderID": order.client_order_id,
            },
            "orderType": order_type,
        });
        let body = payload.to_string();

        let resp = self
            .authenticated(reqwest::Method::POST, "/order", &body)?
            .header("Content-Type", "application/json")
            .body(body.clone())
            .send()
            .await?;

        if !resp.status().is_success() {
            return Err(VenueError::from_status(resp.status(), "post order"));
        }
        let ack: ApiOrderResponse = resp.json().await?;

        if !ack.success {
            let msg = ack.error_msg.unwrap_or_else(|| "order rejected".into());
            return Err(VenueError::InvalidArgument(msg));
        }

        Ok(OrderResult {
            order_id: ack.order_id,
            status: ack.status.unwrap_or_else(|| "live".into()),
            success: true,
        })
    }

    /// Query open orders for the authenticated account.
    pub async fn get_open_orders(&self) -> Result<Vec<OpenOrder>, VenueError> {
        let resp = self
            .authenticated(reqwest::Method::GET, "/orders", "")?
            .send()
            .await?;

        if !resp.status().is_success() {
            return Err(VenueError::from_status(resp.status(), "fetch open orders"));
        }
        let orders: Vec<OpenOrder> = resp.json().await?;
        Ok(orders)
    }
}
