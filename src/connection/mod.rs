// Connection facade: signed REST client plus the two websocket loops.
// The orchestrator talks to the venue exclusively through this module.

pub mod market_ws;
pub mod rest;
pub mod user_ws;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;
use tokio::sync::RwLock;

use crate::config::{Credentials, ReconnectConfig};
use crate::protective_stop::OrderGateway;
use crate::types::{
    AlgoOrderUpdate, LeverageUpdate, OrderIntent, OrderResult, OrderUpdate, PositionUpdate,
};

const MAINNET_REST: &str = "https://fapi.binance.com";
const MAINNET_WS: &str = "wss://fstream.binance.com";
const TESTNET_REST: &str = "https://testnet.binancefuture.com";
const TESTNET_WS: &str = "wss://stream.binancefuture.com";

const MAX_WS_MESSAGE_SIZE: usize = 1024 * 1024;

/// Which stream fired a lifecycle event.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamKind {
    MarketData,
    UserData,
}

impl StreamKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamKind::MarketData => "market_data",
            StreamKind::UserData => "user_data",
        }
    }
}

/// User-data stream events, already parsed.
#[derive(Clone, Debug)]
pub enum UserEvent {
    Order(OrderUpdate),
    Algo(AlgoOrderUpdate),
    Position(PositionUpdate),
    Leverage(LeverageUpdate),
}

pub struct Connection {
    pub(crate) http: Client,
    pub(crate) credentials: Credentials,
    pub(crate) base_url: String,
    pub(crate) ws_base_url: String,
    pub(crate) recv_window_ms: u64,
    pub(crate) reconnect: ReconnectConfig,
    pub(crate) server_time_offset: RwLock<i64>,
}

impl Connection {
    pub fn new(credentials: Credentials, testnet: bool, reconnect: ReconnectConfig) -> Result<Self> {
        let http = Client::builder()
            .user_agent("unwind-bot/0.3")
            .timeout(Duration::from_secs(10))
            .build()?;
        let (base_url, ws_base_url) = if testnet {
            (TESTNET_REST, TESTNET_WS)
        } else {
            (MAINNET_REST, MAINNET_WS)
        };
        Ok(Self {
            http,
            credentials,
            base_url: base_url.to_string(),
            ws_base_url: ws_base_url.to_string(),
            recv_window_ms: 5_000,
            reconnect,
            server_time_offset: RwLock::new(0),
        })
    }

    pub(crate) fn check_message_size(size: usize, stream_name: &str) -> Result<()> {
        if size > MAX_WS_MESSAGE_SIZE {
            anyhow::bail!(
                "websocket message too large: {size} bytes (max {MAX_WS_MESSAGE_SIZE}) on {stream_name} stream"
            );
        }
        Ok(())
    }
}

#[async_trait]
impl OrderGateway for Arc<Connection> {
    async fn fetch_open_orders_raw(&self, symbol: &str) -> Result<Vec<Value>> {
        rest::fetch_open_orders_raw(self, Some(symbol)).await
    }

    async fn fetch_open_algo_orders(&self, symbol: &str) -> Result<Vec<Value>> {
        rest::fetch_open_algo_orders(self, Some(symbol)).await
    }

    async fn place_order(&self, intent: &OrderIntent) -> Result<OrderResult> {
        Ok(rest::place_order(self, intent).await)
    }

    async fn cancel_any(&self, symbol: &str, order_id: &str) -> Result<OrderResult> {
        Ok(rest::cancel_any(self, symbol, order_id).await)
    }
}
