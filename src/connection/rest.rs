// Signed Binance USDT-M REST client.
// Venue-level rejections (post-only, duplicate id, precision, ...) come back
// as `OrderResult` data; only transport-level failures surface as `Err`.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use hmac::{Hmac, Mac};
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::Value;
use sha2::Sha256;
use tracing::{debug, info, warn};

use super::Connection;
use crate::rules::InstrumentRules;
use crate::types::{OrderIntent, OrderResult, OrderStatus, OrderType, Position, PositionSide};

type HmacSha256 = Hmac<Sha256>;

const ORDER_TIMEOUT: Duration = Duration::from_secs(3);
const VERIFY_TIMEOUT: Duration = Duration::from_secs(5);
const LISTEN_KEY_TIMEOUT: Duration = Duration::from_secs(5);

// ----------------------------------------------------------------------
// Signing
// ----------------------------------------------------------------------

fn sign_params(conn: &Connection, mut params: Vec<(String, String)>) -> Result<String> {
    let offset = conn
        .server_time_offset
        .try_read()
        .map(|guard| *guard)
        .unwrap_or(0);
    let timestamp = Utc::now().timestamp_millis() + offset;
    params.push(("timestamp".into(), timestamp.to_string()));
    if conn.recv_window_ms > 0 {
        params.push(("recvWindow".into(), conn.recv_window_ms.to_string()));
    }
    let query = serde_urlencoded::to_string(&params)?;
    let mut mac = HmacSha256::new_from_slice(conn.credentials.api_secret.as_bytes())
        .map_err(|err| anyhow!("failed to init signer: {err}"))?;
    mac.update(query.as_bytes());
    let signature = hex::encode(mac.finalize().into_bytes());
    Ok(format!("{query}&signature={signature}"))
}

async fn signed_get(
    conn: &Connection,
    path: &str,
    params: Vec<(String, String)>,
    timeout: Duration,
) -> Result<reqwest::Response> {
    let query = sign_params(conn, params)?;
    let url = format!("{}{}?{}", conn.base_url, path, query);
    let response = conn
        .http
        .get(&url)
        .header("X-MBX-APIKEY", &conn.credentials.api_key)
        .timeout(timeout)
        .send()
        .await?;
    Ok(response)
}

async fn signed_post(
    conn: &Connection,
    path: &str,
    params: Vec<(String, String)>,
    timeout: Duration,
) -> Result<reqwest::Response> {
    let body = sign_params(conn, params)?;
    let url = format!("{}{}", conn.base_url, path);
    let response = conn
        .http
        .post(&url)
        .header("X-MBX-APIKEY", &conn.credentials.api_key)
        .header("Content-Type", "application/x-www-form-urlencoded")
        .body(body)
        .timeout(timeout)
        .send()
        .await?;
    Ok(response)
}

async fn signed_delete(
    conn: &Connection,
    path: &str,
    params: Vec<(String, String)>,
    timeout: Duration,
) -> Result<reqwest::Response> {
    let query = sign_params(conn, params)?;
    let url = format!("{}{}?{}", conn.base_url, path, query);
    let response = conn
        .http
        .delete(&url)
        .header("X-MBX-APIKEY", &conn.credentials.api_key)
        .timeout(timeout)
        .send()
        .await?;
    Ok(response)
}

/// Pull `{code, msg}` out of a non-2xx body.
async fn venue_error(response: reqwest::Response) -> (Option<String>, String) {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    if let Ok(parsed) = serde_json::from_str::<Value>(&body) {
        let code = parsed
            .get("code")
            .and_then(|c| c.as_i64())
            .map(|c| c.to_string());
        let msg = parsed
            .get("msg")
            .and_then(|m| m.as_str())
            .unwrap_or(&body)
            .to_string();
        return (code, msg);
    }
    (None, format!("http {status}: {body}"))
}

fn format_decimal(value: Decimal) -> String {
    value.normalize().to_string()
}

// ----------------------------------------------------------------------
// Time sync
// ----------------------------------------------------------------------

pub async fn sync_server_time(conn: &Connection) -> Result<()> {
    #[derive(Debug, Deserialize)]
    struct ServerTimeResponse {
        #[serde(rename = "serverTime")]
        server_time: i64,
    }
    let url = format!("{}/fapi/v1/time", conn.base_url);
    let before = Utc::now().timestamp_millis();
    let resp = conn
        .http
        .get(&url)
        .timeout(VERIFY_TIMEOUT)
        .send()
        .await?
        .error_for_status()?
        .json::<ServerTimeResponse>()
        .await?;
    let after = Utc::now().timestamp_millis();
    let offset = resp.server_time - (before + after) / 2;
    *conn.server_time_offset.write().await = offset;
    info!(offset_ms = offset, "CONNECTION: server time synced");
    Ok(())
}

// ----------------------------------------------------------------------
// Instrument rules
// ----------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct ExchangeInfoResponse {
    symbols: Vec<ExchangeSymbol>,
}

#[derive(Debug, Deserialize)]
struct ExchangeSymbol {
    symbol: String,
    #[serde(default)]
    filters: Vec<Value>,
}

/// Instrument rules for the given symbols from exchangeInfo. Leverage is
/// filled in separately from positionRisk.
pub async fn fetch_instrument_rules(
    conn: &Connection,
    symbols: &[String],
) -> Result<HashMap<String, InstrumentRules>> {
    let url = format!("{}/fapi/v1/exchangeInfo", conn.base_url);
    let response = conn
        .http
        .get(&url)
        .timeout(VERIFY_TIMEOUT)
        .send()
        .await?
        .error_for_status()?
        .json::<ExchangeInfoResponse>()
        .await
        .context("failed to parse exchange info")?;

    let mut rules = HashMap::new();
    for info in response.symbols {
        if !symbols.contains(&info.symbol) {
            continue;
        }
        let mut tick_size = Decimal::new(1, 2);
        let mut step_size = Decimal::new(1, 3);
        let mut min_qty = Decimal::new(1, 3);
        let mut min_notional = Decimal::from(5);

        for filter in &info.filters {
            let filter_type = filter.get("filterType").and_then(|v| v.as_str());
            match filter_type {
                Some("PRICE_FILTER") => {
                    if let Some(ts) = decimal_field(filter, "tickSize") {
                        tick_size = ts;
                    }
                }
                Some("LOT_SIZE") => {
                    if let Some(ss) = decimal_field(filter, "stepSize") {
                        step_size = ss;
                    }
                    if let Some(mq) = decimal_field(filter, "minQty") {
                        min_qty = mq;
                    }
                }
                Some("MIN_NOTIONAL") => {
                    if let Some(mn) = decimal_field(filter, "notional") {
                        min_notional = mn;
                    }
                }
                _ => {}
            }
        }

        rules.insert(
            info.symbol.clone(),
            InstrumentRules {
                symbol: info.symbol,
                tick_size,
                step_size,
                min_qty,
                min_notional,
                leverage: 1,
            },
        );
    }

    for symbol in symbols {
        if !rules.contains_key(symbol) {
            warn!(symbol = %symbol, "CONNECTION: symbol missing from exchange info");
        }
    }
    Ok(rules)
}

fn decimal_field(value: &Value, key: &str) -> Option<Decimal> {
    value
        .get(key)
        .and_then(|v| v.as_str())
        .and_then(|s| s.parse::<Decimal>().ok())
}

// ----------------------------------------------------------------------
// Positions and leverage
// ----------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct PositionRiskEntry {
    symbol: String,
    #[serde(rename = "positionAmt")]
    position_amt: String,
    #[serde(rename = "entryPrice")]
    entry_price: String,
    #[serde(rename = "markPrice", default)]
    mark_price: String,
    #[serde(rename = "liquidationPrice", default)]
    liquidation_price: String,
    #[serde(rename = "unRealizedProfit", default)]
    unrealized_profit: String,
    #[serde(default)]
    leverage: String,
    #[serde(rename = "positionSide", default)]
    position_side: String,
}

fn parse_decimal(value: &str) -> Decimal {
    value.parse::<Decimal>().unwrap_or(Decimal::ZERO)
}

/// Hedge-mode positions with non-zero quantity.
pub async fn fetch_positions(conn: &Connection, symbol: Option<&str>) -> Result<Vec<Position>> {
    let mut params = Vec::new();
    if let Some(s) = symbol {
        params.push(("symbol".to_string(), s.to_string()));
    }
    let response = signed_get(conn, "/fapi/v2/positionRisk", params, VERIFY_TIMEOUT).await?;
    if !response.status().is_success() {
        let (code, msg) = venue_error(response).await;
        return Err(anyhow!("positionRisk failed: {code:?} {msg}"));
    }
    let entries = response
        .json::<Vec<PositionRiskEntry>>()
        .await
        .context("failed to parse positionRisk response")?;

    let mut positions = Vec::new();
    for entry in entries {
        let Some(position_side) = PositionSide::parse(&entry.position_side) else {
            continue;
        };
        let amt = parse_decimal(&entry.position_amt);
        if amt == Decimal::ZERO {
            continue;
        }
        let mark = parse_decimal(&entry.mark_price);
        let liq = parse_decimal(&entry.liquidation_price);
        positions.push(Position {
            symbol: entry.symbol,
            position_side,
            position_amt: amt,
            entry_price: parse_decimal(&entry.entry_price),
            unrealized_pnl: parse_decimal(&entry.unrealized_profit),
            leverage: entry.leverage.parse::<u32>().unwrap_or(1).max(1),
            mark_price: (mark > Decimal::ZERO).then_some(mark),
            liquidation_price: (liq > Decimal::ZERO).then_some(liq),
        });
    }
    Ok(positions)
}

/// symbol -> leverage, from positionRisk (covers both sides; they share
/// leverage per symbol).
pub async fn fetch_leverage_map(
    conn: &Connection,
    symbols: &[String],
) -> Result<HashMap<String, u32>> {
    let response = signed_get(conn, "/fapi/v2/positionRisk", Vec::new(), VERIFY_TIMEOUT).await?;
    if !response.status().is_success() {
        let (code, msg) = venue_error(response).await;
        return Err(anyhow!("positionRisk failed: {code:?} {msg}"));
    }
    let entries = response
        .json::<Vec<PositionRiskEntry>>()
        .await
        .context("failed to parse positionRisk response")?;

    let mut map = HashMap::new();
    for entry in entries {
        if !symbols.contains(&entry.symbol) {
            continue;
        }
        if let Ok(leverage) = entry.leverage.parse::<u32>() {
            if leverage > 0 {
                map.insert(entry.symbol, leverage);
            }
        }
    }
    Ok(map)
}

// ----------------------------------------------------------------------
// Open orders
// ----------------------------------------------------------------------

/// Raw open orders. Raw JSON because closePosition stop orders carry fields
/// (origQty=0, stopPrice, closePosition) a typed struct for plain limit
/// orders would drop.
pub async fn fetch_open_orders_raw(
    conn: &Connection,
    symbol: Option<&str>,
) -> Result<Vec<Value>> {
    let mut params = Vec::new();
    if let Some(s) = symbol {
        params.push(("symbol".to_string(), s.to_string()));
    }
    let response = signed_get(conn, "/fapi/v1/openOrders", params, VERIFY_TIMEOUT).await?;
    if !response.status().is_success() {
        let (code, msg) = venue_error(response).await;
        return Err(anyhow!("openOrders failed: {code:?} {msg}"));
    }
    let parsed = response
        .json::<Value>()
        .await
        .context("failed to parse openOrders response")?;
    match parsed {
        Value::Array(orders) => Ok(orders),
        other => Err(anyhow!("unexpected openOrders response shape: {other}")),
    }
}

/// Open algo (conditional) orders. The endpoint has returned both a bare
/// array and an object wrapping the array; handle both.
pub async fn fetch_open_algo_orders(
    conn: &Connection,
    symbol: Option<&str>,
) -> Result<Vec<Value>> {
    let mut params = Vec::new();
    if let Some(s) = symbol {
        params.push(("symbol".to_string(), s.to_string()));
    }
    let response = signed_get(conn, "/fapi/v1/openAlgoOrders", params, VERIFY_TIMEOUT).await?;
    if !response.status().is_success() {
        let (code, msg) = venue_error(response).await;
        warn!(code = ?code, msg = %msg, "CONNECTION: openAlgoOrders failed");
        return Ok(Vec::new());
    }
    let parsed = response
        .json::<Value>()
        .await
        .context("failed to parse openAlgoOrders response")?;
    Ok(unwrap_order_list(parsed))
}

/// Array or `{data: [...]}` / `{orders: [...]}` wrapped-object forms.
pub fn unwrap_order_list(value: Value) -> Vec<Value> {
    match value {
        Value::Array(orders) => orders,
        Value::Object(mut map) => {
            for key in ["data", "orders"] {
                if let Some(Value::Array(orders)) = map.remove(key) {
                    return orders;
                }
            }
            Vec::new()
        }
        _ => Vec::new(),
    }
}

// ----------------------------------------------------------------------
// Order placement / cancellation
// ----------------------------------------------------------------------

fn parse_order_response(value: &Value) -> OrderResult {
    let status = value
        .get("status")
        .and_then(|s| s.as_str())
        .and_then(OrderStatus::parse);
    let order_id = match value.get("orderId") {
        Some(Value::Number(n)) => Some(n.to_string()),
        Some(Value::String(s)) => Some(s.clone()),
        _ => value
            .get("algoId")
            .and_then(|v| v.as_str())
            .map(str::to_string),
    };
    OrderResult {
        success: true,
        order_id,
        client_order_id: value
            .get("clientOrderId")
            .or_else(|| value.get("clientAlgoId"))
            .and_then(|v| v.as_str())
            .map(str::to_string),
        status,
        filled_qty: value
            .get("executedQty")
            .and_then(|v| v.as_str())
            .and_then(|s| s.parse().ok())
            .unwrap_or(Decimal::ZERO),
        avg_price: value
            .get("avgPrice")
            .and_then(|v| v.as_str())
            .and_then(|s| s.parse().ok())
            .unwrap_or(Decimal::ZERO),
        error_code: None,
        error_message: None,
    }
}

/// Submit an order. The reduce-only flag rides on positionSide semantics in
/// hedge mode for plain limits; closePosition carries it for stops.
pub async fn place_order(conn: &Connection, intent: &OrderIntent) -> OrderResult {
    let mut params: Vec<(String, String)> = vec![
        ("symbol".into(), intent.symbol.clone()),
        ("side".into(), intent.side.as_str().to_string()),
        ("positionSide".into(), intent.position_side.as_str().to_string()),
        ("type".into(), intent.order_type.as_str().to_string()),
    ];

    match intent.order_type {
        OrderType::Limit => {
            params.push(("timeInForce".into(), intent.time_in_force.as_str().to_string()));
            params.push(("quantity".into(), format_decimal(intent.qty)));
            if let Some(price) = intent.price {
                params.push(("price".into(), format_decimal(price)));
            }
        }
        OrderType::StopMarket => {
            let Some(stop_price) = intent.stop_price else {
                return OrderResult::rejected(None, "STOP_MARKET requires stop_price");
            };
            params.push(("stopPrice".into(), format_decimal(stop_price)));
            params.push(("workingType".into(), "MARK_PRICE".into()));
            if intent.close_position {
                params.push(("closePosition".into(), "true".into()));
            } else {
                params.push(("quantity".into(), format_decimal(intent.qty)));
            }
        }
    }

    if let Some(cid) = &intent.client_order_id {
        params.push(("newClientOrderId".into(), cid.clone()));
    }

    let response = match signed_post(conn, "/fapi/v1/order", params, ORDER_TIMEOUT).await {
        Ok(r) => r,
        Err(e) => return OrderResult::rejected(None, format!("transport: {e}")),
    };

    if !response.status().is_success() {
        let (code, msg) = venue_error(response).await;
        debug!(
            symbol = %intent.symbol,
            side = %intent.side.as_str(),
            code = ?code,
            msg = %msg,
            "CONNECTION: order rejected by venue"
        );
        return OrderResult::rejected(code, msg);
    }

    match response.json::<Value>().await {
        Ok(value) => parse_order_response(&value),
        Err(e) => OrderResult::rejected(None, format!("parse: {e}")),
    }
}

pub async fn cancel_order(conn: &Connection, symbol: &str, order_id: &str) -> OrderResult {
    let params = vec![
        ("symbol".to_string(), symbol.to_string()),
        ("orderId".to_string(), order_id.to_string()),
    ];
    let response = match signed_delete(conn, "/fapi/v1/order", params, ORDER_TIMEOUT).await {
        Ok(r) => r,
        Err(e) => return OrderResult::rejected(None, format!("transport: {e}")),
    };
    if !response.status().is_success() {
        let (code, msg) = venue_error(response).await;
        return OrderResult::rejected(code, msg);
    }
    match response.json::<Value>().await {
        Ok(value) => {
            let mut result = parse_order_response(&value);
            if result.status.is_none() {
                result.status = Some(OrderStatus::Canceled);
            }
            result
        }
        Err(e) => OrderResult::rejected(None, format!("parse: {e}")),
    }
}

pub async fn cancel_algo_order(conn: &Connection, symbol: &str, algo_id: &str) -> OrderResult {
    let params = vec![
        ("symbol".to_string(), symbol.to_string()),
        ("algoId".to_string(), algo_id.to_string()),
    ];
    let response = match signed_delete(conn, "/fapi/v1/algoOrder", params, ORDER_TIMEOUT).await {
        Ok(r) => r,
        Err(e) => return OrderResult::rejected(None, format!("transport: {e}")),
    };
    if !response.status().is_success() {
        let (code, msg) = venue_error(response).await;
        return OrderResult::rejected(code, msg);
    }
    OrderResult {
        success: true,
        order_id: Some(algo_id.to_string()),
        status: Some(OrderStatus::Canceled),
        ..OrderResult::default()
    }
}

/// Cancel by id without knowing whether the order lives on the plain or the
/// algo book: try the normal endpoint first, fall back to algo.
pub async fn cancel_any(conn: &Connection, symbol: &str, order_id: &str) -> OrderResult {
    let result = cancel_order(conn, symbol, order_id).await;
    if result.success {
        return result;
    }
    cancel_algo_order(conn, symbol, order_id).await
}

// ----------------------------------------------------------------------
// Trade metadata (late-fill fallback)
// ----------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct UserTrade {
    #[serde(default)]
    maker: bool,
    #[serde(rename = "realizedPnl", default)]
    realized_pnl: String,
    #[serde(default)]
    commission: String,
    #[serde(rename = "commissionAsset", default)]
    commission_asset: String,
}

/// Maker role / realized PnL / fee for a completed order, summed over its
/// trades. Used when the websocket execution report never arrived.
pub async fn fetch_order_trade_meta(
    conn: &Connection,
    symbol: &str,
    order_id: &str,
) -> Result<(Option<bool>, Option<Decimal>, Option<Decimal>, Option<String>)> {
    let params = vec![
        ("symbol".to_string(), symbol.to_string()),
        ("orderId".to_string(), order_id.to_string()),
    ];
    let response = signed_get(conn, "/fapi/v1/userTrades", params, VERIFY_TIMEOUT).await?;
    if !response.status().is_success() {
        let (code, msg) = venue_error(response).await;
        return Err(anyhow!("userTrades failed: {code:?} {msg}"));
    }
    let trades = response
        .json::<Vec<UserTrade>>()
        .await
        .context("failed to parse userTrades response")?;
    if trades.is_empty() {
        return Ok((None, None, None, None));
    }

    let is_maker = trades.first().map(|t| t.maker);
    let mut pnl = Decimal::ZERO;
    let mut fee = Decimal::ZERO;
    let mut fee_asset = None;
    for trade in &trades {
        pnl += parse_decimal(&trade.realized_pnl);
        fee += parse_decimal(&trade.commission);
        if fee_asset.is_none() && !trade.commission_asset.is_empty() {
            fee_asset = Some(trade.commission_asset.clone());
        }
    }
    Ok((is_maker, Some(pnl), Some(fee), fee_asset))
}

// ----------------------------------------------------------------------
// Listen key
// ----------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct ListenKeyResponse {
    #[serde(rename = "listenKey")]
    listen_key: String,
}

pub async fn create_listen_key(conn: &Connection) -> Result<String> {
    let url = format!("{}/fapi/v1/listenKey", conn.base_url);
    let resp = conn
        .http
        .post(&url)
        .header("X-MBX-APIKEY", &conn.credentials.api_key)
        .timeout(LISTEN_KEY_TIMEOUT)
        .send()
        .await?
        .error_for_status()?
        .json::<ListenKeyResponse>()
        .await
        .context("failed to parse listenKey response")?;
    Ok(resp.listen_key)
}

pub async fn keepalive_listen_key(conn: &Connection) -> Result<()> {
    let url = format!("{}/fapi/v1/listenKey", conn.base_url);
    conn.http
        .put(&url)
        .header("X-MBX-APIKEY", &conn.credentials.api_key)
        .timeout(LISTEN_KEY_TIMEOUT)
        .send()
        .await?
        .error_for_status()?;
    Ok(())
}

pub async fn close_listen_key(conn: &Connection) -> Result<()> {
    let url = format!("{}/fapi/v1/listenKey", conn.base_url);
    conn.http
        .delete(&url)
        .header("X-MBX-APIKEY", &conn.credentials.api_key)
        .timeout(LISTEN_KEY_TIMEOUT)
        .send()
        .await?
        .error_for_status()?;
    Ok(())
}
