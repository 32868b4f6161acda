// User-data stream: listen key lifecycle plus event parsing.
// Emits ORDER_TRADE_UPDATE / ALGO_UPDATE / ACCOUNT_UPDATE /
// ACCOUNT_CONFIG_UPDATE as typed `UserEvent`s. The listen key is renewed
// every 30 minutes; expiry or any receive error tears the connection down and
// the loop reconnects with exponential backoff.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures_util::StreamExt;
use rust_decimal::Decimal;
use serde_json::Value;
use tokio::sync::mpsc::UnboundedSender;
use tokio::time::sleep;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{info, warn};

use super::{rest, Connection, StreamKind, UserEvent};
use crate::types::{
    AlgoOrderUpdate, LeverageUpdate, OrderSide, OrderStatus, OrderUpdate, PositionSide,
    PositionUpdate,
};

const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30 * 60);

/// Run the user-data stream until the task is aborted.
pub async fn run(
    conn: Arc<Connection>,
    events_tx: UnboundedSender<UserEvent>,
    reconnect_tx: UnboundedSender<StreamKind>,
) {
    let mut delay = Duration::from_millis(conn.reconnect.initial_delay_ms);
    let mut connected_before = false;

    loop {
        let listen_key = match rest::create_listen_key(&conn).await {
            Ok(key) => key,
            Err(err) => {
                warn!(error = %err, "CONNECTION: listen key creation failed");
                sleep(delay).await;
                delay = (delay * conn.reconnect.multiplier)
                    .min(Duration::from_millis(conn.reconnect.max_delay_ms));
                continue;
            }
        };

        let url = format!(
            "{}/ws/{}",
            conn.ws_base_url.trim_end_matches('/'),
            listen_key
        );

        // Keepalive runs beside the read loop and dies with it.
        let keepalive_conn = conn.clone();
        let keepalive = tokio::spawn(async move {
            loop {
                sleep(KEEPALIVE_INTERVAL).await;
                if let Err(err) = rest::keepalive_listen_key(&keepalive_conn).await {
                    warn!(error = %err, "CONNECTION: listen key keepalive failed");
                }
            }
        });

        match connect_async(&url).await {
            Ok((ws_stream, _)) => {
                info!("CONNECTION: user-data stream connected");
                delay = Duration::from_millis(conn.reconnect.initial_delay_ms);
                if connected_before {
                    let _ = reconnect_tx.send(StreamKind::UserData);
                }
                connected_before = true;

                let (_, mut read) = ws_stream.split();
                while let Some(message) = read.next().await {
                    match message {
                        Ok(Message::Text(txt)) => {
                            if Connection::check_message_size(txt.len(), "user-data").is_err() {
                                warn!("CONNECTION: oversized user-data message dropped");
                                continue;
                            }
                            match handle_user_message(&txt) {
                                UserMessage::Events(events) => {
                                    let mut dropped = false;
                                    for event in events {
                                        if events_tx.send(event).is_err() {
                                            dropped = true;
                                            break;
                                        }
                                    }
                                    if dropped {
                                        warn!("CONNECTION: user event receiver dropped");
                                        keepalive.abort();
                                        return;
                                    }
                                }
                                UserMessage::ListenKeyExpired => {
                                    warn!("CONNECTION: listen key expired, reconnecting");
                                    break;
                                }
                                UserMessage::Ignored => {}
                            }
                        }
                        Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {}
                        Ok(Message::Close(frame)) => {
                            warn!(frame = ?frame, "CONNECTION: user-data stream closed by peer");
                            break;
                        }
                        Ok(_) => {}
                        Err(err) => {
                            warn!(error = %err, "CONNECTION: user-data receive error");
                            break;
                        }
                    }
                }
            }
            Err(err) => warn!(error = %err, "CONNECTION: user-data connect error"),
        }

        keepalive.abort();
        info!(delay_ms = delay.as_millis() as u64, "CONNECTION: user-data reconnecting");
        sleep(delay).await;
        delay = (delay * conn.reconnect.multiplier)
            .min(Duration::from_millis(conn.reconnect.max_delay_ms));
    }
}

pub enum UserMessage {
    Events(Vec<UserEvent>),
    ListenKeyExpired,
    Ignored,
}

pub fn handle_user_message(text: &str) -> UserMessage {
    let value: Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(_) => return UserMessage::Ignored,
    };
    let event_type = value.get("e").and_then(|v| v.as_str()).unwrap_or("");
    match event_type {
        "listenKeyExpired" => UserMessage::ListenKeyExpired,
        "ORDER_TRADE_UPDATE" => match parse_order_update(&value) {
            Some(update) => UserMessage::Events(vec![UserEvent::Order(update)]),
            None => UserMessage::Ignored,
        },
        "ALGO_UPDATE" => match parse_algo_update(&value) {
            Some(update) => UserMessage::Events(vec![UserEvent::Algo(update)]),
            None => UserMessage::Ignored,
        },
        // One ACCOUNT_UPDATE can carry several positions (both sides at once).
        "ACCOUNT_UPDATE" => {
            let updates = parse_account_update(&value);
            if updates.is_empty() {
                UserMessage::Ignored
            } else {
                UserMessage::Events(updates.into_iter().map(UserEvent::Position).collect())
            }
        }
        "ACCOUNT_CONFIG_UPDATE" => match parse_account_config_update(&value) {
            Some(update) => UserMessage::Events(vec![UserEvent::Leverage(update)]),
            None => UserMessage::Ignored,
        },
        _ => UserMessage::Ignored,
    }
}

fn event_timestamp(value: &Value) -> i64 {
    for key in ["T", "E"] {
        if let Some(ts) = value.get(key).and_then(|v| v.as_i64()) {
            if ts > 0 {
                return ts;
            }
        }
    }
    Utc::now().timestamp_millis()
}

fn decimal_field(data: &Value, key: &str) -> Option<Decimal> {
    match data.get(key) {
        Some(Value::String(s)) => s.parse::<Decimal>().ok(),
        Some(Value::Number(n)) => n.to_string().parse::<Decimal>().ok(),
        _ => None,
    }
}

fn bool_field(data: &Value, key: &str) -> Option<bool> {
    data.get(key).and_then(|v| v.as_bool())
}

pub fn parse_order_update(value: &Value) -> Option<OrderUpdate> {
    let order = value.get("o")?;
    let symbol = order.get("s")?.as_str()?.to_string();
    let side = OrderSide::parse(order.get("S")?.as_str()?)?;
    let position_side = PositionSide::parse(order.get("ps")?.as_str()?)?;
    let status = OrderStatus::parse(order.get("X")?.as_str()?)?;

    Some(OrderUpdate {
        symbol,
        order_id: match order.get("i") {
            Some(Value::Number(n)) => n.to_string(),
            Some(Value::String(s)) => s.clone(),
            _ => String::new(),
        },
        client_order_id: order
            .get("c")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string(),
        side,
        position_side,
        status,
        filled_qty: decimal_field(order, "z").unwrap_or(Decimal::ZERO),
        avg_price: decimal_field(order, "ap").unwrap_or(Decimal::ZERO),
        ts_ms: event_timestamp(value),
        order_type: order.get("o").and_then(|v| v.as_str()).map(str::to_string),
        close_position: bool_field(order, "cp"),
        reduce_only: bool_field(order, "R"),
        is_maker: bool_field(order, "m"),
        realized_pnl: decimal_field(order, "rp"),
        fee: decimal_field(order, "n"),
    })
}

pub fn parse_algo_update(value: &Value) -> Option<AlgoOrderUpdate> {
    let order = value.get("o")?;
    let symbol = order.get("s")?.as_str()?.to_string();
    let side = OrderSide::parse(order.get("S").and_then(|v| v.as_str()).unwrap_or(""))
        .unwrap_or(OrderSide::Sell);

    Some(AlgoOrderUpdate {
        symbol,
        algo_id: match order.get("aid") {
            Some(Value::Number(n)) => n.to_string(),
            Some(Value::String(s)) => s.clone(),
            _ => String::new(),
        },
        client_algo_id: order
            .get("caid")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string(),
        side,
        status: order
            .get("X")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string(),
        ts_ms: event_timestamp(value),
        order_type: order.get("o").and_then(|v| v.as_str()).map(str::to_string),
        position_side: order
            .get("ps")
            .and_then(|v| v.as_str())
            .and_then(PositionSide::parse),
        close_position: bool_field(order, "cp"),
        reduce_only: bool_field(order, "R"),
    })
}

pub fn parse_account_update(value: &Value) -> Vec<PositionUpdate> {
    let ts_ms = event_timestamp(value);
    let Some(positions) = value
        .get("a")
        .and_then(|a| a.get("P"))
        .and_then(|p| p.as_array())
    else {
        return Vec::new();
    };

    let mut updates = Vec::new();
    for raw in positions {
        let Some(symbol) = raw.get("s").and_then(|v| v.as_str()) else {
            continue;
        };
        let Some(position_side) = raw
            .get("ps")
            .and_then(|v| v.as_str())
            .and_then(PositionSide::parse)
        else {
            // "BOTH" belongs to one-way mode; this executor runs hedge mode.
            continue;
        };
        let Some(position_amt) = decimal_field(raw, "pa") else {
            continue;
        };
        updates.push(PositionUpdate {
            symbol: symbol.to_string(),
            position_side,
            position_amt,
            entry_price: decimal_field(raw, "ep"),
            unrealized_pnl: decimal_field(raw, "up"),
            ts_ms,
        });
    }
    updates
}

pub fn parse_account_config_update(value: &Value) -> Option<LeverageUpdate> {
    let config = value.get("ac")?;
    let symbol = config.get("s")?.as_str()?.to_string();
    let leverage = config.get("l")?.as_u64()? as u32;
    if leverage == 0 {
        return None;
    }
    Some(LeverageUpdate {
        symbol,
        leverage,
        ts_ms: event_timestamp(value),
    })
}
