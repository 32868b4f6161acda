// Market-data stream: combined bookTicker / aggTrade / markPrice@1s.
// Parses each message into a `MarketEvent` and forwards it to the
// orchestrator; reconnects forever with exponential backoff and reports each
// successful reconnect so the orchestrator can recalibrate.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures_util::StreamExt;
use rust_decimal::Decimal;
use serde_json::Value;
use tokio::sync::mpsc::UnboundedSender;
use tokio::time::sleep;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use super::{Connection, StreamKind};
use crate::types::{MarketEvent, MarketEventKind};

pub fn combined_stream_url(conn: &Connection, symbols: &[String]) -> String {
    let mut streams = Vec::with_capacity(symbols.len() * 3);
    for symbol in symbols {
        let s = symbol.to_lowercase();
        streams.push(format!("{s}@bookTicker"));
        streams.push(format!("{s}@aggTrade"));
        streams.push(format!("{s}@markPrice@1s"));
    }
    format!(
        "{}/stream?streams={}",
        conn.ws_base_url.trim_end_matches('/'),
        streams.join("/")
    )
}

/// Run the market stream until the task is aborted.
pub async fn run(
    conn: Arc<Connection>,
    symbols: Vec<String>,
    events_tx: UnboundedSender<MarketEvent>,
    reconnect_tx: UnboundedSender<StreamKind>,
) {
    let mut delay = Duration::from_millis(conn.reconnect.initial_delay_ms);
    let mut connected_before = false;

    loop {
        let url = combined_stream_url(&conn, &symbols);
        match connect_async(&url).await {
            Ok((ws_stream, _)) => {
                info!("CONNECTION: market stream connected");
                delay = Duration::from_millis(conn.reconnect.initial_delay_ms);
                if connected_before {
                    let _ = reconnect_tx.send(StreamKind::MarketData);
                }
                connected_before = true;

                let (_, mut read) = ws_stream.split();
                while let Some(message) = read.next().await {
                    match message {
                        Ok(Message::Text(txt)) => {
                            if Connection::check_message_size(txt.len(), "market").is_err() {
                                warn!("CONNECTION: oversized market message dropped");
                                continue;
                            }
                            if let Some(event) = parse_market_message(&txt) {
                                if events_tx.send(event).is_err() {
                                    warn!("CONNECTION: market event receiver dropped");
                                    return;
                                }
                            }
                        }
                        Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {}
                        Ok(Message::Close(frame)) => {
                            warn!(frame = ?frame, "CONNECTION: market stream closed by peer");
                            break;
                        }
                        Ok(_) => {}
                        Err(err) => {
                            warn!(error = %err, "CONNECTION: market stream receive error");
                            break;
                        }
                    }
                }
            }
            Err(err) => warn!(error = %err, "CONNECTION: market stream connect error"),
        }

        info!(delay_ms = delay.as_millis() as u64, "CONNECTION: market stream reconnecting");
        sleep(delay).await;
        delay = (delay * conn.reconnect.multiplier)
            .min(Duration::from_millis(conn.reconnect.max_delay_ms));
    }
}

/// Combined-stream envelope: `{"stream": "...", "data": {...}}`.
pub fn parse_market_message(text: &str) -> Option<MarketEvent> {
    let value: Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(err) => {
            debug!(error = %err, "CONNECTION: undecodable market message");
            return None;
        }
    };
    let stream = value.get("stream")?.as_str()?;
    let data = value.get("data")?;

    if stream.contains("@bookTicker") {
        parse_book_ticker(data)
    } else if stream.contains("@aggTrade") {
        parse_agg_trade(data)
    } else if stream.contains("@markPrice") {
        parse_mark_price(data)
    } else {
        None
    }
}

fn decimal_str(data: &Value, key: &str) -> Option<Decimal> {
    data.get(key)?.as_str()?.parse::<Decimal>().ok()
}

fn event_timestamp(data: &Value) -> i64 {
    for key in ["T", "E"] {
        if let Some(ts) = data.get(key).and_then(|v| v.as_i64()) {
            if ts > 0 {
                return ts;
            }
        }
    }
    Utc::now().timestamp_millis()
}

fn parse_book_ticker(data: &Value) -> Option<MarketEvent> {
    let symbol = data.get("s")?.as_str()?.to_string();
    let best_bid = decimal_str(data, "b")?;
    let best_ask = decimal_str(data, "a")?;
    Some(MarketEvent {
        symbol,
        ts_ms: event_timestamp(data),
        kind: MarketEventKind::BookTicker { best_bid, best_ask },
    })
}

fn parse_agg_trade(data: &Value) -> Option<MarketEvent> {
    let symbol = data.get("s")?.as_str()?.to_string();
    let price = decimal_str(data, "p")?;
    Some(MarketEvent {
        symbol,
        ts_ms: event_timestamp(data),
        kind: MarketEventKind::AggTrade { price },
    })
}

fn parse_mark_price(data: &Value) -> Option<MarketEvent> {
    let symbol = data.get("s")?.as_str()?.to_string();
    let price = decimal_str(data, "p")?;
    if price <= Decimal::ZERO {
        return None;
    }
    Some(MarketEvent {
        symbol,
        ts_ms: event_timestamp(data),
        kind: MarketEventKind::MarkPrice { price },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn book_ticker_parses() {
        let msg = r#"{"stream":"btcusdt@bookTicker","data":{"e":"bookTicker","s":"BTCUSDT","b":"199.98","B":"31.2","a":"200.00","A":"40.6","T":1591097736594,"E":1591097736593}}"#;
        let event = parse_market_message(msg).expect("event");
        assert_eq!(event.symbol, "BTCUSDT");
        assert_eq!(event.ts_ms, 1591097736594);
        match event.kind {
            MarketEventKind::BookTicker { best_bid, best_ask } => {
                assert_eq!(best_bid, dec!(199.98));
                assert_eq!(best_ask, dec!(200.00));
            }
            other => panic!("unexpected kind: {other:?}"),
        }
    }

    #[test]
    fn agg_trade_parses() {
        let msg = r#"{"stream":"btcusdt@aggTrade","data":{"e":"aggTrade","E":1591097736593,"s":"BTCUSDT","p":"200.01","q":"0.001","T":1591097736594,"m":true}}"#;
        let event = parse_market_message(msg).expect("event");
        match event.kind {
            MarketEventKind::AggTrade { price } => assert_eq!(price, dec!(200.01)),
            other => panic!("unexpected kind: {other:?}"),
        }
    }

    #[test]
    fn mark_price_parses_and_rejects_zero() {
        let msg = r#"{"stream":"btcusdt@markPrice@1s","data":{"e":"markPriceUpdate","E":1562305380000,"s":"BTCUSDT","p":"11185.87786614","r":"0.0001","T":1562306400000}}"#;
        let event = parse_market_message(msg).expect("event");
        assert!(matches!(event.kind, MarketEventKind::MarkPrice { .. }));

        let zero = r#"{"stream":"btcusdt@markPrice@1s","data":{"e":"markPriceUpdate","E":1,"s":"BTCUSDT","p":"0"}}"#;
        assert!(parse_market_message(zero).is_none());
    }

    #[test]
    fn unknown_stream_is_ignored() {
        let msg = r#"{"stream":"btcusdt@depth20","data":{"s":"BTCUSDT"}}"#;
        assert!(parse_market_message(msg).is_none());
    }
}
