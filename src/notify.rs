// Telegram notifier. Strictly fire-and-forget: every send runs in its own
// task, retries a few times, and failures end in a log line — never in the
// execution path.

use std::sync::Arc;
use std::time::Duration;

use reqwest::Client;
use serde_json::json;
use tokio::time::sleep;
use tracing::{debug, warn};

const MAX_RETRIES: u32 = 3;
const SEND_TIMEOUT: Duration = Duration::from_secs(10);

pub struct Notifier {
    http: Client,
    token: String,
    chat_id: String,
    pub enabled: bool,
}

impl Notifier {
    /// Reads `UNWIND_TG_TOKEN` / `UNWIND_TG_CHAT_ID` from the environment.
    /// Disabled (silently inert) when `enabled` is false; missing credentials
    /// with `enabled` set are a startup error, handled by the caller.
    pub fn from_env(enabled: bool) -> anyhow::Result<Self> {
        let token = std::env::var("UNWIND_TG_TOKEN").unwrap_or_default();
        let chat_id = std::env::var("UNWIND_TG_CHAT_ID").unwrap_or_default();
        if enabled && (token.is_empty() || chat_id.is_empty()) {
            anyhow::bail!(
                "telegram.enabled is set but UNWIND_TG_TOKEN / UNWIND_TG_CHAT_ID are missing"
            );
        }
        Ok(Self {
            http: Client::builder().timeout(SEND_TIMEOUT).build()?,
            token,
            chat_id,
            enabled,
        })
    }

    /// Spawn a send task; the caller never waits on it.
    pub fn send(self: &Arc<Self>, text: String) {
        if !self.enabled {
            return;
        }
        let this = self.clone();
        tokio::spawn(async move {
            this.send_with_retries(&text).await;
        });
    }

    async fn send_with_retries(&self, text: &str) {
        let url = format!("https://api.telegram.org/bot{}/sendMessage", self.token);
        let body = json!({
            "chat_id": self.chat_id,
            "text": text,
            "disable_web_page_preview": true,
        });

        for attempt in 0..MAX_RETRIES {
            let result = self.http.post(&url).json(&body).send().await;
            match result {
                Ok(resp) if resp.status().is_success() => {
                    debug!("NOTIFY: telegram message sent");
                    return;
                }
                Ok(resp) => {
                    warn!(status = %resp.status(), attempt, "NOTIFY: telegram send rejected");
                }
                Err(err) => {
                    warn!(error = %err, attempt, "NOTIFY: telegram send failed");
                }
            }
            sleep(Duration::from_millis(500 * 2u64.pow(attempt))).await;
        }
        warn!("NOTIFY: telegram message dropped after retries");
    }

    pub fn notify_fill(
        self: &Arc<Self>,
        symbol: &str,
        side: &str,
        mode: &str,
        qty: &str,
        avg_price: &str,
        reason: &str,
    ) {
        self.send(format!(
            "fill {symbol} {side} {qty} @ {avg_price} ({mode}, {reason})"
        ));
    }

    pub fn notify_reconnect(self: &Arc<Self>, stream: &str) {
        self.send(format!("stream reconnected: {stream}"));
    }

    pub fn notify_risk_trigger(self: &Arc<Self>, symbol: &str, side: &str, dist: &str) {
        self.send(format!("risk trigger {symbol} {side} dist_to_liq={dist}"));
    }

    pub fn notify_position_increase(
        self: &Arc<Self>,
        symbol: &str,
        side: &str,
        before: &str,
        after: &str,
    ) {
        self.send(format!(
            "position increased {symbol} {side}: {before} -> {after} (this executor only reduces)"
        ));
    }
}
