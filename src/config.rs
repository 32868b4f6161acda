// Configuration structures and loading.
// YAML file with a `global` section plus optional per-symbol overrides; the
// merge happens once at startup into `SymbolSettings`. API credentials come
// from the environment, never from the file.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use rust_decimal::Decimal;
use serde::Deserialize;

// ============================================================================
// Global configuration
// ============================================================================

#[derive(Debug, Deserialize, Clone, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub global: GlobalConfig,
    /// Symbol -> overrides. Presence of the key enables the symbol.
    #[serde(default)]
    pub symbols: HashMap<String, SymbolOverrides>,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct GlobalConfig {
    #[serde(default)]
    pub testnet: bool,
    #[serde(default)]
    pub ws: WsConfig,
    #[serde(default)]
    pub execution: ExecutionConfig,
    #[serde(default)]
    pub accel: AccelConfig,
    #[serde(default)]
    pub roi: RoiConfig,
    #[serde(default)]
    pub risk: RiskConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub telegram: TelegramConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct WsConfig {
    #[serde(default = "default_stale_data_ms")]
    pub stale_data_ms: i64,
    #[serde(default)]
    pub reconnect: ReconnectConfig,
}

impl Default for WsConfig {
    fn default() -> Self {
        Self {
            stale_data_ms: default_stale_data_ms(),
            reconnect: ReconnectConfig::default(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ReconnectConfig {
    #[serde(default = "default_reconnect_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_reconnect_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_reconnect_multiplier")]
    pub multiplier: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: default_reconnect_initial_delay_ms(),
            max_delay_ms: default_reconnect_max_delay_ms(),
            multiplier: default_reconnect_multiplier(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ExecutionConfig {
    #[serde(default = "default_order_ttl_ms")]
    pub order_ttl_ms: i64,
    #[serde(default = "default_repost_cooldown_ms")]
    pub repost_cooldown_ms: i64,
    #[serde(default = "default_min_signal_interval_ms")]
    pub min_signal_interval_ms: i64,
    #[serde(default = "default_base_lot_mult")]
    pub base_lot_mult: u32,
    /// at_touch | inside_spread_1tick | custom_ticks
    #[serde(default = "default_maker_price_mode")]
    pub maker_price_mode: MakerPriceMode,
    #[serde(default = "default_maker_n_ticks")]
    pub maker_n_ticks: u32,
    /// Post-only distance from the same-side touch, >= 1.
    #[serde(default = "default_maker_safety_ticks")]
    pub maker_safety_ticks: u32,
    #[serde(default = "default_max_mult")]
    pub max_mult: u32,
    #[serde(default = "default_max_order_notional")]
    pub max_order_notional: Decimal,
    #[serde(default = "default_maker_timeouts_to_escalate")]
    pub maker_timeouts_to_escalate: u32,
    #[serde(default = "default_aggr_fills_to_deescalate")]
    pub aggr_fills_to_deescalate: u32,
    #[serde(default = "default_aggr_timeouts_to_deescalate")]
    pub aggr_timeouts_to_deescalate: u32,
    /// How long a REST-acknowledged fill waits for its websocket execution report.
    #[serde(default = "default_ws_fill_grace_ms")]
    pub ws_fill_grace_ms: i64,
    #[serde(default)]
    pub fill_rate_feedback: FillRateFeedbackConfig,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        serde_yaml::from_str("{}").expect("default execution config")
    }
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MakerPriceMode {
    AtTouch,
    InsideSpread1tick,
    CustomTicks,
}

#[derive(Debug, Deserialize, Clone)]
pub struct FillRateFeedbackConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_fill_rate_window_ms")]
    pub window_ms: i64,
}

impl Default for FillRateFeedbackConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            window_ms: default_fill_rate_window_ms(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct AccelConfig {
    #[serde(default = "default_accel_window_ms")]
    pub window_ms: i64,
    #[serde(default)]
    pub tiers: Vec<AccelTier>,
}

impl Default for AccelConfig {
    fn default() -> Self {
        Self {
            window_ms: default_accel_window_ms(),
            tiers: Vec::new(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct AccelTier {
    pub ret: Decimal,
    pub mult: u32,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct RoiConfig {
    #[serde(default)]
    pub tiers: Vec<RoiTier>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RoiTier {
    pub roi: Decimal,
    pub mult: u32,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RiskConfig {
    #[serde(default = "default_liq_distance_threshold")]
    pub liq_distance_threshold: Decimal,
    /// Relative release margin for the soft de-risk flag: the flag clears
    /// only once d > threshold * (1 + hysteresis).
    #[serde(default = "default_liq_distance_hysteresis")]
    pub liq_distance_hysteresis: Decimal,
    #[serde(default)]
    pub panic_close: PanicCloseConfig,
    #[serde(default)]
    pub protective_stop: ProtectiveStopConfig,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            liq_distance_threshold: default_liq_distance_threshold(),
            liq_distance_hysteresis: default_liq_distance_hysteresis(),
            panic_close: PanicCloseConfig::default(),
            protective_stop: ProtectiveStopConfig::default(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct PanicCloseConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Panic TTL = execution.order_ttl_ms * ttl_percent.
    #[serde(default = "default_panic_ttl_percent")]
    pub ttl_percent: Decimal,
    #[serde(default)]
    pub tiers: Vec<PanicCloseTier>,
}

impl Default for PanicCloseConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            ttl_percent: default_panic_ttl_percent(),
            tiers: Vec::new(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct PanicCloseTier {
    /// Tier fires while d <= dist_to_liq.
    pub dist_to_liq: Decimal,
    /// Fraction of the position per slice, (0, 1].
    pub slice_ratio: Decimal,
    #[serde(default = "default_maker_timeouts_to_escalate")]
    pub maker_timeouts_to_escalate: u32,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ProtectiveStopConfig {
    #[serde(default = "default_protective_stop_enabled")]
    pub enabled: bool,
    /// Target dist_to_liq at trigger: stop price is derived from the
    /// advertised liquidation price so the stop fires at roughly this distance.
    #[serde(default = "default_protective_stop_dist")]
    pub dist_to_liq: Decimal,
    #[serde(default)]
    pub external_takeover: ExternalTakeoverConfig,
}

impl Default for ProtectiveStopConfig {
    fn default() -> Self {
        Self {
            enabled: default_protective_stop_enabled(),
            dist_to_liq: default_protective_stop_dist(),
            external_takeover: ExternalTakeoverConfig::default(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ExternalTakeoverConfig {
    #[serde(default = "default_external_takeover_enabled")]
    pub enabled: bool,
    /// REST verification cadence while the latch is held.
    #[serde(default = "default_rest_verify_interval_s")]
    pub rest_verify_interval_s: u64,
    /// Latch age past which verification is forced even without WS traffic.
    #[serde(default = "default_takeover_max_hold_s")]
    pub max_hold_s: u64,
}

impl Default for ExternalTakeoverConfig {
    fn default() -> Self {
        Self {
            enabled: default_external_takeover_enabled(),
            rest_verify_interval_s: default_rest_verify_interval_s(),
            max_hold_s: default_takeover_max_hold_s(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RateLimitConfig {
    #[serde(default = "default_max_orders_per_sec")]
    pub max_orders_per_sec: u32,
    #[serde(default = "default_max_cancels_per_sec")]
    pub max_cancels_per_sec: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_orders_per_sec: default_max_orders_per_sec(),
            max_cancels_per_sec: default_max_cancels_per_sec(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct TelegramConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub events: TelegramEventsConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct TelegramEventsConfig {
    #[serde(default = "default_true")]
    pub on_fill: bool,
    #[serde(default = "default_true")]
    pub on_reconnect: bool,
    #[serde(default = "default_true")]
    pub on_risk_trigger: bool,
    #[serde(default = "default_true")]
    pub on_open_alert: bool,
}

impl Default for TelegramEventsConfig {
    fn default() -> Self {
        Self {
            on_fill: true,
            on_reconnect: true,
            on_risk_trigger: true,
            on_open_alert: true,
        }
    }
}

// ============================================================================
// Per-symbol overrides
// ============================================================================

#[derive(Debug, Deserialize, Clone, Default)]
pub struct SymbolOverrides {
    #[serde(default)]
    pub execution: Option<ExecutionOverrides>,
    #[serde(default)]
    pub accel: Option<AccelOverrides>,
    #[serde(default)]
    pub roi: Option<RoiConfig>,
    #[serde(default)]
    pub risk: Option<RiskOverrides>,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct ExecutionOverrides {
    pub order_ttl_ms: Option<i64>,
    pub repost_cooldown_ms: Option<i64>,
    pub min_signal_interval_ms: Option<i64>,
    pub base_lot_mult: Option<u32>,
    pub maker_price_mode: Option<MakerPriceMode>,
    pub maker_n_ticks: Option<u32>,
    pub maker_safety_ticks: Option<u32>,
    pub max_mult: Option<u32>,
    pub max_order_notional: Option<Decimal>,
    pub maker_timeouts_to_escalate: Option<u32>,
    pub aggr_fills_to_deescalate: Option<u32>,
    pub aggr_timeouts_to_deescalate: Option<u32>,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct AccelOverrides {
    pub window_ms: Option<i64>,
    pub tiers: Option<Vec<AccelTier>>,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct RiskOverrides {
    pub liq_distance_threshold: Option<Decimal>,
    pub liq_distance_hysteresis: Option<Decimal>,
    pub panic_close: Option<PanicCloseOverrides>,
    pub protective_stop: Option<ProtectiveStopOverrides>,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct PanicCloseOverrides {
    pub enabled: Option<bool>,
    pub ttl_percent: Option<Decimal>,
    pub tiers: Option<Vec<PanicCloseTier>>,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct ProtectiveStopOverrides {
    pub enabled: Option<bool>,
    pub dist_to_liq: Option<Decimal>,
}

// ============================================================================
// Merged per-symbol settings (resolved once at startup)
// ============================================================================

/// Global defaults + symbol overrides, resolved field-wise. Modules only ever
/// see this struct.
#[derive(Debug, Clone)]
pub struct SymbolSettings {
    pub symbol: String,

    pub order_ttl_ms: i64,
    pub repost_cooldown_ms: i64,
    pub min_signal_interval_ms: i64,
    pub base_lot_mult: u32,
    pub maker_price_mode: MakerPriceMode,
    pub maker_n_ticks: u32,
    pub maker_safety_ticks: u32,
    pub max_mult: u32,
    pub max_order_notional: Decimal,
    pub maker_timeouts_to_escalate: u32,
    pub aggr_fills_to_deescalate: u32,
    pub aggr_timeouts_to_deescalate: u32,
    pub ws_fill_grace_ms: i64,
    pub fill_rate_feedback_enabled: bool,
    pub fill_rate_window_ms: i64,

    pub accel_window_ms: i64,
    pub accel_tiers: Vec<AccelTier>,
    pub roi_tiers: Vec<RoiTier>,

    pub liq_distance_threshold: Decimal,
    pub liq_distance_hysteresis: Decimal,
    pub panic_close_enabled: bool,
    pub panic_close_ttl_percent: Decimal,
    pub panic_close_tiers: Vec<PanicCloseTier>,
    pub protective_stop_enabled: bool,
    pub protective_stop_dist_to_liq: Decimal,
    pub external_takeover_enabled: bool,
    pub external_takeover_rest_verify_interval_s: u64,
    pub external_takeover_max_hold_s: u64,
}

impl AppConfig {
    pub fn symbols(&self) -> Vec<String> {
        let mut v: Vec<String> = self.symbols.keys().cloned().collect();
        v.sort();
        v
    }

    /// Resolve the merged settings for one symbol.
    pub fn symbol_settings(&self, symbol: &str) -> SymbolSettings {
        let g = &self.global;
        let o = self.symbols.get(symbol).cloned().unwrap_or_default();
        let exec = o.execution.unwrap_or_default();
        let accel = o.accel.unwrap_or_default();
        let risk = o.risk.unwrap_or_default();
        let panic = risk.panic_close.clone().unwrap_or_default();
        let stop = risk.protective_stop.clone().unwrap_or_default();

        SymbolSettings {
            symbol: symbol.to_string(),
            order_ttl_ms: exec.order_ttl_ms.unwrap_or(g.execution.order_ttl_ms),
            repost_cooldown_ms: exec
                .repost_cooldown_ms
                .unwrap_or(g.execution.repost_cooldown_ms),
            min_signal_interval_ms: exec
                .min_signal_interval_ms
                .unwrap_or(g.execution.min_signal_interval_ms),
            base_lot_mult: exec.base_lot_mult.unwrap_or(g.execution.base_lot_mult),
            maker_price_mode: exec
                .maker_price_mode
                .unwrap_or(g.execution.maker_price_mode),
            maker_n_ticks: exec.maker_n_ticks.unwrap_or(g.execution.maker_n_ticks),
            maker_safety_ticks: exec
                .maker_safety_ticks
                .unwrap_or(g.execution.maker_safety_ticks),
            max_mult: exec.max_mult.unwrap_or(g.execution.max_mult),
            max_order_notional: exec
                .max_order_notional
                .unwrap_or(g.execution.max_order_notional),
            maker_timeouts_to_escalate: exec
                .maker_timeouts_to_escalate
                .unwrap_or(g.execution.maker_timeouts_to_escalate),
            aggr_fills_to_deescalate: exec
                .aggr_fills_to_deescalate
                .unwrap_or(g.execution.aggr_fills_to_deescalate),
            aggr_timeouts_to_deescalate: exec
                .aggr_timeouts_to_deescalate
                .unwrap_or(g.execution.aggr_timeouts_to_deescalate),
            ws_fill_grace_ms: g.execution.ws_fill_grace_ms,
            fill_rate_feedback_enabled: g.execution.fill_rate_feedback.enabled,
            fill_rate_window_ms: g.execution.fill_rate_feedback.window_ms,
            accel_window_ms: accel.window_ms.unwrap_or(g.accel.window_ms),
            accel_tiers: accel.tiers.unwrap_or_else(|| g.accel.tiers.clone()),
            roi_tiers: o.roi.map(|r| r.tiers).unwrap_or_else(|| g.roi.tiers.clone()),
            liq_distance_threshold: risk
                .liq_distance_threshold
                .unwrap_or(g.risk.liq_distance_threshold),
            liq_distance_hysteresis: risk
                .liq_distance_hysteresis
                .unwrap_or(g.risk.liq_distance_hysteresis),
            panic_close_enabled: panic.enabled.unwrap_or(g.risk.panic_close.enabled),
            panic_close_ttl_percent: panic
                .ttl_percent
                .unwrap_or(g.risk.panic_close.ttl_percent),
            panic_close_tiers: panic
                .tiers
                .unwrap_or_else(|| g.risk.panic_close.tiers.clone()),
            protective_stop_enabled: stop.enabled.unwrap_or(g.risk.protective_stop.enabled),
            protective_stop_dist_to_liq: stop
                .dist_to_liq
                .unwrap_or(g.risk.protective_stop.dist_to_liq),
            external_takeover_enabled: g.risk.protective_stop.external_takeover.enabled,
            external_takeover_rest_verify_interval_s: g
                .risk
                .protective_stop
                .external_takeover
                .rest_verify_interval_s,
            external_takeover_max_hold_s: g.risk.protective_stop.external_takeover.max_hold_s,
        }
    }
}

// ============================================================================
// Loading and validation
// ============================================================================

/// Binance API credentials, environment only.
#[derive(Clone)]
pub struct Credentials {
    pub api_key: String,
    pub api_secret: String,
}

pub fn load_credentials() -> Result<Credentials> {
    let api_key = std::env::var("BINANCE_API_KEY").unwrap_or_default();
    let api_secret = std::env::var("BINANCE_API_SECRET").unwrap_or_default();
    if api_key.trim().is_empty() {
        return Err(anyhow!("BINANCE_API_KEY is not set"));
    }
    if api_secret.trim().is_empty() {
        return Err(anyhow!("BINANCE_API_SECRET is not set"));
    }
    Ok(Credentials { api_key, api_secret })
}

pub fn load_config(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    let cfg: AppConfig = serde_yaml::from_str(&content)
        .with_context(|| format!("failed to parse config file {}", path.display()))?;
    validate_config(&cfg)?;
    Ok(cfg)
}

fn validate_config(cfg: &AppConfig) -> Result<()> {
    if cfg.symbols.is_empty() {
        return Err(anyhow!("config defines no symbols"));
    }

    for symbol in cfg.symbols() {
        let s = cfg.symbol_settings(&symbol);
        if s.order_ttl_ms <= 0 {
            return Err(anyhow!("{symbol}: order_ttl_ms must be positive"));
        }
        if s.repost_cooldown_ms < 0 {
            return Err(anyhow!("{symbol}: repost_cooldown_ms must be non-negative"));
        }
        if s.min_signal_interval_ms <= 0 {
            return Err(anyhow!("{symbol}: min_signal_interval_ms must be positive"));
        }
        if s.maker_safety_ticks < 1 {
            return Err(anyhow!("{symbol}: maker_safety_ticks must be >= 1"));
        }
        if s.max_mult < 1 || s.base_lot_mult < 1 {
            return Err(anyhow!("{symbol}: lot multipliers must be >= 1"));
        }
        if s.max_order_notional <= Decimal::ZERO {
            return Err(anyhow!("{symbol}: max_order_notional must be positive"));
        }
        if s.liq_distance_threshold <= Decimal::ZERO || s.liq_distance_threshold >= Decimal::ONE {
            return Err(anyhow!("{symbol}: liq_distance_threshold must be in (0, 1)"));
        }
        if s.panic_close_ttl_percent <= Decimal::ZERO || s.panic_close_ttl_percent > Decimal::ONE {
            return Err(anyhow!("{symbol}: panic_close.ttl_percent must be in (0, 1]"));
        }
        for tier in &s.panic_close_tiers {
            if tier.dist_to_liq <= Decimal::ZERO {
                return Err(anyhow!("{symbol}: panic tier dist_to_liq must be positive"));
            }
            if tier.slice_ratio <= Decimal::ZERO || tier.slice_ratio > Decimal::ONE {
                return Err(anyhow!("{symbol}: panic tier slice_ratio must be in (0, 1]"));
            }
            if tier.maker_timeouts_to_escalate < 1 {
                return Err(anyhow!(
                    "{symbol}: panic tier maker_timeouts_to_escalate must be >= 1"
                ));
            }
        }
        if s.protective_stop_dist_to_liq <= Decimal::ZERO
            || s.protective_stop_dist_to_liq >= Decimal::ONE
        {
            return Err(anyhow!("{symbol}: protective_stop.dist_to_liq must be in (0, 1)"));
        }
    }
    Ok(())
}

// ============================================================================
// Defaults
// ============================================================================

fn default_stale_data_ms() -> i64 {
    1_500
}

fn default_reconnect_initial_delay_ms() -> u64 {
    1_000
}

fn default_reconnect_max_delay_ms() -> u64 {
    30_000
}

fn default_reconnect_multiplier() -> u32 {
    2
}

fn default_order_ttl_ms() -> i64 {
    800
}

fn default_repost_cooldown_ms() -> i64 {
    100
}

fn default_min_signal_interval_ms() -> i64 {
    200
}

fn default_base_lot_mult() -> u32 {
    1
}

fn default_maker_price_mode() -> MakerPriceMode {
    MakerPriceMode::InsideSpread1tick
}

fn default_maker_n_ticks() -> u32 {
    1
}

fn default_maker_safety_ticks() -> u32 {
    1
}

fn default_max_mult() -> u32 {
    50
}

fn default_max_order_notional() -> Decimal {
    Decimal::from(200)
}

fn default_maker_timeouts_to_escalate() -> u32 {
    2
}

fn default_aggr_fills_to_deescalate() -> u32 {
    1
}

fn default_aggr_timeouts_to_deescalate() -> u32 {
    2
}

fn default_ws_fill_grace_ms() -> i64 {
    5_000
}

fn default_fill_rate_window_ms() -> i64 {
    300_000
}

fn default_accel_window_ms() -> i64 {
    2_000
}

fn default_liq_distance_threshold() -> Decimal {
    Decimal::new(15, 3) // 0.015
}

fn default_liq_distance_hysteresis() -> Decimal {
    Decimal::new(2, 1) // 0.2 relative
}

fn default_panic_ttl_percent() -> Decimal {
    Decimal::new(5, 1) // 0.5
}

fn default_protective_stop_enabled() -> bool {
    true
}

fn default_protective_stop_dist() -> Decimal {
    Decimal::new(1, 2) // 0.01
}

fn default_external_takeover_enabled() -> bool {
    true
}

fn default_rest_verify_interval_s() -> u64 {
    30
}

fn default_takeover_max_hold_s() -> u64 {
    300
}

fn default_max_orders_per_sec() -> u32 {
    5
}

fn default_max_cancels_per_sec() -> u32 {
    8
}

fn default_true() -> bool {
    true
}
