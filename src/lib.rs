// Library crate: the binary and the integration tests both link against this.

pub mod app;
pub mod config;
pub mod connection;
pub mod execution;
pub mod logging;
pub mod notify;
pub mod protective_stop;
pub mod rate_limiter;
pub mod risk;
pub mod rules;
pub mod signal;
pub mod types;

pub use app::Application;
pub use config::{AppConfig, SymbolSettings};
pub use rules::InstrumentRules;
