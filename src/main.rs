use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use tracing::{error, info};

use unwind_bot::app::Application;
use unwind_bot::logging;

#[tokio::main]
async fn main() -> Result<()> {
    logging::init();

    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.yaml"));

    let app = match Application::from_config_path(&config_path) {
        Ok(app) => app,
        Err(e) => {
            error!(error = %e, config = %config_path.display(), "initialization failed");
            return Err(e);
        }
    };

    if let Err(e) = app.initialize().await {
        error!(error = %e, "startup failed");
        return Err(e);
    }

    // SIGINT and SIGTERM both trigger the same graceful shutdown.
    {
        let app = app.clone();
        tokio::spawn(async move {
            wait_for_shutdown_signal().await;
            info!("shutdown signal received");
            app.request_shutdown();
        });
    }

    let result = app.run().await;
    app.shutdown().await;
    result
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(_) => {
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
