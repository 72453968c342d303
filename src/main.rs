//! Sibyl binary entry point.

use std::sync::Arc;

use tracing::info;
use tracing_subscriber::EnvFilter;

use sibyl::config::Settings;
use sibyl::AppContext;

#[tokio::main]
async fn main() {
    // Stdout carries protocol frames; all diagnostics go to stderr.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("sibyl=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let settings = Settings::from_env();
    let ctx = match AppContext::initialize(&settings).await {
        Ok(ctx) => Arc::new(ctx),
        Err(e) => {
            eprintln!("Error: {e}");
            std::process::exit(1);
        }
    };

    tokio::select! {
        result = sibyl::rpc::serve(Arc::clone(&ctx)) => {
            if let Err(e) = result {
                eprintln!("Error: {e}");
                ctx.shutdown().await;
                std::process::exit(1);
            }
            info!("stdin closed");
        }
        _ = shutdown_signal() => {
            info!("shutdown signal received");
        }
    }

    ctx.shutdown().await;
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
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
