use anyhow::Context;
use openai2daisi::config::GatewayConfig;
use openai2daisi::credentials::CredentialCache;
use openai2daisi::remote::RemoteBackend;
use openai2daisi::server::{build_router, AppState};
use openai2daisi::util::init_tracing;
use std::env;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let args: Vec<String> = env::args().collect();
    if args.iter().skip(1).any(|a| a == "--help" || a == "-h") {
        eprintln!("Usage: {} [--config=gateway.json]", args[0]);
        return Ok(());
    }
    let config_arg = args
        .iter()
        .skip(1)
        .find_map(|a| a.strip_prefix("--config="));
    if let Some(path) = config_arg {
        tracing::info!("Loading gateway configuration from: {}", path);
    }
    let config = GatewayConfig::load(config_arg)?;

    let backend = Arc::new(RemoteBackend::from_config(&config));
    let credentials = Arc::new(CredentialCache::new(
        backend.clone(),
        Duration::from_secs(config.credential_ttl_secs),
    ));

    let shutdown = CancellationToken::new();
    let sweeper = credentials.spawn_sweeper(
        Duration::from_secs(config.sweep_interval_secs),
        shutdown.child_token(),
    );

    let app = build_router(Arc::new(AppState::new(backend, credentials)));

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.bind_addr))?;
    tracing::info!(
        backend = %config.backend_url,
        "openai2daisi listening on http://{}",
        config.bind_addr
    );

    let signal = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                tracing::info!("Ctrl-C received, shutting down");
                signal.cancel();
            }
            Err(e) => tracing::error!("failed to listen for Ctrl-C: {e}"),
        }
    });

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown.clone().cancelled_owned())
        .await?;

    shutdown.cancel();
    let _ = sweeper.await;
    tracing::info!("Gateway shut down");
    Ok(())
}
