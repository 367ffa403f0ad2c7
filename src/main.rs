use anyhow::Context;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

use slot_watch::config::Config;
use slot_watch::engine::Engine;
use slot_watch::extract::TableExtractor;
use slot_watch::health;
use slot_watch::notify::TelegramTransport;
use slot_watch::scheduler::{check_loop, command_loop, Shutdown};
use slot_watch::scrape::ScrapeClient;

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    // Logging
    let _ = fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .finish()
        .try_init();

    // Config errors are the only fatal ones, and only here.
    let cfg = Config::from_env().context("invalid configuration")?;
    info!(pages = cfg.urls.len(), state=%cfg.state_file.display(), "configuration loaded");

    // Init subsystems
    let (shutdown, trigger) = Shutdown::new();
    let source = Arc::new(ScrapeClient::new(Duration::from_secs(30))?);
    let extractor = Arc::new(TableExtractor::new(cfg.rules.clone()));
    let transport = Arc::new(TelegramTransport::new(&cfg.bot_token)?);
    let engine = Arc::new(Engine::new(
        cfg.clone(),
        source,
        extractor,
        transport,
        shutdown.clone(),
    ));

    let server = if cfg.keep_alive {
        let server = health::serve(engine.clone(), &cfg.health_bind)?;
        let handle = server.handle();
        actix_web::rt::spawn(server);
        Some(handle)
    } else {
        None
    };

    let checks = tokio::spawn(check_loop(engine.clone(), shutdown.clone()));
    let commands = cfg
        .enable_commands
        .then(|| tokio::spawn(command_loop(engine.clone(), shutdown.clone())));
    engine.announce_startup().await;

    wait_for_signal().await;
    info!("shutdown requested");
    trigger.trigger();

    if let Err(e) = checks.await {
        warn!(error=?e, "check loop ended abnormally");
    }
    if let Some(commands) = commands {
        if let Err(e) = commands.await {
            warn!(error=?e, "command loop ended abnormally");
        }
    }
    if let Some(handle) = server {
        handle.stop(true).await;
    }
    engine.shutdown().await;
    Ok(())
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
                return;
            }
            Err(e) => warn!(error=?e, "cannot listen for SIGTERM, ctrl-c only"),
        }
    }
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error=?e, "cannot listen for ctrl-c");
    }
}
