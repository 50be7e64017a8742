pub mod cli;
pub mod config;
pub mod context;
pub mod db;
pub mod mqtt;
pub mod web;

use crate::cli::Cli;
use crate::config::Settings;
use crate::context::AppContext;
use clap::Parser;
use color_eyre::{eyre::eyre, Result};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

#[tokio::main]
async fn main() -> Result<()> {
    let settings = setup()?;

    info!("Starting bumper, data directory {}", settings.data_dir.display());
    let ctx = Arc::new(
        AppContext::build(settings)
            .await
            .map_err(|e| eyre!("Failed to initialize: {}", e))?,
    );

    ctx.mqtt_server
        .start()
        .await
        .map_err(|e| eyre!("Failed to start MQTT server: {}", e))?;

    if let Err(e) = ctx.start_helper_bot().await {
        warn!("Helperbot not started: {}", e);
    }

    let cancel = CancellationToken::new();
    let web = tokio::spawn(web::serve(ctx.clone(), cancel.clone()));

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");

    cancel.cancel();
    match web.await {
        Ok(Err(e)) => error!("Web server failed: {}", e),
        Err(e) => error!("Web server task failed: {}", e),
        Ok(Ok(())) => {}
    }
    ctx.shutdown().await;

    info!("Bumper stopped");
    Ok(())
}

fn setup() -> Result<Settings> {
    if std::env::var("RUST_LIB_BACKTRACE").is_err() {
        std::env::set_var("RUST_LIB_BACKTRACE", "0")
    }
    color_eyre::install()?;

    let cli = Cli::parse();
    let settings = Settings::load(&cli)?;
    setup_logging_env(settings.log_level()?);
    Ok(settings)
}

fn setup_logging_env(level: Level) {
    FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .pretty()
        .init();
}
