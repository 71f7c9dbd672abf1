use std::process::ExitCode;

use tracing_subscriber::EnvFilter;
use vmgrid_api::config::ApiConfig;
use vmgrid_api::{build_app, setup, AppState};
use vmgrid_orchestrator::sweeper;

#[tokio::main]
async fn main() -> ExitCode {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = ?e, "vmgrid-api stopped");
            ExitCode::FAILURE
        }
    }
}

async fn run() -> anyhow::Result<()> {
    let config = ApiConfig::from_env()?;
    tracing::info!(
        backends = ?config.settings.backends,
        listen = %config.listen_addr,
        "starting vmgrid-api"
    );

    let orchestrator = setup::build_orchestrator(config.settings).await?;
    tokio::spawn(sweeper::run(orchestrator.clone()));

    let app = build_app(AppState::new(orchestrator));
    let listener = tokio::net::TcpListener::bind(config.listen_addr).await?;
    tracing::info!(addr = %config.listen_addr, "listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown requested");
        })
        .await?;
    Ok(())
}
