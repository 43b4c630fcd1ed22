use anyhow::{Context, Result};
use emotived::config::Config;
use emotived::engine;
use emotived::server::{self, AppState, ServiceStatus};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    tracing::info!("emotived starting");

    let config = Config::load().context("failed to load configuration")?;
    tracing::debug!(?config, "configuration resolved");

    let (pipeline, model_info) =
        engine::load_pipeline(&config).context("failed to load face cascade or emotion model")?;
    let handle = engine::spawn_engine(pipeline)?;

    let status = ServiceStatus::new(model_info, config.cascade_path.display().to_string());
    let state = AppState::new(handle, config.no_face_status, status);
    let app = server::router(state, config.body_limit_bytes);

    let addr = config.listen_addr();
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    tracing::info!(%addr, "emotived ready");

    axum::serve(listener, app)
        .with_graceful_shutdown(server::shutdown_signal(tokio::signal::ctrl_c()))
        .await?;

    tracing::info!("emotived shutting down");
    Ok(())
}
