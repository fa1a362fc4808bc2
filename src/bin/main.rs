use tracing::info;
use tracing_subscriber::EnvFilter;
use wa_inbox::{config, create_app};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    config::ensure_config_dir();

    let (state, app) = create_app().await?;

    let addr = format!("{}:{}", state.config.server.host, state.config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(addr = %addr, "wa-inbox listening");

    axum::serve(listener, app).await?;
    Ok(())
}
