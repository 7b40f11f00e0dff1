use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use hf_hub::api::tokio::Api;
use tokio::net::TcpListener;
use tracing::info;
use tryon_core::TryOnLoader;
use tryon_server::{create_router, lifecycle, telemetry, AppState, Settings};

#[derive(Parser, Debug)]
#[command(author, version, about = "Virtual try-on inference server")]
struct Args {
    /// Configuration file (TOML); defaults to config/tryon.toml when present
    #[arg(long)]
    config: Option<PathBuf>,

    /// Use CPU instead of GPU
    #[arg(long)]
    cpu: bool,

    /// Host address to bind the server to
    #[arg(long)]
    host: Option<String>,

    /// Port to bind the server to
    #[arg(long)]
    port: Option<u16>,
}

impl Args {
    fn apply(self, settings: &mut Settings) {
        if self.cpu {
            settings.models.cpu = true;
        }
        if let Some(host) = self.host {
            settings.server.host = host;
        }
        if let Some(port) = self.port {
            settings.server.port = port;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let mut settings = Settings::load(args.config.as_deref()).context("failed to load settings")?;
    args.apply(&mut settings);
    settings.validate()?;
    telemetry::init(&settings.logging)?;

    let state = AppState::new();
    let app = create_router(state.clone(), settings.max_upload_bytes());

    // Serve right away so `/` reports loading while the models come up.
    let listener = TcpListener::bind(settings.bind_address())
        .await
        .with_context(|| format!("failed to bind {}", settings.bind_address()))?;
    info!(address = %listener.local_addr()?, "started server");
    let server = tokio::spawn(async move {
        axum::serve(listener, app.into_make_service())
            .with_graceful_shutdown(lifecycle::shutdown_signal())
            .await
    });

    let startup = lifecycle::bring_up::<TryOnLoader>(
        &state,
        Api::new()?,
        settings.model_source(),
        settings.device_map(),
        &settings.inference,
    );
    lifecycle::serve_while_starting(server, startup).await?;
    lifecycle::tear_down(&state).await;
    Ok(())
}
