//! Model startup and shutdown around the HTTP server.

use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use hf_hub::api::tokio::Api;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use tryon_core::registry::warmup_input;
use tryon_core::{DeviceMap, Loader, ModelSource, TryOnModel};

use crate::settings::InferenceSettings;
use crate::state::AppState;

/// Loads the models with `L`, runs the optional warm-up and marks the state
/// ready. A load failure is returned to the caller; a warm-up failure is not.
pub async fn bring_up<L>(
    state: &AppState,
    api: Api,
    source: ModelSource,
    device_map: DeviceMap,
    inference: &InferenceSettings,
) -> Result<()>
where
    L: Loader,
    L::Model: 'static,
{
    let started = Instant::now();
    let model: Arc<dyn TryOnModel> = Arc::new(
        L::load(api, source, device_map)
            .await
            .context("failed to load try-on models")?,
    );
    info!(
        elapsed_s = started.elapsed().as_secs_f32(),
        "models loaded"
    );

    if inference.warmup {
        warm_up(model.clone(), inference.warmup_steps).await;
    }
    state.install(model).await;
    info!("try-on service ready");
    Ok(())
}

async fn warm_up(model: Arc<dyn TryOnModel>, steps: usize) {
    let started = Instant::now();
    match tokio::task::spawn_blocking(move || model.run(warmup_input(steps))).await {
        Ok(Ok(_)) => info!(
            steps,
            elapsed_s = started.elapsed().as_secs_f32(),
            "warm-up inference finished"
        ),
        Ok(Err(e)) => warn!(error = %e, "warm-up inference failed, serving anyway"),
        Err(e) => warn!(error = %e, "warm-up task did not complete, serving anyway"),
    }
}

/// Runs `startup` while `server` is already accepting requests and then
/// waits for the server to stop.
///
/// If the server stops first, for example on ctrl-c during a long load, the
/// startup future is dropped and the load is abandoned. A startup error is
/// returned without waiting for the server.
pub async fn serve_while_starting<S>(
    mut server: JoinHandle<std::io::Result<()>>,
    startup: S,
) -> Result<()>
where
    S: Future<Output = Result<()>>,
{
    tokio::select! {
        started = startup => started?,
        served = &mut server => {
            warn!("server stopped before the models were ready, abandoning startup");
            served.context("server task failed")??;
            return Ok(());
        }
    }
    server.await.context("server task failed")??;
    Ok(())
}

/// Releases the models once the server has stopped.
pub async fn tear_down(state: &AppState) {
    if state.unload().await {
        info!("models unloaded");
    }
}

pub async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
}
