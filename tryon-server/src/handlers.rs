use std::time::Instant;

use axum::{
    extract::{Multipart, State},
    Json,
};
use image::{DynamicImage, ImageFormat};
use serde::Serialize;
use tracing::{error, info};
use tryon_core::{encode_data_uri, TryOnError, TryOnResponse};

use crate::error::AppError;
use crate::form::RawForm;
use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct StatusMessage {
    pub message: String,
}

pub async fn root(State(state): State<AppState>) -> Json<StatusMessage> {
    let status = if state.is_ready().await {
        "ready"
    } else {
        "loading"
    };
    Json(StatusMessage {
        message: format!("Virtual Try-On API is running. Status: {status}"),
    })
}

pub async fn tryon(
    State(state): State<AppState>,
    multipart: Multipart,
) -> Result<Json<TryOnResponse>, AppError> {
    let model = state.model().await.ok_or(AppError::NotReady)?;

    let form = RawForm::read(multipart).await?.validate()?;
    let input_parameters = form.parameters();
    let input = form.into_input()?;
    info!(
        category = %input_parameters.category,
        steps = input_parameters.denoise_steps,
        seed = input_parameters.seed,
        auto_mask = input_parameters.use_auto_mask,
        auto_crop = input_parameters.use_auto_crop,
        "try-on request accepted"
    );

    let started = Instant::now();
    let output = tokio::task::spawn_blocking(move || model.run(input))
        .await
        .map_err(|e| {
            error!(error = %e, "try-on task did not complete");
            AppError::Internal(format!("Internal server error during try-on process: {e}"))
        })?
        .map_err(|e| {
            if let TryOnError::Inference(cause) = &e {
                error!(error = ?cause, "try-on inference failed");
            }
            AppError::from(e)
        })?;

    let encode = |img: &DynamicImage, format: ImageFormat| {
        encode_data_uri(img, format)
            .map_err(|e| AppError::Internal(format!("Failed to encode output images: {e}")))
    };
    let result_image = encode(&output.result, ImageFormat::Jpeg)?;
    let mask_visualization = encode(&output.mask_visualization, ImageFormat::Png)?;
    info!(
        elapsed_ms = started.elapsed().as_millis() as u64,
        "try-on request served"
    );

    Ok(Json(TryOnResponse {
        result_image,
        mask_visualization,
        input_parameters,
    }))
}
