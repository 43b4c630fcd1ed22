//! HTTP surface: `GET /`, `GET /status`, `POST /predict` (multipart upload)
//! and `POST /api/predict` (JSON data URL from a webcam capture).

use crate::engine::{EngineError, EngineHandle};
use axum::extract::multipart::MultipartRejection;
use axum::extract::rejection::JsonRejection;
use axum::extract::{DefaultBodyLimit, Multipart, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use emotive_core::{Analysis, EmotionPrediction, InputLayout, ModelInfo, NumericType};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::Instrument;
use uuid::Uuid;

/// Multipart field that carries the uploaded image.
pub const IMAGE_FIELD: &str = "image";
pub const WELCOME: &str = "Welcome to the server!";

/// What `GET /status` reports.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceStatus {
    pub version: &'static str,
    pub model: Option<ModelInfo>,
    pub cascade: Option<String>,
    /// Element type the classifier input is cast to.
    pub input_type: Option<NumericType>,
    pub layout: Option<InputLayout>,
}

impl ServiceStatus {
    pub fn new(model: ModelInfo, cascade: impl Into<String>) -> Self {
        Self {
            input_type: Some(model.input_type),
            layout: Some(model.layout),
            model: Some(model),
            cascade: Some(cascade.into()),
            ..Self::default()
        }
    }
}

impl Default for ServiceStatus {
    fn default() -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION"),
            model: None,
            cascade: None,
            input_type: None,
            layout: None,
        }
    }
}

pub struct AppState {
    engine: EngineHandle,
    no_face_status: StatusCode,
    status: ServiceStatus,
}

impl AppState {
    /// `no_face_status` other than a valid HTTP code falls back to 422.
    pub fn new(engine: EngineHandle, no_face_status: u16, status: ServiceStatus) -> Self {
        let no_face_status =
            StatusCode::from_u16(no_face_status).unwrap_or(StatusCode::UNPROCESSABLE_ENTITY);
        Self {
            engine,
            no_face_status,
            status,
        }
    }
}

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("No image file provided")]
    MissingImage,
    #[error("No image provided")]
    MissingImageSrc,
    #[error("Invalid image data")]
    InvalidImage,
    #[error("No face detected")]
    NoFace(StatusCode),
    #[error("{message}")]
    Multipart { status: StatusCode, message: String },
    #[error("Internal server error")]
    Internal(#[source] EngineError),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::MissingImage | ApiError::MissingImageSrc | ApiError::InvalidImage => {
                StatusCode::BAD_REQUEST
            }
            ApiError::NoFace(status) => *status,
            ApiError::Multipart { status, .. } => *status,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<EngineError> for ApiError {
    fn from(e: EngineError) -> Self {
        match e {
            EngineError::Pipeline(p) if p.is_invalid_input() => ApiError::InvalidImage,
            other => ApiError::Internal(other),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if let ApiError::Internal(e) = &self {
            tracing::error!(error = %e, "prediction failed");
        }
        let body = Json(serde_json::json!({ "error": self.to_string() }));
        (self.status(), body).into_response()
    }
}

/// Build the service router.
pub fn router(state: AppState, body_limit_bytes: usize) -> Router {
    Router::new()
        .route("/", get(welcome))
        .route("/status", get(status))
        .route("/predict", post(predict))
        .route("/api/predict", post(predict_data_url))
        .layer(DefaultBodyLimit::max(body_limit_bytes))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(Arc::new(state))
}

async fn welcome() -> &'static str {
    WELCOME
}

async fn status(State(state): State<Arc<AppState>>) -> Json<ServiceStatus> {
    Json(state.status.clone())
}

async fn predict(
    State(state): State<Arc<AppState>>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Json<EmotionPrediction>, ApiError> {
    let request_id = Uuid::new_v4();
    let span = tracing::info_span!("predict", %request_id);

    async move {
        // A body that is not multipart has no image field either.
        let Ok(mut multipart) = multipart else {
            return Err(ApiError::MissingImage);
        };
        let image = read_image_field(&mut multipart)
            .await?
            .ok_or(ApiError::MissingImage)?;
        tracing::debug!(bytes = image.len(), "image received");
        analyze(&state, image).await
    }
    .instrument(span)
    .await
}

/// Body of `POST /api/predict`.
#[derive(Debug, Deserialize)]
pub struct DataUrlRequest {
    #[serde(rename = "imageSrc")]
    pub image_src: Option<String>,
}

async fn predict_data_url(
    State(state): State<Arc<AppState>>,
    body: Result<Json<DataUrlRequest>, JsonRejection>,
) -> Result<Json<EmotionPrediction>, ApiError> {
    let request_id = Uuid::new_v4();
    let span = tracing::info_span!("predict_data_url", %request_id);

    async move {
        let image_src = body
            .ok()
            .and_then(|Json(req)| req.image_src)
            .filter(|src| !src.is_empty())
            .ok_or(ApiError::MissingImageSrc)?;
        let image = decode_data_url(&image_src)?;
        tracing::debug!(bytes = image.len(), "data url decoded");
        analyze(&state, image).await
    }
    .instrument(span)
    .await
}

/// Decode `data:<mime>;base64,<payload>`. A bare base64 payload is accepted too.
pub fn decode_data_url(src: &str) -> Result<Vec<u8>, ApiError> {
    let payload = match src.split_once(',') {
        Some((_, payload)) => payload,
        None => src,
    };
    STANDARD
        .decode(payload.trim())
        .map_err(|_| ApiError::InvalidImage)
}

async fn analyze(state: &AppState, image: Vec<u8>) -> Result<Json<EmotionPrediction>, ApiError> {
    match state.engine.analyze(image).await? {
        Analysis::NoFace => {
            tracing::info!("no face detected");
            Err(ApiError::NoFace(state.no_face_status))
        }
        Analysis::Face { prediction, .. } => {
            tracing::info!(
                emotion = %prediction.emotion,
                confidence = prediction.confidence,
                "prediction served"
            );
            Ok(Json(prediction))
        }
    }
}

/// Return the bytes of the first `image` field, skipping any others.
async fn read_image_field(multipart: &mut Multipart) -> Result<Option<Vec<u8>>, ApiError> {
    let multipart_error = |e: axum::extract::multipart::MultipartError| ApiError::Multipart {
        status: e.status(),
        message: e.body_text(),
    };

    while let Some(field) = multipart.next_field().await.map_err(multipart_error)? {
        if field.name() == Some(IMAGE_FIELD) {
            let bytes = field.bytes().await.map_err(multipart_error)?;
            return Ok(Some(bytes.to_vec()));
        }
    }
    Ok(None)
}

/// Wait for `signal`. When the handler cannot be installed, log it and keep
/// serving rather than shutting down straight away.
pub async fn shutdown_signal<F>(signal: F)
where
    F: Future<Output = std::io::Result<()>>,
{
    match signal.await {
        Ok(()) => tracing::info!("shutdown signal received"),
        Err(e) => {
            tracing::error!(error = %e, "failed to install shutdown handler; running until killed");
            std::future::pending::<()>().await;
        }
    }
}
