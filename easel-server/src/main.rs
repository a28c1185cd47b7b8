use std::sync::Arc;

use anyhow::Result;
use axum::{
    extract::{Json, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use base64::{prelude::BASE64_STANDARD, Engine};
use clap::Parser;
use easel_core::{
    DevicePreference, DeviceProfile, GenerationMetadata, GenerationRequest, ImageService,
    SdEngineFactory, ServiceConfig, DEFAULT_MODEL_ID,
};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

// Define command line arguments
#[derive(Parser, Debug)]
#[command(author, version, about = "Easel image generation server")]
struct Args {
    /// Use CPU instead of GPU
    #[arg(long)]
    cpu: bool,

    /// Treat the GPU as memory constrained (6GB-class cards)
    #[arg(long)]
    low_vram: bool,

    /// Model to load at startup
    #[arg(long, default_value = DEFAULT_MODEL_ID)]
    model: String,

    /// Host address to bind the server to
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Port to bind the server to
    #[arg(long, default_value_t = 7860)]
    port: u16,
}

fn default_style() -> String {
    "cartoon".to_string()
}

#[derive(Deserialize)]
struct GenerateBody {
    prompt: String,
    #[serde(default = "default_style")]
    style: String,
    seed: Option<u64>,
}

#[derive(Deserialize)]
struct GenerateSceneBody {
    prompt: String,
    /// Base64-encoded reference image of the character to keep consistent.
    character_image: String,
    #[serde(default = "default_style")]
    style: String,
    seed: Option<u64>,
    strength: Option<f32>,
}

#[derive(Deserialize)]
struct SwitchModelBody {
    model_id: String,
}

#[derive(Serialize)]
struct GenerationResponse {
    success: bool,
    image: String,
    format: &'static str,
    metadata: GenerationMetadata,
}

#[derive(Serialize)]
struct MessageResponse {
    success: bool,
    message: String,
}

/// API failure shape: `{success: false, error}` plus an HTTP status mapped
/// from the core error taxonomy.
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
        }
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }
}

impl From<easel_core::Error> for ApiError {
    fn from(err: easel_core::Error) -> Self {
        let status = match &err {
            easel_core::Error::InvalidArgument(_) => StatusCode::BAD_REQUEST,
            easel_core::Error::NoModelLoaded => StatusCode::CONFLICT,
            easel_core::Error::ModelLoad { .. } | easel_core::Error::Generation(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        Self {
            status,
            message: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(serde_json::json!({
            "success": false,
            "error": self.message,
        }));
        (self.status, body).into_response()
    }
}

type AppState = Arc<ImageService>;

/// Run a blocking core call off the async runtime.
async fn run_blocking<T, F>(task: F) -> Result<T, ApiError>
where
    T: Send + 'static,
    F: FnOnce() -> easel_core::Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(task)
        .await
        .map_err(|join_error| ApiError::internal(format!("worker task failed: {join_error}")))?
        .map_err(ApiError::from)
}

async fn health_handler() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "healthy" }))
}

async fn status_handler(State(service): State<AppState>) -> impl IntoResponse {
    Json(service.status())
}

async fn models_handler(State(service): State<AppState>) -> impl IntoResponse {
    let status = service.status();
    Json(serde_json::json!({
        "styles": service.styles().names(),
        "current_model": status.model_id,
        "cached_models": status.cached_models,
        "device": status.device,
    }))
}

async fn generate_handler(
    State(service): State<AppState>,
    Json(body): Json<GenerateBody>,
) -> Result<Json<GenerationResponse>, ApiError> {
    let output = run_blocking(move || {
        service.generate(&GenerationRequest::text(body.prompt, body.style, body.seed))
    })
    .await?;
    Ok(Json(GenerationResponse {
        success: true,
        image: BASE64_STANDARD.encode(&output.image_png),
        format: "png",
        metadata: output.metadata,
    }))
}

async fn generate_scene_handler(
    State(service): State<AppState>,
    Json(body): Json<GenerateSceneBody>,
) -> Result<Json<GenerationResponse>, ApiError> {
    let reference_image = BASE64_STANDARD
        .decode(body.character_image.as_bytes())
        .map_err(|decode_error| {
            ApiError::bad_request(format!("character_image is not valid base64: {decode_error}"))
        })?;
    let output = run_blocking(move || {
        service.generate_from_reference(&GenerationRequest {
            prompt: body.prompt,
            style: body.style,
            seed: body.seed,
            reference_image: Some(reference_image),
            strength: body.strength,
        })
    })
    .await?;
    Ok(Json(GenerationResponse {
        success: true,
        image: BASE64_STANDARD.encode(&output.image_png),
        format: "png",
        metadata: output.metadata,
    }))
}

async fn switch_model_handler(
    State(service): State<AppState>,
    Json(body): Json<SwitchModelBody>,
) -> Result<Json<MessageResponse>, ApiError> {
    let message = run_blocking(move || {
        service.load_model(&body.model_id)?;
        Ok(format!("Switched to model: {}", body.model_id))
    })
    .await?;
    Ok(Json(MessageResponse {
        success: true,
        message,
    }))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();

    let preference = if args.cpu {
        DevicePreference::ForceCpu
    } else {
        DevicePreference::default()
    };
    let profile = DeviceProfile::detect(preference, args.low_vram)?;
    let factory = Arc::new(SdEngineFactory::new(profile.clone()));
    let service = Arc::new(ImageService::new(factory, profile, ServiceConfig::default()));

    // Preload the startup model; a failure leaves the service up but
    // not-ready, and /switch-model can retry later.
    let startup_model = args.model.clone();
    let preload = service.clone();
    let loaded = tokio::task::spawn_blocking(move || preload.load_model(&startup_model)).await?;
    if let Err(load_error) = loaded {
        error!(model_id = %args.model, "startup model load failed: {load_error}");
    }

    // --- Build axum router with shared state ---
    let app = Router::new()
        .route("/health", get(health_handler))
        .route("/status", get(status_handler))
        .route("/models", get(models_handler))
        .route("/generate", post(generate_handler))
        .route("/generate-scene", post(generate_scene_handler))
        .route("/switch-model", post(switch_model_handler))
        .with_state(service);

    // --- Start the server ---
    let bind_address = format!("{}:{}", args.host, args.port);
    let listener = TcpListener::bind(&bind_address).await?;
    info!("started server on {}", listener.local_addr()?);
    axum::serve(listener, app.into_make_service()).await?;

    Ok(())
}
