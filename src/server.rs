use crate::config::Config;
use crate::definition::{
    decode_data_uri, embed_definition, estimate_base64_image_size, extract_definition,
    strip_metadata,
};
use crate::embedding::{Embedder, EmbeddingProvider};
use crate::error::CharavaultError;
use crate::library::{CardLibrary, DownloadedCard, FileUpload, LibraryStats, UploadReport};
use crate::normalize::{normalize_card, NormalizeOptions};
use crate::pipeline::run_blocking;
use crate::png_export::create_card_png;
use crate::store::{CharacterId, DefinitionRecord, ImageVariant, LocalObjectStore, MemoryRepository};
use crate::tokens::{compute_token_counts, TokenCounts};
use axum::{
    extract::{DefaultBodyLimit, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tracing::{debug, info, warn};

const SERVER_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Base64 inflates payloads by 4/3; allow a handful of maximum-size images
/// per request on top of that.
const IMAGES_PER_REQUEST: u64 = 8;

#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OutputFormat {
    #[default]
    Json,
    Png,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub status: String,
    pub version: String,
    pub ready: bool,
    pub port: u16,
    pub embedding_provider: String,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub success: bool,
    pub error: String,
    pub error_code: String,
}

#[derive(Debug, Deserialize)]
pub struct ImageRequest {
    pub image: String,
}

#[derive(Debug, Serialize)]
pub struct ImageResponse {
    pub success: bool,
    pub image: String,
}

#[derive(Debug, Serialize)]
pub struct DefinitionResponse {
    pub success: bool,
    pub definition: String,
}

#[derive(Debug, Deserialize)]
pub struct EmbedRequest {
    pub image: String,
    pub definition: String,
}

#[derive(Debug, Deserialize)]
pub struct NormalizeRequest {
    pub definition: String,
    #[serde(default)]
    pub personality_to_creator_notes: bool,
    #[serde(default)]
    pub output_format: OutputFormat,
    /// Optional PNG data URI used as the card image when `output_format` is png.
    pub avatar: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct NormalizeResponse {
    pub success: bool,
    pub card: crate::card::CardDocument,
    pub tokens: TokenCounts,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub png_base64: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadRequest {
    pub files: Vec<FileUpload>,
    #[serde(default, alias = "personality_to_creator_notes")]
    pub personality_to_creator_notes: bool,
}

#[derive(Debug, Deserialize)]
pub struct IdQuery {
    pub id: CharacterId,
}

#[derive(Debug, Deserialize)]
pub struct UpdateDefinitionRequest {
    pub id: CharacterId,
    pub definition: String,
}

#[derive(Debug, Serialize)]
pub struct SuccessResponse {
    pub success: bool,
}

#[derive(Debug, Serialize)]
pub struct TaskResponse {
    pub success: bool,
    pub updated: usize,
}

pub struct ServerState {
    pub port: u16,
    pub library: Arc<CardLibrary>,
    pub embedding_provider: String,
}

impl ServerState {
    fn max_image_bytes(&self) -> u64 {
        self.library.settings().max_image_bytes
    }
}

type ApiError = (StatusCode, Json<ErrorResponse>);
type ApiResult<T> = Result<Json<T>, ApiError>;

pub fn error_to_http(e: &CharavaultError) -> StatusCode {
    match e {
        CharavaultError::InvalidImageFormat(_)
        | CharavaultError::FormatError(_)
        | CharavaultError::SchemaError(_)
        | CharavaultError::InvalidJson(_) => StatusCode::BAD_REQUEST,
        CharavaultError::DefinitionNotFound | CharavaultError::NotFound(_) => StatusCode::NOT_FOUND,
        CharavaultError::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn api_error(e: CharavaultError) -> ApiError {
    let status = error_to_http(&e);
    if status.is_server_error() {
        warn!(error = %e, code = e.code(), "request failed");
    } else {
        debug!(error = %e, code = e.code(), "request rejected");
    }
    (
        status,
        Json(ErrorResponse {
            success: false,
            error: e.to_string(),
            error_code: e.code().to_string(),
        }),
    )
}

fn check_image_size(state: &ServerState, image: &str) -> Result<(), ApiError> {
    let size = estimate_base64_image_size(image).bytes;
    let limit = state.max_image_bytes();
    if size > limit {
        return Err(api_error(CharavaultError::PayloadTooLarge { size, limit }));
    }
    Ok(())
}

async fn status_handler(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    Json(StatusResponse {
        status: "ok".to_string(),
        version: SERVER_VERSION.to_string(),
        ready: true,
        port: state.port,
        embedding_provider: state.embedding_provider.clone(),
    })
}

async fn extract_handler(
    State(state): State<Arc<ServerState>>,
    Json(request): Json<ImageRequest>,
) -> ApiResult<DefinitionResponse> {
    check_image_size(&state, &request.image)?;
    let image = request.image;
    let definition = run_blocking(move || extract_definition(&image))
        .await
        .map_err(api_error)?;
    Ok(Json(DefinitionResponse {
        success: true,
        definition,
    }))
}

async fn embed_handler(
    State(state): State<Arc<ServerState>>,
    Json(request): Json<EmbedRequest>,
) -> ApiResult<ImageResponse> {
    check_image_size(&state, &request.image)?;
    let EmbedRequest { image, definition } = request;
    let image = run_blocking(move || embed_definition(&image, &definition))
        .await
        .map_err(api_error)?;
    Ok(Json(ImageResponse {
        success: true,
        image,
    }))
}

async fn strip_handler(
    State(state): State<Arc<ServerState>>,
    Json(request): Json<ImageRequest>,
) -> ApiResult<ImageResponse> {
    check_image_size(&state, &request.image)?;
    let image = request.image;
    let image = run_blocking(move || strip_metadata(&image))
        .await
        .map_err(api_error)?;
    Ok(Json(ImageResponse {
        success: true,
        image,
    }))
}

async fn normalize_handler(
    State(state): State<Arc<ServerState>>,
    Json(request): Json<NormalizeRequest>,
) -> ApiResult<NormalizeResponse> {
    let options = NormalizeOptions {
        personality_to_creator_notes: request.personality_to_creator_notes,
    };
    if request.output_format == OutputFormat::Png {
        if let Some(uri) = request.avatar.as_deref() {
            check_image_size(&state, uri)?;
        }
    }

    let (card, tokens, png) = run_blocking(move || {
        let card = normalize_card(&request.definition, &options)?;
        let tokens = compute_token_counts(&card)?;
        let png = match request.output_format {
            OutputFormat::Json => None,
            OutputFormat::Png => {
                let avatar = request.avatar.as_deref().map(decode_data_uri).transpose()?;
                Some(create_card_png(&card, avatar.as_deref())?)
            }
        };
        Ok((card, tokens, png))
    })
    .await
    .map_err(api_error)?;
    let png_base64 = png.map(|png| BASE64.encode(png));

    Ok(Json(NormalizeResponse {
        success: true,
        card,
        tokens,
        png_base64,
    }))
}

async fn upload_handler(
    State(state): State<Arc<ServerState>>,
    Json(request): Json<UploadRequest>,
) -> ApiResult<UploadReport> {
    let options = NormalizeOptions {
        personality_to_creator_notes: request.personality_to_creator_notes,
    };
    info!(files = request.files.len(), "upload request");
    let report = state
        .library
        .upload(request.files, &options)
        .await
        .map_err(api_error)?;
    Ok(Json(report))
}

async fn download_handler(
    State(state): State<Arc<ServerState>>,
    Query(query): Query<IdQuery>,
) -> ApiResult<DownloadedCard> {
    let card = state.library.download(query.id).await.map_err(api_error)?;
    Ok(Json(card))
}

async fn get_definition_handler(
    State(state): State<Arc<ServerState>>,
    Query(query): Query<IdQuery>,
) -> ApiResult<DefinitionRecord> {
    let record = state.library.definition(query.id).await.map_err(api_error)?;
    Ok(Json(record))
}

async fn update_definition_handler(
    State(state): State<Arc<ServerState>>,
    Json(request): Json<UpdateDefinitionRequest>,
) -> ApiResult<SuccessResponse> {
    state
        .library
        .update_definition(request.id, &request.definition)
        .await
        .map_err(api_error)?;
    Ok(Json(SuccessResponse { success: true }))
}

async fn stats_handler(State(state): State<Arc<ServerState>>) -> ApiResult<LibraryStats> {
    let stats = state.library.library_stats().await.map_err(api_error)?;
    Ok(Json(stats))
}

async fn migrate_definitions_handler(
    State(state): State<Arc<ServerState>>,
) -> ApiResult<TaskResponse> {
    let inserted = state
        .library
        .insert_missing_definitions()
        .await
        .map_err(api_error)?;
    let counted = state
        .library
        .backfill_token_counts()
        .await
        .map_err(api_error)?;
    Ok(Json(TaskResponse {
        success: true,
        updated: inserted + counted,
    }))
}

async fn generate_embeddings_handler(
    State(state): State<Arc<ServerState>>,
) -> ApiResult<TaskResponse> {
    let updated = state
        .library
        .backfill_embeddings()
        .await
        .map_err(api_error)?;
    Ok(Json(TaskResponse {
        success: true,
        updated,
    }))
}

pub fn create_router(state: Arc<ServerState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let body_limit = state
        .max_image_bytes()
        .saturating_mul(4)
        .saturating_div(3)
        .saturating_mul(IMAGES_PER_REQUEST);
    let body_limit = usize::try_from(body_limit).unwrap_or(usize::MAX);

    Router::new()
        .route("/api/status", get(status_handler))
        .route("/api/stats", get(stats_handler))
        .route("/api/definition/extract", post(extract_handler))
        .route("/api/definition/embed", post(embed_handler))
        .route("/api/image/strip", post(strip_handler))
        .route("/api/cards/normalize", post(normalize_handler))
        .route("/api/cards/upload", post(upload_handler))
        .route("/api/cards/download", get(download_handler))
        .route(
            "/api/definitions",
            get(get_definition_handler).patch(update_definition_handler),
        )
        .route("/api/tasks/definitions/migrate", post(migrate_definitions_handler))
        .route("/api/tasks/embeddings/generate", post(generate_embeddings_handler))
        .layer(DefaultBodyLimit::max(body_limit))
        .with_state(state)
        .layer(cors)
}

/// Build the library over the on-disk image folder. Character ids continue
/// after the highest stored image so a restart never overwrites one.
async fn open_library(
    config: &Config,
    embedder: Arc<dyn EmbeddingProvider>,
) -> Result<CardLibrary, CharavaultError> {
    let objects = LocalObjectStore::new(&config.image_folder);
    let last_id = objects.highest_image_id(ImageVariant::Full).await?;
    if let Some(last_id) = last_id {
        info!(last_id, "continuing character ids after stored images");
    }

    Ok(CardLibrary::new(
        Arc::new(MemoryRepository::starting_after(last_id.unwrap_or(0))),
        Arc::new(objects),
        embedder,
        config.library.clone(),
    ))
}

pub async fn start_server(config: Config) -> Result<(), CharavaultError> {
    let embedder = Embedder::from_config(&config.embedding)?;
    let embedding_provider = embedder.name().to_string();

    let library = open_library(&config, Arc::new(embedder)).await?;

    let state = Arc::new(ServerState {
        port: config.port,
        library: Arc::new(library),
        embedding_provider,
    });
    let app = create_router(state);
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", config.port)).await?;

    info!(
        port = config.port,
        images = %config.image_folder.display(),
        "Charavault HTTP server listening"
    );
    axum::serve(listener, app).await?;
    Ok(())
}
