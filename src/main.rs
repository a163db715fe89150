mod http;
mod idempotency;
mod images;
mod jobs;
mod llm;
mod menu;
mod metrics;
mod models;
mod pipeline;
mod progress;
mod security;
mod supabase;

use axum::{
    Json, Router,
    extract::{DefaultBodyLimit, Extension, Multipart, Path, State},
    http::{HeaderMap, StatusCode, header},
    middleware,
    response::{
        IntoResponse, Response,
        sse::{Event, KeepAlive, Sse},
    },
    routing::{get, post},
};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use models::{ApiError, ImportOptions, MenuImportRequest, PipelineResult, UploadedImage};
use pipeline::{Pipeline, PipelineError, PipelineErrorKind};
use progress::{ProgressEvent, ProgressSink};
use security::{AuthContext, AuthState, require_api_auth};
use serde::Serialize;
use serde_json::json;
use std::{collections::HashMap, net::SocketAddr, sync::Arc};
use tokio::sync::Mutex;
use tokio_stream::{StreamExt, wrappers::ReceiverStream};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt};

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        error!(target = "carta.api", "server crashed: {err}");
    }
}

async fn run() -> eyre::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let auth_state = AuthState::from_env();
    let pipeline = Pipeline::from_env();
    let (queue, _worker) = jobs::JobQueue::spawn(pipeline.clone());
    let openapi_raw = include_str!("../docs/openapi.yaml");
    let openapi: serde_json::Value =
        serde_yaml::from_str(openapi_raw).unwrap_or(serde_json::json!({"openapi":"3.0.3"}));
    let prometheus_handle = PrometheusBuilder::new().install_recorder()?;
    let redis = std::env::var("REDIS_URL")
        .ok()
        .and_then(|u| redis::Client::open(u).ok());
    let state = AppState {
        pipeline,
        queue,
        openapi: Arc::new(openapi),
        idempotency: Arc::new(Mutex::new(HashMap::new())),
        prometheus_handle,
        redis,
    };

    let cors = CorsLayer::new()
        .allow_headers(Any)
        .allow_methods(Any)
        .allow_origin(Any);

    let protected = Router::new()
        .route("/menu/imports", post(import_menu_stream))
        .route("/menu/imports/sync", post(import_menu_sync))
        .nest(
            "/jobs",
            Router::new()
                .route("/menu-imports", post(enqueue_import_job))
                .route("/{id}", get(get_job_status)),
        )
        .route_layer(middleware::from_fn_with_state(auth_state, require_api_auth));

    let app = Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics_endpoint))
        .route("/openapi.json", get(openapi_json))
        .route("/docs", get(swagger_ui))
        .merge(protected)
        .with_state(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .layer(DefaultBodyLimit::max(body_limit_from_env()));

    let port: u16 = std::env::var("PORT")
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(8000);
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    info!(target = "carta.api", "listening on {addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app.into_make_service()).await?;
    Ok(())
}

#[derive(Clone)]
struct AppState {
    pipeline: Pipeline,
    queue: jobs::JobQueue,
    openapi: Arc<serde_json::Value>,
    idempotency: Arc<Mutex<HashMap<String, PipelineResult>>>,
    prometheus_handle: PrometheusHandle,
    redis: Option<redis::Client>,
}

/// Health and readiness check.
///
/// - Method: `GET`
/// - Path: `/health`
/// - Auth: none
async fn health() -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "service": "carta-api-rs",
    }))
}

async fn openapi_json(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, AppError> {
    if let Ok(key) = std::env::var("OPENAPI_KEY") {
        let presented = headers
            .get("X-Docs-Key")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if presented != key {
            return Err(AppError::Pipeline(PipelineError::invalid_input(
                "docs",
                "unauthorized",
            )));
        }
    }
    Ok(Json((*state.openapi).clone()))
}

async fn swagger_ui() -> axum::http::Response<String> {
    let html = r#"<!doctype html>
<html>
<head>
  <meta charset='utf-8'/>
  <title>Carta API Docs</title>
  <link rel="stylesheet" href="https://unpkg.com/swagger-ui-dist@5/swagger-ui.css" />
</head>
<body>
  <div id="swagger-ui"></div>
  <script src="https://unpkg.com/swagger-ui-dist@5/swagger-ui-bundle.js"></script>
  <script>
    window.onload = () => {
      window.ui = SwaggerUIBundle({ url: '/openapi.json', dom_id: '#swagger-ui' });
    };
  </script>
</body>
</html>"#;
    axum::http::Response::builder()
        .header("Content-Type", "text/html; charset=utf-8")
        .body(html.to_string())
        .unwrap()
}

fn body_limit_from_env() -> usize {
    std::env::var("REQUEST_MAX_BYTES")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(25 * 1024 * 1024)
}

async fn metrics_endpoint(State(state): State<AppState>, headers: HeaderMap) -> axum::http::Response<String> {
    if let Ok(secret) = std::env::var("METRICS_KEY") {
        let presented = headers
            .get("X-Metrics-Key")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if presented != secret {
            return axum::http::Response::builder()
                .status(StatusCode::UNAUTHORIZED)
                .body("unauthorized".into())
                .unwrap();
        }
    }
    let body = state.prometheus_handle.render();
    axum::http::Response::builder()
        .header("Content-Type", "text/plain; version=0.0.4")
        .body(body)
        .unwrap()
}

/// Read the multipart form into a pipeline request: `files` (repeatable)
/// plus the two image-sourcing flags, which are `"true"` or absent.
async fn read_import_request(mut multipart: Multipart) -> Result<MenuImportRequest, AppError> {
    let mut images = Vec::new();
    let mut options = ImportOptions::default();

    while let Some(field) = multipart.next_field().await.map_err(|err| {
        AppError::Pipeline(PipelineError::invalid_input(
            "receive",
            format!("multipart error: {err}"),
        ))
    })? {
        match field.name().unwrap_or_default() {
            "files" => {
                let content_type = field
                    .content_type()
                    .map(ToString::to_string)
                    .unwrap_or_else(|| "image/jpeg".to_string());
                let bytes = field.bytes().await.map_err(|err| {
                    AppError::Pipeline(PipelineError::invalid_input(
                        "receive",
                        format!("read error: {err}"),
                    ))
                })?;
                if !bytes.is_empty() {
                    images.push(UploadedImage {
                        bytes: bytes.to_vec(),
                        content_type,
                    });
                }
            }
            "searchWebImages" => {
                options.search_web_images = is_truthy(&field.text().await.unwrap_or_default());
            }
            "generateAIImages" => {
                options.generate_ai_images = is_truthy(&field.text().await.unwrap_or_default());
            }
            _ => {}
        }
    }

    Ok(MenuImportRequest { images, options })
}

fn is_truthy(value: &str) -> bool {
    value.trim().eq_ignore_ascii_case("true")
}

/// Run the menu import pipeline, streaming progress.
///
/// - Method: `POST`
/// - Path: `/menu/imports`
/// - Auth: `Authorization: Bearer <key>` or `X-Carta-Key: <key>`
/// - Body: multipart form (`files` ×N, `searchWebImages`, `generateAIImages`)
/// - Response: `text/event-stream` of progress events; `start` is first,
///   exactly one of `complete`/`error` is last.
async fn import_menu_stream(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
    multipart: Multipart,
) -> Result<impl IntoResponse, AppError> {
    crate::metrics::inc_requests("/menu/imports");
    info!(
        target = "carta.api",
        owner = %context.owner_id,
        api_key = %context.api_key_id,
        "menu import stream invoked",
    );

    let request = read_import_request(multipart).await?;
    let (sink, rx) = progress::channel(32);
    let pipeline = state.pipeline.clone();

    tokio::spawn(async move {
        match pipeline.run(request, Some(context), &sink).await {
            Ok(result) => sink.emit(ProgressEvent::Complete { result }).await,
            Err(err) => {
                sink.emit(ProgressEvent::Error {
                    message: err.detail().to_string(),
                    details: Some(err.stage().to_string()),
                })
                .await
            }
        }
        // Sender drops here and the stream closes after the terminal event.
    });

    let stream = ReceiverStream::new(rx).map(|event| Event::default().json_data(&event));
    Ok((
        [(header::CACHE_CONTROL, header::HeaderValue::from_static("no-cache"))],
        Sse::new(stream).keep_alive(KeepAlive::default()),
    ))
}

/// Non-streaming variant of the same pipeline; returns the terminal result
/// as one JSON document and honors `Idempotency-Key` replay.
///
/// - Method: `POST`
/// - Path: `/menu/imports/sync`
async fn import_menu_sync(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
    headers: HeaderMap,
    multipart: Multipart,
) -> Result<Json<PipelineResult>, AppError> {
    crate::metrics::inc_requests("/menu/imports/sync");
    info!(
        target = "carta.api",
        owner = %context.owner_id,
        api_key = %context.api_key_id,
        "menu import invoked",
    );

    let request = read_import_request(multipart).await?;

    if let Some(key) = headers
        .get("Idempotency-Key")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
    {
        if let Some(client) = &state.redis {
            if let Some(existing) = idempotency::redis_get(client, &key).await {
                return Ok(Json(existing));
            }
            let result = state
                .pipeline
                .run(request, Some(context), &ProgressSink::detached())
                .await?;
            let ttl = std::env::var("IDEMPOTENCY_TTL_SECS")
                .ok()
                .and_then(|v| v.parse::<usize>().ok())
                .unwrap_or(3600);
            idempotency::redis_set(client, &key, &result, ttl).await;
            return Ok(Json(result));
        }
        if let Some(existing) = state.idempotency.lock().await.get(&key).cloned() {
            return Ok(Json(existing));
        }
        let result = state
            .pipeline
            .run(request, Some(context), &ProgressSink::detached())
            .await?;
        state.idempotency.lock().await.insert(key, result.clone());
        return Ok(Json(result));
    }

    let result = state
        .pipeline
        .run(request, Some(context), &ProgressSink::detached())
        .await?;
    Ok(Json(result))
}

#[derive(Debug)]
enum AppError {
    Pipeline(PipelineError),
}

impl From<PipelineError> for AppError {
    fn from(value: PipelineError) -> Self {
        Self::Pipeline(value)
    }
}

#[derive(Debug, Serialize)]
struct EnqueueResponse {
    job_id: String,
}

async fn enqueue_import_job(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
    multipart: Multipart,
) -> Result<Json<EnqueueResponse>, AppError> {
    crate::metrics::inc_requests("/jobs/menu-imports");
    let request = read_import_request(multipart).await?;
    let id = state
        .queue
        .enqueue_import(request, context)
        .await
        .map_err(|err| AppError::Pipeline(PipelineError::internal("enqueue", err.error)))?;
    Ok(Json(EnqueueResponse {
        job_id: id.to_string(),
    }))
}

async fn get_job_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<jobs::JobInfo>, AppError> {
    let Ok(uuid) = uuid::Uuid::parse_str(&id) else {
        return Err(AppError::Pipeline(PipelineError::invalid_input(
            "jobs",
            "invalid_job_id",
        )));
    };
    if let Some(info) = state.queue.get(uuid).await {
        Ok(Json(info))
    } else {
        Err(AppError::Pipeline(PipelineError::invalid_input(
            "jobs",
            "not_found",
        )))
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        match self {
            AppError::Pipeline(err) => {
                let status = match err.kind() {
                    PipelineErrorKind::InvalidInput => StatusCode::BAD_REQUEST,
                    PipelineErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
                };
                let payload = ApiError {
                    error: err.stage().to_string(),
                    detail: Some(err.detail().to_string()),
                };
                (status, Json(payload)).into_response()
            }
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tower_http=debug"));
    let _ = fmt().with_env_filter(filter).try_init();
}
