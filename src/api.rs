use axum::{
    extract::{multipart::MultipartError, DefaultBodyLimit, Json, Multipart, Path, Request, State},
    http::{Method, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{json, Value};
use tokio::spawn;
use tower_http::{
    cors::{Any, CorsLayer},
    services::ServeDir,
};
use tracing::{error, info};

use crate::{
    app_state::AppState,
    error::ApiError,
    knowledge::{GenerateParams, ServiceError},
    llm::{LlmError, LlmProvider},
    models::KnowledgeNode,
    tasks::{TaskResult, TaskStatus},
    upload::{self, UploadedDocument},
};

/// Margen para las cabeceras multipart sobre el tamaño máximo del fichero.
const MULTIPART_OVERHEAD: usize = 64 * 1024;

// --- Payloads y Respuestas de la API ---

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeneratePayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,
    // El frontend manda horas como número o como cadena.
    #[serde(default, deserialize_with = "string_or_number", skip_serializing_if = "Option::is_none")]
    pub expected_time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

impl GeneratePayload {
    fn into_params(self) -> GenerateParams {
        GenerateParams {
            text: self.text,
            topic: self.topic,
            expected_time: self.expected_time,
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExpandPayload {
    #[serde(default)]
    pub node_title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_summary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AskPayload {
    #[serde(default)]
    pub node_title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_summary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskCreated {
    pub task_id: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateResponse {
    pub task_id: String,
    pub result: KnowledgeNode,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ExpandResponse {
    pub result: KnowledgeNode,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AskResponse {
    pub task_id: String,
    pub explanation: String,
}

// --- Router ---

pub fn create_router(app_state: AppState) -> Router {
    let upload_limit = app_state.config.max_upload_bytes + MULTIPART_OVERHEAD;

    Router::new()
        .route(
            "/api/upload",
            post(upload_handler).layer(DefaultBodyLimit::max(upload_limit)),
        )
        .route("/api/process", post(process_handler))
        .route("/api/generate", post(generate_handler))
        .route("/api/status/:task_id", get(status_handler))
        .route("/api/expand-node", post(expand_node_handler))
        .route("/api/ask-ai", post(ask_ai_handler))
        .route("/health", get(health_handler))
        .with_state(app_state)
}

/// Router completo: API, frontend estático como fallback, `OPTIONS` y CORS.
pub fn build_app(app_state: AppState) -> Router {
    let static_dir = app_state.config.static_dir.clone();

    create_router(app_state)
        .fallback_service(ServeDir::new(static_dir))
        .layer(middleware::from_fn(answer_preflight))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
}

// Cualquier OPTIONS responde 200, en cualquier ruta.
async fn answer_preflight(request: Request, next: Next) -> Response {
    if request.method() == Method::OPTIONS {
        return StatusCode::OK.into_response();
    }
    next.run(request).await
}

// --- Handlers ---

#[axum::debug_handler]
async fn health_handler() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

#[axum::debug_handler]
async fn upload_handler(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<UploadedDocument>, ApiError> {
    let max_bytes = state.config.max_upload_bytes;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| multipart_error(e, max_bytes))?
    {
        if field.name() != Some("file") {
            continue;
        }
        let file_name = field.file_name().unwrap_or_default().to_string();
        let bytes = field.bytes().await.map_err(|e| multipart_error(e, max_bytes))?;
        if bytes.len() > max_bytes {
            return Err(ApiError::FileTooLarge { max_bytes });
        }

        let document = upload::process_upload(file_name, bytes.to_vec()).await?;
        return Ok(Json(document));
    }

    Err(ApiError::NoFile)
}

fn multipart_error(e: MultipartError, max_bytes: usize) -> ApiError {
    if e.status() == StatusCode::PAYLOAD_TOO_LARGE {
        ApiError::FileTooLarge { max_bytes }
    } else {
        ApiError::BadRequest(e.body_text())
    }
}

#[axum::debug_handler]
async fn process_handler(
    State(state): State<AppState>,
    Json(payload): Json<GeneratePayload>,
) -> Result<Json<TaskCreated>, ApiError> {
    let model = resolve_model(&state, payload.model.as_deref())?;
    let params = payload.into_params();
    if !params.has_input() {
        return Err(ServiceError::MissingInput.into());
    }

    let task_id = state.tasks.create();
    info!("Tarea {task_id}: generando red de conocimiento con {model}");

    let tasks = state.tasks.clone();
    let knowledge = state.knowledge.clone();
    let id = task_id.clone();
    spawn(async move {
        tasks.set_progress(&id, 10);
        match knowledge.generate_knowledge_network(&params, model).await {
            Ok(node) => {
                tasks.complete(&id, TaskResult::Node(node));
                info!("✅ Tarea {id} completada");
            }
            Err(e) => {
                error!("Tarea {id} fallida: {e}");
                tasks.fail(&id, e.to_string());
            }
        }
    });

    Ok(Json(TaskCreated { task_id }))
}

#[axum::debug_handler]
async fn generate_handler(
    State(state): State<AppState>,
    Json(payload): Json<GeneratePayload>,
) -> Result<Json<GenerateResponse>, ApiError> {
    let model = resolve_model(&state, payload.model.as_deref())?;
    let params = payload.into_params();
    if !params.has_input() {
        return Err(ServiceError::MissingInput.into());
    }

    let task_id = state.tasks.create();
    match state.knowledge.generate_knowledge_network(&params, model).await {
        Ok(result) => {
            state.tasks.complete(&task_id, TaskResult::Node(result.clone()));
            Ok(Json(GenerateResponse { task_id, result }))
        }
        Err(e) => {
            state.tasks.fail(&task_id, e.to_string());
            Err(e.into())
        }
    }
}

#[axum::debug_handler]
async fn status_handler(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> Result<Json<TaskStatus>, ApiError> {
    state
        .tasks
        .get(&task_id)
        .map(Json)
        .ok_or(ApiError::TaskNotFound(task_id))
}

#[axum::debug_handler]
async fn expand_node_handler(
    State(state): State<AppState>,
    Json(payload): Json<ExpandPayload>,
) -> Result<Json<ExpandResponse>, ApiError> {
    let title = required_title(payload.node_title.as_deref())?;
    let model = resolve_model(&state, payload.model.as_deref())?;

    let result = state
        .knowledge
        .expand_node(title, payload.node_summary.as_deref(), model)
        .await?;
    Ok(Json(ExpandResponse { result }))
}

#[axum::debug_handler]
async fn ask_ai_handler(
    State(state): State<AppState>,
    Json(payload): Json<AskPayload>,
) -> Result<Json<AskResponse>, ApiError> {
    let title = required_title(payload.node_title.as_deref())?;
    let model = resolve_model(&state, payload.model.as_deref())?;

    let task_id = state.tasks.create();
    let explanation = state
        .knowledge
        .explain_node(
            title,
            payload.node_summary.as_deref(),
            payload.context.as_deref(),
            model,
        )
        .await;

    match explanation {
        Ok(explanation) => {
            state.tasks.complete(
                &task_id,
                TaskResult::Explanation {
                    explanation: explanation.clone(),
                },
            );
            Ok(Json(AskResponse { task_id, explanation }))
        }
        Err(e) => {
            state.tasks.fail(&task_id, e.to_string());
            Err(e.into())
        }
    }
}

// --- Funciones Auxiliares ---

fn required_title(title: Option<&str>) -> Result<&str, ApiError> {
    title
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .ok_or(ApiError::MissingNodeTitle)
}

/// Modelo pedido o el de por defecto. Un nombre desconocido es un 400, igual
/// que un proveedor sin clave configurada.
fn resolve_model(state: &AppState, requested: Option<&str>) -> Result<LlmProvider, ApiError> {
    let Some(name) = requested.map(str::trim).filter(|m| !m.is_empty()) else {
        return Ok(state.config.default_model);
    };
    let provider = name
        .parse::<LlmProvider>()
        .map_err(|_| ApiError::UnsupportedModel(name.to_string()))?;
    if !state.config.has_key_for(provider) {
        return Err(ServiceError::Llm(LlmError::MissingApiKey(provider)).into());
    }
    Ok(provider)
}

fn string_or_number<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<Value>::deserialize(deserializer)? {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s)),
        Some(Value::Number(n)) => Ok(Some(n.to_string())),
        Some(other) => Err(serde::de::Error::custom(format!(
            "expectedTime debe ser número o cadena, no {other}"
        ))),
    }
}
