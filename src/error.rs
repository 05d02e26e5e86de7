//! Errores de la API HTTP y su traducción a `{error, code}`.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use tracing::{error, warn};

use crate::knowledge::ServiceError;
use crate::llm::LlmError;
use crate::upload::UploadError;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("No se ha recibido ningún fichero (campo 'file')")]
    NoFile,
    #[error("El fichero supera el tamaño máximo de {max_bytes} bytes")]
    FileTooLarge { max_bytes: usize },
    #[error("Falta el título del nodo")]
    MissingNodeTitle,
    #[error("Modelo no soportado: '{0}'")]
    UnsupportedModel(String),
    #[error("Tarea '{0}' no encontrada")]
    TaskNotFound(String),
    #[error("Petición inválida: {0}")]
    BadRequest(String),
    #[error(transparent)]
    Upload(#[from] UploadError),
    #[error(transparent)]
    Service(#[from] ServiceError),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::NoFile | Self::MissingNodeTitle | Self::UnsupportedModel(_) | Self::BadRequest(_) => {
                StatusCode::BAD_REQUEST
            }
            Self::FileTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            Self::TaskNotFound(_) => StatusCode::NOT_FOUND,
            Self::Upload(UploadError::UnsupportedType(_)) => StatusCode::BAD_REQUEST,
            Self::Upload(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Self::Service(ServiceError::MissingInput) => StatusCode::BAD_REQUEST,
            Self::Service(ServiceError::Llm(LlmError::MissingApiKey(_))) => StatusCode::BAD_REQUEST,
            Self::Service(_) => StatusCode::BAD_GATEWAY,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::NoFile => "NO_FILE",
            Self::FileTooLarge { .. } => "FILE_TOO_LARGE",
            Self::MissingNodeTitle => "MISSING_NODE_TITLE",
            Self::UnsupportedModel(_) => "UNSUPPORTED_MODEL",
            Self::TaskNotFound(_) => "TASK_NOT_FOUND",
            Self::BadRequest(_) => "BAD_REQUEST",
            Self::Upload(UploadError::UnsupportedType(_)) => "UNSUPPORTED_FILE_TYPE",
            Self::Upload(_) => "EXTRACTION_FAILED",
            Self::Service(ServiceError::MissingInput) => "MISSING_INPUT",
            Self::Service(ServiceError::Llm(LlmError::MissingApiKey(_))) => "MODEL_NOT_CONFIGURED",
            Self::Service(ServiceError::Llm(_)) => "LLM_UNAVAILABLE",
            Self::Service(ServiceError::InvalidResponse(_)) => "INVALID_LLM_RESPONSE",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = match &self {
            Self::Internal(e) => {
                error!("Error interno: {e:#}");
                "Error interno del servidor".to_string()
            }
            other => {
                if status.is_server_error() {
                    warn!("{other}");
                }
                other.to_string()
            }
        };
        (status, Json(json!({ "error": message, "code": self.code() }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::LlmProvider;

    #[test]
    fn maps_errors_to_status_and_code() {
        let cases = [
            (ApiError::NoFile, StatusCode::BAD_REQUEST, "NO_FILE"),
            (
                ApiError::FileTooLarge { max_bytes: 10 },
                StatusCode::PAYLOAD_TOO_LARGE,
                "FILE_TOO_LARGE",
            ),
            (
                ApiError::Upload(UploadError::UnsupportedType("docx".into())),
                StatusCode::BAD_REQUEST,
                "UNSUPPORTED_FILE_TYPE",
            ),
            (
                ApiError::Upload(UploadError::InvalidUtf8),
                StatusCode::UNPROCESSABLE_ENTITY,
                "EXTRACTION_FAILED",
            ),
            (
                ApiError::Service(ServiceError::Llm(LlmError::EmptyResponse(LlmProvider::Doubao))),
                StatusCode::BAD_GATEWAY,
                "LLM_UNAVAILABLE",
            ),
            (
                ApiError::TaskNotFound("x".into()),
                StatusCode::NOT_FOUND,
                "TASK_NOT_FOUND",
            ),
        ];
        for (err, status, code) in cases {
            assert_eq!(err.status(), status);
            assert_eq!(err.code(), code);
        }
    }

    #[tokio::test]
    async fn internal_errors_hide_details() {
        let response = ApiError::Internal(anyhow::anyhow!("contraseña filtrada")).into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(body["code"], "INTERNAL_ERROR");
        assert!(!body["error"].as_str().unwrap().contains("contraseña"));
    }
}
