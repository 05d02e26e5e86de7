//! Cliente HTTP del servidor de redes de conocimiento.
//!
//! Sirve como `NodeExpander`, así una sesión de exploración puede trabajar
//! contra un servidor remoto igual que contra el servicio en proceso.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use reqwest::Response;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::debug;
use url::Url;

use crate::api::{AskPayload, AskResponse, ExpandPayload, ExpandResponse, GeneratePayload, GenerateResponse, TaskCreated};
use crate::llm::LlmProvider;
use crate::models::KnowledgeNode;
use crate::tasks::{TaskResult, TaskState, TaskStatus};
use crate::upload::UploadedDocument;

use super::NodeExpander;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("URL base inválida: {0}")]
    InvalidBaseUrl(#[from] url::ParseError),
    #[error("Error HTTP: {0}")]
    Http(#[from] reqwest::Error),
    #[error("El servidor respondió {status} ({code}): {message}")]
    Api {
        status: u16,
        code: String,
        message: String,
    },
    #[error("La tarea {task_id} falló: {message}")]
    TaskFailed { task_id: String, message: String },
    #[error("La tarea {0} terminó con un resultado inesperado")]
    UnexpectedResult(String),
}

#[derive(Deserialize)]
struct ErrorBody {
    #[serde(default)]
    error: String,
    #[serde(default)]
    code: String,
}

#[derive(Debug, Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    base_url: Url,
    model: Option<LlmProvider>,
    poll_interval: Duration,
}

impl ApiClient {
    pub fn new(base_url: &str) -> Result<Self, ClientError> {
        Ok(Self {
            http: reqwest::Client::new(),
            base_url: Url::parse(base_url)?,
            model: None,
            poll_interval: DEFAULT_POLL_INTERVAL,
        })
    }

    /// Modelo a pedir cuando la petición no indica ninguno.
    pub fn with_model(mut self, model: LlmProvider) -> Self {
        self.model = Some(model);
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub async fn upload(&self, file_name: &str, bytes: Vec<u8>) -> Result<UploadedDocument, ClientError> {
        let form = Form::new().part("file", Part::bytes(bytes).file_name(file_name.to_string()));
        let response = self.http.post(self.endpoint("api/upload")?).multipart(form).send().await?;
        read_json(response).await
    }

    /// Lanza la generación en segundo plano y devuelve el id de la tarea.
    pub async fn submit(&self, payload: GeneratePayload) -> Result<String, ClientError> {
        let payload = self.with_default_model(payload);
        let response = self.http.post(self.endpoint("api/process")?).json(&payload).send().await?;
        let created: TaskCreated = read_json(response).await?;
        debug!("Tarea {} enviada", created.task_id);
        Ok(created.task_id)
    }

    /// Generación síncrona.
    pub async fn generate(&self, payload: GeneratePayload) -> Result<GenerateResponse, ClientError> {
        let payload = self.with_default_model(payload);
        let response = self.http.post(self.endpoint("api/generate")?).json(&payload).send().await?;
        read_json(response).await
    }

    pub async fn status(&self, task_id: &str) -> Result<TaskStatus, ClientError> {
        let response = self
            .http
            .get(self.endpoint(&format!("api/status/{task_id}"))?)
            .send()
            .await?;
        read_json(response).await
    }

    /// Consulta el estado cada `poll_interval` hasta que la tarea termine.
    pub async fn wait_for(&self, task_id: &str) -> Result<TaskResult, ClientError> {
        loop {
            let status = self.status(task_id).await?;
            match status.status {
                TaskState::Completed => {
                    return status
                        .result
                        .ok_or_else(|| ClientError::UnexpectedResult(task_id.to_string()));
                }
                TaskState::Failed => {
                    return Err(ClientError::TaskFailed {
                        task_id: task_id.to_string(),
                        message: status.error.unwrap_or_default(),
                    });
                }
                TaskState::Processing => tokio::time::sleep(self.poll_interval).await,
            }
        }
    }

    pub async fn generate_and_wait(&self, payload: GeneratePayload) -> Result<KnowledgeNode, ClientError> {
        let task_id = self.submit(payload).await?;
        match self.wait_for(&task_id).await? {
            TaskResult::Node(node) => Ok(node),
            TaskResult::Explanation { .. } => Err(ClientError::UnexpectedResult(task_id)),
        }
    }

    pub async fn expand_node(&self, title: &str, summary: Option<&str>) -> Result<KnowledgeNode, ClientError> {
        let payload = ExpandPayload {
            node_title: Some(title.to_string()),
            node_summary: summary.map(str::to_string),
            model: self.model.map(|m| m.to_string()),
        };
        let response = self
            .http
            .post(self.endpoint("api/expand-node")?)
            .json(&payload)
            .send()
            .await?;
        let expanded: ExpandResponse = read_json(response).await?;
        Ok(expanded.result)
    }

    pub async fn ask_ai(
        &self,
        title: &str,
        summary: Option<&str>,
        context: Option<&str>,
    ) -> Result<String, ClientError> {
        let payload = AskPayload {
            node_title: Some(title.to_string()),
            node_summary: summary.map(str::to_string),
            context: context.map(str::to_string),
            model: self.model.map(|m| m.to_string()),
        };
        let response = self.http.post(self.endpoint("api/ask-ai")?).json(&payload).send().await?;
        let answer: AskResponse = read_json(response).await?;
        Ok(answer.explanation)
    }

    fn with_default_model(&self, mut payload: GeneratePayload) -> GeneratePayload {
        if payload.model.is_none() {
            payload.model = self.model.map(|m| m.to_string());
        }
        payload
    }

    fn endpoint(&self, path: &str) -> Result<Url, ClientError> {
        let base = self.base_url.as_str().trim_end_matches('/');
        Ok(Url::parse(&format!("{base}/{path}"))?)
    }
}

async fn read_json<T: DeserializeOwned>(response: Response) -> Result<T, ClientError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response.json().await?);
    }

    let text = response.text().await.unwrap_or_default();
    let body = serde_json::from_str::<ErrorBody>(&text).unwrap_or(ErrorBody {
        error: text,
        code: String::new(),
    });
    Err(ClientError::Api {
        status: status.as_u16(),
        code: body.code,
        message: body.error,
    })
}

#[async_trait]
impl NodeExpander for ApiClient {
    async fn expand(&self, node: &KnowledgeNode) -> anyhow::Result<Vec<KnowledgeNode>> {
        let expanded = self.expand_node(&node.title, Some(&node.summary)).await?;
        Ok(expanded.children)
    }

    async fn explain(&self, node: &KnowledgeNode, context_path: &str) -> anyhow::Result<String> {
        Ok(self
            .ask_ai(&node.title, Some(&node.summary), Some(context_path))
            .await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use tokio_test::assert_ok;

    use crate::api::create_router;
    use crate::explorer::{Explorer, ExplorerSettings};
    use crate::testing::{test_state, ScriptedGateway};

    async fn spawn_server(gateway: Arc<ScriptedGateway>) -> ApiClient {
        let app = create_router(test_state(gateway));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        ApiClient::new(&format!("http://{addr}"))
            .unwrap()
            .with_poll_interval(Duration::from_millis(10))
    }

    #[tokio::test]
    async fn generate_and_wait_polls_until_completed() {
        let client = spawn_server(Arc::new(ScriptedGateway::new([
            r#"{"title":"数据结构","summary":"基础","children":[{"title":"栈"},{"title":"队列"}]}"#,
        ])))
        .await;

        let payload = GeneratePayload {
            topic: Some("数据结构".into()),
            ..Default::default()
        };
        let node = assert_ok!(client.generate_and_wait(payload).await);
        assert_eq!(node.title, "数据结构");
        assert_eq!(node.children.len(), 2);
    }

    #[tokio::test]
    async fn failed_task_surfaces_its_error() {
        let client = spawn_server(Arc::new(ScriptedGateway::failing())).await;
        let payload = GeneratePayload {
            text: Some("内容".into()),
            ..Default::default()
        };
        match client.generate_and_wait(payload).await {
            Err(ClientError::TaskFailed { message, .. }) => assert!(message.contains("conexión rechazada")),
            other => panic!("respuesta inesperada: {other:?}"),
        }
    }

    #[tokio::test]
    async fn api_errors_carry_status_and_code() {
        let client = spawn_server(Arc::new(ScriptedGateway::new(Vec::<&str>::new()))).await;

        match client.status("desconocida").await {
            Err(ClientError::Api { status, code, .. }) => {
                assert_eq!(status, 404);
                assert_eq!(code, "TASK_NOT_FOUND");
            }
            other => panic!("respuesta inesperada: {other:?}"),
        }

        match client.expand_node("  ", None).await {
            Err(ClientError::Api { code, .. }) => assert_eq!(code, "MISSING_NODE_TITLE"),
            other => panic!("respuesta inesperada: {other:?}"),
        }
    }

    #[tokio::test]
    async fn upload_and_ask() {
        let client = spawn_server(Arc::new(ScriptedGateway::new(["**栈** 是后进先出的结构。"]))).await;

        let document = assert_ok!(client.upload("apuntes.txt", "栈与队列".as_bytes().to_vec()).await);
        assert_eq!(document.text, "栈与队列");
        assert_eq!(document.file_size, "栈与队列".len());

        let answer = assert_ok!(client.ask_ai("栈", None, Some("数据结构 > 栈")).await);
        assert!(answer.contains("后进先出"));
    }

    #[tokio::test]
    async fn explorer_runs_against_remote_server() {
        let client = spawn_server(Arc::new(ScriptedGateway::new([
            r#"{"title":"x","children":[{"title":"入栈"},{"title":"出栈"},{"title":"栈顶"}]}"#,
        ])))
        .await;

        let root = KnowledgeNode::new("数据结构", "").with_children(vec![KnowledgeNode::new("栈", "后进先出")]);
        let settings = ExplorerSettings {
            preload_depth_threshold: 1,
            ..ExplorerSettings::default()
        };
        let mut explorer = Explorer::new(root, Arc::new(client), settings);

        let stack = explorer.current().children[0].clone();
        explorer.enter_child(&stack).await.unwrap();

        assert_eq!(explorer.breadcrumb(), vec!["数据结构".to_string(), "栈".to_string()]);
        assert_eq!(explorer.current().summary, "后进先出");
        assert_eq!(explorer.current().children.len(), 3);
        assert_eq!(explorer.root().children[0].children[1].title, "出栈");
    }
}
