//! Servicio de conocimiento: generación de la red, expansión de nodos y
//! explicaciones, todo a través de la pasarela de chat.
//!
//! Política ante respuestas no parseables:
//!   - generación: se degrada a un árbol mínimo que conserva el texto crudo;
//!   - expansión y explicación: se propaga el error al llamante.

use std::sync::Arc;

use tracing::{info, warn};

use crate::{
    llm::{ChatGateway, ChatRequest, LlmError, LlmProvider},
    models::KnowledgeNode,
};

const TRUNCATION_SUFFIX: &str = "...(内容已截断)";
const FALLBACK_SUMMARY_CHARS: usize = 200;
const FALLBACK_DETAIL_CHARS: usize = 500;
const TEMPERATURE: f64 = 0.7;

const GENERATE_SYSTEM_PROMPT: &str = "你是一个专业的教育内容分析助手，擅长将课件内容结构化为知识网络。";
const EXPAND_SYSTEM_PROMPT: &str = "你是教育内容分析助手。";
const EXPLAIN_SYSTEM_PROMPT: &str = "你是专业教育辅导老师，精通Markdown和LaTeX。";

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("Se necesita texto o un tema para generar la red de conocimiento")]
    MissingInput,
    #[error(transparent)]
    Llm(#[from] LlmError),
    #[error("La respuesta del LLM no es un nodo JSON válido: {0}")]
    InvalidResponse(#[source] serde_json::Error),
}

/// Parámetros de una generación ya validados.
#[derive(Debug, Clone, Default)]
pub struct GenerateParams {
    pub text: Option<String>,
    pub topic: Option<String>,
    pub expected_time: Option<String>,
}

impl GenerateParams {
    /// `true` si hay texto o tema con los que generar.
    pub fn has_input(&self) -> bool {
        effective_content(self).is_some()
    }
}

#[derive(Clone)]
pub struct KnowledgeService {
    gateway: Arc<dyn ChatGateway>,
    default_model: LlmProvider,
    max_content_chars: usize,
}

impl KnowledgeService {
    pub fn new(gateway: Arc<dyn ChatGateway>, default_model: LlmProvider, max_content_chars: usize) -> Self {
        Self {
            gateway,
            default_model,
            max_content_chars,
        }
    }

    pub fn default_model(&self) -> LlmProvider {
        self.default_model
    }

    /// Genera un árbol de 2-3 niveles a partir de texto libre o de un tema.
    pub async fn generate_knowledge_network(
        &self,
        params: &GenerateParams,
        model: LlmProvider,
    ) -> Result<KnowledgeNode, ServiceError> {
        let content = effective_content(params).ok_or(ServiceError::MissingInput)?;
        let content = truncate_content(&content, self.max_content_chars);

        let mut context_info = String::new();
        if let Some(topic) = non_blank(params.topic.as_deref()) {
            context_info.push_str(&format!("学习主题：{topic}\n"));
        }
        if let Some(hours) = non_blank(params.expected_time.as_deref()) {
            context_info.push_str(&format!("预计学习时间：{hours}小时\n"));
        }

        let prompt = format!(
            r#"请将以下课件内容分析并生成一个3级知识网络结构。
{context_info}
要求：
1. 第1级：识别核心知识点（2-5个）
2. 第2级：为每个核心知识点找出2-4个子知识点
3. 第3级：为每个子知识点细分2-3个更具体的知识点
4. 为每个知识点提供简洁的摘要（15-40字）
5. 严格按照JSON格式返回：{{"title": "...", "summary": "...", "children": [...]}}

课件内容：
{content}

请直接返回JSON格式，不要包含代码块标记。"#
        );

        let raw = self
            .complete(model, GENERATE_SYSTEM_PROMPT, &prompt)
            .await?;

        match parse_node(&raw) {
            Ok(node) => {
                info!(
                    "Red de conocimiento generada con {model}: '{}' ({} nodos)",
                    node.title,
                    node.node_count()
                );
                Ok(node)
            }
            Err(e) => {
                warn!("No se pudo parsear la red generada ({e}). Se devuelve el árbol degradado.");
                Ok(fallback_network(&raw))
            }
        }
    }

    /// Genera 3-5 hijos para un nodo. El título y el resumen del resultado
    /// son siempre los de la petición.
    pub async fn expand_node(
        &self,
        title: &str,
        summary: Option<&str>,
        model: LlmProvider,
    ) -> Result<KnowledgeNode, ServiceError> {
        let summary = summary.unwrap_or_default();
        let summary_line = if summary.is_empty() {
            String::new()
        } else {
            format!("摘要：{summary}")
        };
        let prompt = format!(
            r#"请为以下知识点生成3-5个子知识点。
知识点：{title}
{summary_line}

JSON格式：
{{"title": "{title}", "summary": "{summary}", "children": [{{"title": "子知识点1", "summary": "说明", "children": []}}]}}"#
        );

        let raw = self.complete(model, EXPAND_SYSTEM_PROMPT, &prompt).await?;
        let mut node = parse_node(&raw).map_err(|e| {
            warn!("Expansión de '{title}' con respuesta no parseable: {e}");
            ServiceError::InvalidResponse(e)
        })?;

        node.title = title.to_string();
        node.summary = summary.to_string();
        node.expanded = true;
        info!("Nodo '{title}' expandido con {} hijos", node.children.len());
        Ok(node)
    }

    /// Explicación larga en Markdown de un nodo dentro de su ruta de estudio.
    pub async fn explain_node(
        &self,
        title: &str,
        summary: Option<&str>,
        context_path: Option<&str>,
        model: LlmProvider,
    ) -> Result<String, ServiceError> {
        let summary_line = non_blank(summary)
            .map(|s| format!("摘要：{s}"))
            .unwrap_or_default();
        let context_line = non_blank(context_path)
            .map(|c| format!("\n学习路径：{c}"))
            .unwrap_or_default();
        let prompt = format!(
            "请详细解释以下知识点：\n{title}\n{summary_line}{context_line}\n\n\
             使用Markdown格式，数学公式用LaTeX（$...$和$$...$$）。\n\
             包含：核心概念、详细说明、实例、关键要点。"
        );

        self.complete(model, EXPLAIN_SYSTEM_PROMPT, &prompt).await
    }

    async fn complete(&self, model: LlmProvider, system: &str, prompt: &str) -> Result<String, ServiceError> {
        let request = ChatRequest {
            system,
            prompt,
            temperature: TEMPERATURE,
        };
        Ok(self.gateway.complete(model, request).await?)
    }
}

/// Texto a enviar: el contenido si lo hay; si no, el tema.
fn effective_content(params: &GenerateParams) -> Option<String> {
    if let Some(text) = non_blank(params.text.as_deref()) {
        return Some(text.to_string());
    }
    non_blank(params.topic.as_deref()).map(|topic| format!("主题：{topic}"))
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

/// Corta a `max_chars` caracteres (no bytes) y marca el corte.
pub fn truncate_content(content: &str, max_chars: usize) -> String {
    match content.char_indices().nth(max_chars) {
        Some((byte_index, _)) => format!("{}{}", &content[..byte_index], TRUNCATION_SUFFIX),
        None => content.to_string(),
    }
}

/// Limpia las marcas de bloque de código y parsea el nodo. Si falla, reintenta
/// con el tramo entre la primera `{` y la última `}`.
pub fn parse_node(raw: &str) -> Result<KnowledgeNode, serde_json::Error> {
    let cleaned = strip_code_fences(raw);
    match serde_json::from_str::<KnowledgeNode>(&cleaned) {
        Ok(node) => Ok(node),
        Err(first_error) => match (cleaned.find('{'), cleaned.rfind('}')) {
            (Some(start), Some(end)) if start < end => {
                serde_json::from_str(&cleaned[start..=end]).map_err(|_| first_error)
            }
            _ => Err(first_error),
        },
    }
}

fn strip_code_fences(raw: &str) -> String {
    raw.replace("```json", "").replace("```", "").trim().to_string()
}

/// Árbol mínimo que conserva la respuesta cruda del LLM.
fn fallback_network(raw: &str) -> KnowledgeNode {
    let prefix = |n: usize| raw.chars().take(n).collect::<String>();
    let summary = Some(prefix(FALLBACK_SUMMARY_CHARS))
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "内容分析结果".to_string());
    let detail = Some(prefix(FALLBACK_DETAIL_CHARS))
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "请查看完整内容".to_string());

    let mut result = KnowledgeNode::new("分析结果", detail);
    result.expanded = true;
    KnowledgeNode::new("知识网络", summary).with_children(vec![result])
}
