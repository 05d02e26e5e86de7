//! Abstracción sobre los proveedores de chat (DeepSeek vía Rig, Doubao vía
//! su API compatible con OpenAI).

use std::fmt;
use std::str::FromStr;

use anyhow::anyhow;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use url::Url;

use crate::config::AppConfig;

/// Proveedores de LLM soportados.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LlmProvider {
    #[default]
    DeepSeek,
    Doubao,
}

impl LlmProvider {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::DeepSeek => "deepseek",
            Self::Doubao => "doubao",
        }
    }
}

impl FromStr for LlmProvider {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "deepseek" => Ok(Self::DeepSeek),
            "doubao" => Ok(Self::Doubao),
            other => Err(anyhow!("Proveedor LLM no soportado: {other}")),
        }
    }
}

impl fmt::Display for LlmProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Petición de chat de un solo turno.
#[derive(Debug, Clone, Copy)]
pub struct ChatRequest<'a> {
    pub system: &'a str,
    pub prompt: &'a str,
    pub temperature: f64,
}

#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("Falta la clave de API para {0}")]
    MissingApiKey(LlmProvider),
    #[error("Error llamando a {provider}: {message}")]
    Upstream {
        provider: LlmProvider,
        message: String,
    },
    #[error("{0} devolvió una respuesta vacía")]
    EmptyResponse(LlmProvider),
}

/// Pasarela de chat. El resto de la aplicación sólo conoce este trait.
#[async_trait]
pub trait ChatGateway: Send + Sync {
    async fn complete(
        &self,
        provider: LlmProvider,
        request: ChatRequest<'_>,
    ) -> Result<String, LlmError>;
}

/// Gestor de LLMs.
#[derive(Debug, Clone)]
pub struct LlmManager {
    deepseek_model: String,
    deepseek_api_key: Option<String>,
    doubao: Option<DoubaoSettings>,
    http: reqwest::Client,
}

#[derive(Debug, Clone)]
struct DoubaoSettings {
    api_key: String,
    base_url: Url,
    model: String,
}

impl LlmManager {
    /// Construye el manager a partir de la configuración.
    pub fn from_config(cfg: &AppConfig) -> anyhow::Result<Self> {
        let doubao = cfg.doubao_api_key.as_ref().map(|api_key| DoubaoSettings {
            api_key: api_key.clone(),
            base_url: cfg.doubao_base_url.clone(),
            model: cfg.doubao_model.clone(),
        });

        Ok(Self {
            deepseek_model: cfg.deepseek_model.clone(),
            deepseek_api_key: cfg.deepseek_api_key.clone(),
            doubao,
            http: reqwest::Client::builder().build()?,
        })
    }

    // ---------------------------------------------------------------------
    // DEEPSEEK (Rig)
    // ---------------------------------------------------------------------

    async fn complete_with_deepseek(&self, request: ChatRequest<'_>) -> Result<String, LlmError> {
        use rig::client::CompletionClient as _;
        use rig::completion::Prompt;
        use rig::providers::deepseek;

        let api_key = self
            .deepseek_api_key
            .as_deref()
            .ok_or(LlmError::MissingApiKey(LlmProvider::DeepSeek))?;

        // La clave viene de la configuración ya validada, no del entorno.
        let client = deepseek::Client::new(api_key);

        let agent = client
            .agent(&self.deepseek_model)
            .preamble(request.system)
            .temperature(request.temperature)
            .build();

        agent
            .prompt(request.prompt)
            .await
            .map_err(|e| LlmError::Upstream {
                provider: LlmProvider::DeepSeek,
                message: e.to_string(),
            })
    }

    // ---------------------------------------------------------------------
    // DOUBAO (chat/completions compatible con OpenAI)
    // ---------------------------------------------------------------------

    async fn complete_with_doubao(&self, request: ChatRequest<'_>) -> Result<String, LlmError> {
        let settings = self
            .doubao
            .as_ref()
            .ok_or(LlmError::MissingApiKey(LlmProvider::Doubao))?;
        let upstream = |message: String| LlmError::Upstream {
            provider: LlmProvider::Doubao,
            message,
        };

        let endpoint = chat_completions_url(&settings.base_url);
        let body = ChatCompletionBody {
            model: &settings.model,
            messages: [
                ChatMessage { role: "system", content: request.system },
                ChatMessage { role: "user", content: request.prompt },
            ],
            temperature: request.temperature,
        };

        debug!("Llamando a Doubao en {endpoint}");
        let response = self
            .http
            .post(endpoint)
            .bearer_auth(&settings.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| upstream(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            warn!("Doubao respondió {status}: {detail}");
            return Err(upstream(format!("HTTP {status}: {detail}")));
        }

        let completion: ChatCompletionResponse =
            response.json().await.map_err(|e| upstream(e.to_string()))?;

        completion
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .filter(|content| !content.trim().is_empty())
            .ok_or(LlmError::EmptyResponse(LlmProvider::Doubao))
    }
}

#[async_trait]
impl ChatGateway for LlmManager {
    async fn complete(
        &self,
        provider: LlmProvider,
        request: ChatRequest<'_>,
    ) -> Result<String, LlmError> {
        match provider {
            LlmProvider::DeepSeek => self.complete_with_deepseek(request).await,
            LlmProvider::Doubao => self.complete_with_doubao(request).await,
        }
    }
}

fn chat_completions_url(base_url: &Url) -> String {
    format!("{}/chat/completions", base_url.as_str().trim_end_matches('/'))
}

#[derive(Serialize)]
struct ChatCompletionBody<'a> {
    model: &'a str,
    messages: [ChatMessage<'a>; 2],
    temperature: f64,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatCompletionResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Deserialize)]
struct ChatChoiceMessage {
    content: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_names_round_trip() {
        assert_eq!("DeepSeek".parse::<LlmProvider>().unwrap(), LlmProvider::DeepSeek);
        assert_eq!(" doubao ".parse::<LlmProvider>().unwrap(), LlmProvider::Doubao);
        assert!("gpt-4o".parse::<LlmProvider>().is_err());
        assert_eq!(LlmProvider::Doubao.to_string(), "doubao");
    }

    #[test]
    fn completions_url_ignores_trailing_slash() {
        let with_slash = Url::parse("https://ark.cn-beijing.volces.com/api/v3/").unwrap();
        let without = Url::parse("https://ark.cn-beijing.volces.com/api/v3").unwrap();
        assert_eq!(chat_completions_url(&with_slash), chat_completions_url(&without));
        assert!(chat_completions_url(&without).ends_with("/api/v3/chat/completions"));
    }

    fn config(pairs: &[(&str, &str)]) -> AppConfig {
        AppConfig::from_lookup(|key| {
            pairs
                .iter()
                .find(|(k, _)| *k == key)
                .map(|(_, v)| v.to_string())
        })
        .unwrap()
    }

    #[test]
    fn deepseek_key_comes_from_config() {
        let manager = LlmManager::from_config(&config(&[("DEEPSEEK_API_KEY", "  sk-desde-config  ")])).unwrap();
        assert_eq!(manager.deepseek_api_key.as_deref(), Some("sk-desde-config"));
    }

    #[tokio::test]
    async fn missing_deepseek_key_is_an_error_not_a_panic() {
        let manager = LlmManager::from_config(&config(&[
            ("DEFAULT_MODEL", "doubao"),
            ("DOUBAO_API_KEY", "db-key"),
        ]))
        .unwrap();
        let request = ChatRequest {
            system: "sys",
            prompt: "hola",
            temperature: 0.7,
        };

        let err = manager.complete(LlmProvider::DeepSeek, request).await.unwrap_err();
        assert!(matches!(err, LlmError::MissingApiKey(LlmProvider::DeepSeek)));
    }

    #[test]
    fn completion_response_tolerates_missing_content() {
        let parsed: ChatCompletionResponse =
            serde_json::from_str(r#"{"choices":[{"message":{"role":"assistant"}}]}"#).unwrap();
        assert!(parsed.choices[0].message.content.is_none());
    }
}
