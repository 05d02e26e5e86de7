//! Carga y gestión de configuración de la aplicación (servidor + LLM).

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use url::Url;

use crate::llm::LlmProvider;

pub const DEFAULT_MAX_UPLOAD_BYTES: usize = 4 * 1024 * 1024;
pub const DEFAULT_MAX_CONTENT_CHARS: usize = 8000;
pub const DEFAULT_TASK_TTL_SECS: u64 = 3600;

/// Configuración completa de la aplicación.
#[derive(Clone, Debug)]
pub struct AppConfig {
    pub server_addr: String,
    pub static_dir: PathBuf,
    pub open_browser: bool,

    pub default_model: LlmProvider,
    pub deepseek_api_key: Option<String>,
    pub deepseek_model: String,
    pub doubao_api_key: Option<String>,
    pub doubao_base_url: Url,
    pub doubao_model: String,

    pub max_upload_bytes: usize,
    pub max_content_chars: usize,
    pub task_ttl: Duration,
}

impl AppConfig {
    /// Carga la configuración desde variables de entorno (usando .env si existe).
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Igual que `from_env`, pero leyendo de cualquier fuente clave → valor.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let server_addr = var("SERVER_ADDR").unwrap_or_else(|| "127.0.0.1:3000".to_string());
        let static_dir = PathBuf::from(var("STATIC_DIR").unwrap_or_else(|| "frontend".to_string()));
        let open_browser = parse_bool(var("OPEN_BROWSER").as_deref())?;

        let default_model = var("DEFAULT_MODEL")
            .as_deref()
            .unwrap_or("deepseek")
            .parse::<LlmProvider>()?;

        let deepseek_api_key = var("DEEPSEEK_API_KEY");
        let deepseek_model = var("DEEPSEEK_MODEL").unwrap_or_else(|| "deepseek-chat".to_string());

        let doubao_api_key = var("DOUBAO_API_KEY");
        let doubao_base_url = var("DOUBAO_BASE_URL")
            .unwrap_or_else(|| "https://ark.cn-beijing.volces.com/api/v3".to_string());
        let doubao_base_url = Url::parse(&doubao_base_url)
            .with_context(|| format!("DOUBAO_BASE_URL no es una URL válida: {doubao_base_url}"))?;
        let doubao_model =
            var("DOUBAO_MODEL").unwrap_or_else(|| "doubao-seed-1-6-251015".to_string());

        let max_upload_bytes = parse_number(var("MAX_UPLOAD_BYTES"), DEFAULT_MAX_UPLOAD_BYTES, "MAX_UPLOAD_BYTES")?;
        let max_content_chars =
            parse_number(var("MAX_CONTENT_CHARS"), DEFAULT_MAX_CONTENT_CHARS, "MAX_CONTENT_CHARS")?;
        let task_ttl_secs = parse_number(var("TASK_TTL_SECS"), DEFAULT_TASK_TTL_SECS, "TASK_TTL_SECS")?;

        let cfg = Self {
            server_addr,
            static_dir,
            open_browser,
            default_model,
            deepseek_api_key,
            deepseek_model,
            doubao_api_key,
            doubao_base_url,
            doubao_model,
            max_upload_bytes,
            max_content_chars,
            task_ttl: Duration::from_secs(task_ttl_secs),
        };
        cfg.validate()?;
        Ok(cfg)
    }

    /// `true` si hay clave de API para el proveedor.
    pub fn has_key_for(&self, provider: LlmProvider) -> bool {
        match provider {
            LlmProvider::DeepSeek => self.deepseek_api_key.is_some(),
            LlmProvider::Doubao => self.doubao_api_key.is_some(),
        }
    }

    fn validate(&self) -> Result<()> {
        if !self.has_key_for(self.default_model) {
            bail!(
                "Falta la clave de API del modelo por defecto '{}' (DEEPSEEK_API_KEY / DOUBAO_API_KEY)",
                self.default_model
            );
        }
        if self.max_content_chars == 0 {
            bail!("MAX_CONTENT_CHARS debe ser mayor que cero");
        }
        Ok(())
    }
}

fn parse_bool(raw: Option<&str>) -> Result<bool> {
    match raw.map(str::to_lowercase).as_deref() {
        None => Ok(false),
        Some("1" | "true" | "yes" | "on") => Ok(true),
        Some("0" | "false" | "no" | "off") => Ok(false),
        Some(other) => Err(anyhow!("Valor booleano no válido: {other}")),
    }
}

fn parse_number<T: std::str::FromStr>(raw: Option<String>, default: T, name: &str) -> Result<T> {
    match raw {
        None => Ok(default),
        Some(value) => value
            .parse()
            .map_err(|_| anyhow!("{name} debe ser un número entero, recibido: {value}")),
    }
}
