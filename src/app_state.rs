use std::sync::Arc;

use crate::{
    config::AppConfig,
    knowledge::KnowledgeService,
    llm::{ChatGateway, LlmManager},
    tasks::TaskStore,
};

#[derive(Clone)]
pub struct AppState {
    pub config: AppConfig,
    pub knowledge: KnowledgeService,
    pub tasks: TaskStore,
}

impl AppState {
    /// Estado de producción: pasarela real según la configuración.
    pub fn from_config(config: AppConfig) -> anyhow::Result<Self> {
        let gateway = Arc::new(LlmManager::from_config(&config)?);
        Ok(Self::with_gateway(config, gateway))
    }

    pub fn with_gateway(config: AppConfig, gateway: Arc<dyn ChatGateway>) -> Self {
        let knowledge = KnowledgeService::new(gateway, config.default_model, config.max_content_chars);
        let tasks = TaskStore::new(config.task_ttl);
        Self {
            config,
            knowledge,
            tasks,
        }
    }
}
