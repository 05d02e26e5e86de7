// Módulos de la aplicación
pub mod api;
pub mod app_state;
pub mod config;
pub mod error;
pub mod explorer;
pub mod knowledge;
pub mod llm;
pub mod models;
pub mod tasks;
pub mod upload;

#[cfg(test)]
pub(crate) mod testing;
