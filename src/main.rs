use anyhow::Context;
use tracing::info;
use tracing_subscriber::EnvFilter;

use knowledge_network_webapp::{api, app_state::AppState, config::AppConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 1. Cargar .env e inicializar logging
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // 2. Cargar configuración
    let cfg = AppConfig::from_env().context("Error al cargar la configuración")?;
    info!(
        "Modelo por defecto: {} | límite de subida: {} bytes | TTL de tareas: {:?}",
        cfg.default_model, cfg.max_upload_bytes, cfg.task_ttl
    );

    // 3. Crear estado compartido (LLMs + servicio de conocimiento + tareas)
    let app_state = AppState::from_config(cfg.clone()).context("Error inicializando los LLMs")?;

    // 4. Router de la API, frontend estático y CORS
    let app = api::build_app(app_state);

    // 5. Iniciar el servidor
    let listener = tokio::net::TcpListener::bind(&cfg.server_addr)
        .await
        .with_context(|| format!("No se pudo escuchar en {}", cfg.server_addr))?;
    let server_url = format!("http://{}", cfg.server_addr);
    info!("🚀 Servidor escuchando en {}", &server_url);

    if cfg.open_browser && webbrowser::open(&server_url).is_err() {
        info!("No se pudo abrir el navegador. Por favor, accede a {} manualmente.", server_url);
    }

    // 6. Apagado ordenado con Ctrl+C
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c().await.ok();
            info!("Señal de apagado recibida, iniciando cierre del servidor.");
        })
        .await
        .context("El servidor terminó con error")?;

    info!("✅ Servidor cerrado correctamente.");
    Ok(())
}
