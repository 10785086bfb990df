use finqa_orchestrator::{
    api::start_server,
    retrieval::ContextRetriever,
    session::{InMemorySessionStore, SessionStore},
    Config, Coordinator,
};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Load environment variables
    let config = Config::from_env()?;

    info!("FinQA Orchestrator - API Server");
    info!("Port: {}", config.api_port);

    // Create components
    let retriever = Arc::new(ContextRetriever::from_path(&config.dataset_path));
    let sessions: Arc<dyn SessionStore> = Arc::new(InMemorySessionStore::new());
    let coordinator = Arc::new(Coordinator::from_config(&config, retriever, sessions)?);

    info!("Coordinator initialized");

    start_server(coordinator, config.api_port).await?;

    Ok(())
}
