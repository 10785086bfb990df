use finqa_orchestrator::{
    retrieval::ContextRetriever,
    session::{InMemorySessionStore, SessionStore},
    Config, Coordinator, SessionId,
};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Logs go to stderr so the conversation on stdout stays readable
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = Config::from_env()?;

    info!("FinQA chat starting");

    // Create components
    let retriever = Arc::new(ContextRetriever::from_path(&config.dataset_path));
    let sessions: Arc<dyn SessionStore> = Arc::new(InMemorySessionStore::new());
    let coordinator = Coordinator::from_config(&config, retriever, sessions)?;

    let session_id = SessionId::generate();

    let mut stdout = tokio::io::stdout();
    stdout
        .write_all(
            format!(
                "FinQA chat (model {}). Session {}.\nType 'quit' or 'exit' to leave.\n",
                config.model, session_id
            )
            .as_bytes(),
        )
        .await?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        stdout.write_all(b"\nYou: ").await?;
        stdout.flush().await?;

        let Some(line) = lines.next_line().await? else {
            break;
        };
        let input = line.trim();

        if input.is_empty() {
            continue;
        }
        if input.eq_ignore_ascii_case("quit") || input.eq_ignore_ascii_case("exit") {
            break;
        }

        let result = coordinator.run_turn(&session_id, input).await;

        let mut reply = format!("\nAssistant: {}\n", result.answer);
        if let Some(error) = &result.error {
            reply.push_str(&format!("(error: {})\n", error));
        }
        stdout.write_all(reply.as_bytes()).await?;
    }

    stdout.write_all(b"\nGoodbye.\n").await?;
    info!(session_id = %session_id, "FinQA chat finished");

    Ok(())
}
