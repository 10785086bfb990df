use clap::Parser;
use finqa_orchestrator::{
    evaluation::{run_evaluation, sample_questions, Tolerance},
    retrieval::ContextRetriever,
    session::{InMemorySessionStore, SessionStore},
    Config, Coordinator,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Score the orchestrator on questions sampled from the dataset
#[derive(Debug, Parser)]
#[command(name = "finqa-eval", version)]
struct Args {
    /// Number of questions to sample
    #[arg(long, default_value_t = 2)]
    samples: usize,

    /// Where to write the JSON results (defaults to EVAL_RESULTS_PATH)
    #[arg(long)]
    output: Option<PathBuf>,

    /// Dataset to sample from (defaults to DATASET_PATH)
    #[arg(long)]
    dataset: Option<PathBuf>,

    /// Allowed difference in percentage points
    #[arg(long, default_value_t = 0.1)]
    tolerance: f64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config = Config::from_env()?;

    let dataset = args.dataset.unwrap_or_else(|| config.dataset_path.clone());
    let output = args.output.unwrap_or_else(|| config.results_path.clone());
    let tolerance = Tolerance::Absolute(args.tolerance);

    info!(dataset = %dataset.display(), samples = args.samples, "Starting evaluation");

    let retriever = Arc::new(ContextRetriever::from_path(&dataset));
    let fingerprint = retriever.index().fingerprint().to_string();
    let sessions: Arc<dyn SessionStore> = Arc::new(InMemorySessionStore::new());
    let coordinator = Coordinator::from_config(&config, retriever, sessions)?;

    let questions = sample_questions(&dataset, args.samples);
    let report = run_evaluation(&coordinator, &questions, tolerance, &fingerprint).await;
    report.write_to(&output).await?;

    let summary = &report.summary;
    println!("\n=== EVALUATION SUMMARY ===");
    println!("Questions:          {}", summary.total_questions);
    println!("Successful:         {}", summary.successful_responses);
    println!(
        "Exact matches:      {} ({:.1}%)",
        summary.exact_matches,
        summary.accuracy_exact * 100.0
    );
    println!(
        "Numerical matches:  {} ({:.1}%, tolerance {})",
        summary.numerical_matches,
        summary.accuracy_numerical * 100.0,
        tolerance
    );
    println!("Avg response time:  {:.2}s", summary.average_response_time);
    println!("Error rate:         {:.1}%", summary.error_rate * 100.0);

    println!("\nDetails:");
    for (i, record) in report.detailed_results.iter().enumerate() {
        println!(
            "  {}: expected {} got {} [{}]",
            i + 1,
            record.expected_answer,
            record
                .extracted_answer
                .map(|v| format!("{}%", v))
                .unwrap_or_else(|| "-".to_string()),
            if record.matches { "match" } else { "miss" }
        );
    }
    println!("\nResults written to {}", output.display());

    Ok(())
}
