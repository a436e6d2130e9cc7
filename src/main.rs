use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod aggregate;
mod assistant;
mod config;
mod error;
mod grading;
mod models;
mod output;
mod projection;
mod report;
mod runner;
mod tracking;

use crate::assistant::LangServeChain;
use crate::config::Config;
use crate::grading::LlmGrader;
use crate::models::ExperimentKind;
use crate::output::OutputFormat;
use crate::report::{ReportSettings, View};
use crate::runner::BatchEvaluator;
use crate::tracking::MlflowClient;

/// RAG chatbot workbench - chat with the assistant, run batch evaluations, inspect results
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the TOML configuration file
    #[arg(short, long, default_value = "rag-eval.toml", global = true)]
    config: PathBuf,

    /// Output format: plain or json
    #[arg(short, long, default_value = "plain", global = true)]
    output: OutputFormat,

    /// Verbose output - log every request
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Ask the assistant questions interactively
    Chat,
    /// Run the evaluation dataset through the assistant and record graded runs
    Evaluate {
        /// Grading mode (defaults to the configured one)
        #[arg(short, long)]
        mode: Option<ExperimentKind>,
        /// Dataset path (defaults to the configured one)
        #[arg(short, long)]
        dataset: Option<PathBuf>,
    },
    /// Show a dashboard view over recorded runs
    Report {
        view: View,
        /// Experiment(s) to show; single-experiment views default to the first one listed
        #[arg(short, long = "experiment")]
        experiments: Vec<String>,
    },
    /// List evaluation experiments
    Experiments,
}

fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();
    init_tracing(args.verbose);

    let mut config = Config::from_file(&args.config)?;
    config.apply_env_overrides(|name| std::env::var(name).ok())?;

    let store = MlflowClient::new(&config.tracking.uri);

    match args.command {
        Command::Chat => {
            let chain = LangServeChain::new(&config.assistant);
            let stdin = tokio::io::BufReader::new(tokio::io::stdin());
            assistant::run_chat(&chain, stdin, tokio::io::stdout()).await?;
        }
        Command::Evaluate { mode, dataset } => {
            let dataset_path = dataset.unwrap_or_else(|| config.evaluation.dataset_path.clone());
            let items = runner::load_dataset(&dataset_path)?;

            let chain = LangServeChain::new(&config.assistant);
            let mut grader = LlmGrader::from_config(&config.grader, config.scores)?;
            let mut evaluator = BatchEvaluator::new(
                &store,
                &chain,
                &mut grader,
                config.assistant.clone(),
                mode.unwrap_or(config.evaluation.mode),
                &config.tracking.experiment_prefix,
            );

            let summary = evaluator.run(&items).await?;
            if let Some(path) = &config.evaluation.storage_path {
                runner::store_summary(&summary, path)?;
            }
            output::print_batch_summary(&summary, args.output);
        }
        Command::Report { view, experiments } => {
            let settings = ReportSettings {
                experiment_prefix: config.tracking.experiment_prefix.clone(),
                scale: config.scores,
                evidence_images: config.report.evidence_images.clone(),
            };
            let outcome = report::build_report(&store, view, &experiments, &settings).await?;
            output::print_report(&outcome, args.output);
        }
        Command::Experiments => {
            let experiments =
                report::list_experiments(&store, &config.tracking.experiment_prefix).await?;
            output::print_experiments(&experiments, args.output);
        }
    }

    Ok(())
}
