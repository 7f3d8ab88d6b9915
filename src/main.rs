use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use sandbox_judge::config::{BackendKind, JudgeConfig};
use sandbox_judge::core::limits::LimitOverrides;
use sandbox_judge::languages::LanguageRegistry;
use sandbox_judge::orchestrator::Orchestrator;
use sandbox_judge::sandbox::{DockerBackend, IsolateBackend, IsolationBackend};
use sandbox_judge::worker::Worker;
use sandbox_judge::Submission;

#[derive(Parser)]
#[command(name = "sandbox-judge", version, about = "Sandboxed execution orchestrator")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Judge a single source file and print the report as JSON
    Run {
        #[arg(short, long)]
        language: String,
        #[arg(short, long)]
        source: PathBuf,
        /// File fed to the program's stdin
        #[arg(long)]
        stdin: Option<PathBuf>,
        /// File holding the expected output
        #[arg(long)]
        expected: Option<PathBuf>,
        /// CPU time limit in milliseconds
        #[arg(long)]
        time_limit: Option<u64>,
        /// Memory limit in MB
        #[arg(long)]
        memory_limit: Option<u64>,
    },
    /// Judge JSON-lines requests from a file (or stdin), one record per line to stdout
    Batch {
        #[arg(short, long)]
        input: Option<PathBuf>,
    },
    /// List the configured languages
    Languages,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("sandbox_judge=info".parse()?),
        )
        .init();

    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    let config = JudgeConfig::from_env()?;

    let registry = match &config.languages_path {
        Some(path) => {
            let registry = LanguageRegistry::from_path(path)?;
            info!("Loaded language configurations from {:?}", path);
            registry
        }
        None => LanguageRegistry::bundled()?,
    };

    if let Command::Languages = cli.command {
        for profile in registry.profiles() {
            println!(
                "{}\t{}\t{}",
                profile.id,
                profile.image,
                profile.aliases.join(",")
            );
        }
        return Ok(());
    }

    let backend = build_backend(&config).await?;
    let orchestrator = Arc::new(Orchestrator::new(
        Arc::new(registry),
        backend,
        config.limit_policy(),
    ));

    let cancel = CancellationToken::new();
    spawn_ctrl_c_handler(cancel.clone());

    match cli.command {
        Command::Run {
            language,
            source,
            stdin,
            expected,
            time_limit,
            memory_limit,
        } => {
            let code = tokio::fs::read_to_string(&source)
                .await
                .with_context(|| format!("Failed to read source {:?}", source))?;
            let mut submission = Submission::new(language, code).with_limits(LimitOverrides {
                cpu_time_ms: time_limit,
                memory_mb: memory_limit,
                ..Default::default()
            });
            if let Some(path) = stdin {
                submission = submission.with_stdin(
                    tokio::fs::read_to_string(&path)
                        .await
                        .with_context(|| format!("Failed to read stdin file {:?}", path))?,
                );
            }
            if let Some(path) = expected {
                submission = submission.with_expected_output(
                    tokio::fs::read_to_string(&path)
                        .await
                        .with_context(|| format!("Failed to read expected output {:?}", path))?,
                );
            }

            let report = orchestrator.judge(&submission, &cancel).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::Batch { input } => {
            let worker = Worker::new(orchestrator, config.concurrency);
            let stdout = tokio::io::stdout();
            let summary = match input {
                Some(path) => {
                    let file = tokio::fs::File::open(&path)
                        .await
                        .with_context(|| format!("Failed to open batch input {:?}", path))?;
                    worker.run_batch(file, stdout, &cancel).await?
                }
                None => worker.run_batch(tokio::io::stdin(), stdout, &cancel).await?,
            };
            if summary.internal_errors > 0 {
                warn!("{} request(s) hit an internal error", summary.internal_errors);
            }
        }
        Command::Languages => {}
    }

    Ok(())
}

async fn build_backend(config: &JudgeConfig) -> Result<Arc<dyn IsolationBackend>> {
    match config.backend {
        BackendKind::Docker => {
            let backend = DockerBackend::new(config.docker_config());
            backend.ensure_available().await?;
            Ok(Arc::new(backend))
        }
        BackendKind::Isolate => {
            let backend = IsolateBackend::new(config.worker_id);
            // Fail fast without cgroup support
            backend.ensure_available().await?;
            info!("Confirmed isolate cgroup support is available");
            Ok(Arc::new(backend))
        }
    }
}

fn spawn_ctrl_c_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted; cancelling running judges");
            cancel.cancel();
        }
    });
}
