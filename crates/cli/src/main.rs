mod api;
mod config;
mod observer;

use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use drafter_core::{ContextFile, ProposalRequest, SessionPointer};
use orchestrator::{consume, OpenAiClient, OrchestratorError, ProposalClient, SessionSummary};
use server::{create_router, state::AppState};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use api::{ApiClient, DrainOutcome};
use config::{drafter_dir, plan_dir, DrafterConfig, CONFIG_FILE, DRAFTER_DIR, PLAN_DIR};
use observer::{render_effects, ConsoleObserver};

#[derive(Parser)]
#[command(name = "drafter")]
#[command(about = "Stream multi-file change proposals from a language model", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Server to talk to, overrides `[server] url`
    #[arg(long, global = true)]
    server_url: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Create `.drafter/` with a default config
    Init,
    /// Run the drafter server
    Serve {
        /// Overrides `[server] port`
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Ask for a proposal; continues the previous one unless `--new`
    Propose {
        prompt: String,

        /// Files to send along as context
        #[arg(short, long = "file")]
        files: Vec<PathBuf>,

        /// Start a fresh conversation instead of revising the last proposal
        #[arg(long)]
        new: bool,
    },
    /// Abort a running proposal
    Abort { proposal_id: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let cwd = std::env::current_dir()?;

    match cli.command {
        Commands::Init => init_project(&cwd).await,
        Commands::Serve { port } => {
            init_tracing("drafter=info,server=info,orchestrator=info,tower_http=info");
            let config = DrafterConfig::load(&cwd).await;
            serve(port.unwrap_or(config.server.port), &config).await
        }
        Commands::Propose { prompt, files, new } => {
            init_tracing("drafter=warn,orchestrator=warn");
            let config = DrafterConfig::load(&cwd).await;
            let server_url = cli.server_url.unwrap_or(config.server.url);
            propose(&cwd, &server_url, prompt, &files, new).await
        }
        Commands::Abort { proposal_id } => {
            init_tracing("drafter=warn");
            let config = DrafterConfig::load(&cwd).await;
            let server_url = cli.server_url.unwrap_or(config.server.url);
            abort(&server_url, &proposal_id).await
        }
    }
}

async fn init_project(cwd: &Path) -> Result<()> {
    let dir = drafter_dir(cwd);

    if dir.join(CONFIG_FILE).exists() {
        println!("Already initialized at {}", dir.display());
        return Ok(());
    }

    tokio::fs::create_dir_all(plan_dir(cwd)).await?;
    DrafterConfig::default().save(cwd).await?;

    println!("Initialized drafter in {}", cwd.display());
    println!();
    println!("Created:");
    println!("  {}/", DRAFTER_DIR);
    println!("  ├── {}", CONFIG_FILE);
    println!("  └── {}/", PLAN_DIR);
    println!();
    println!("Next steps:");
    println!("  1. Run 'drafter serve' to start the server");
    println!("  2. Run 'drafter propose \"<what to change>\"' in another terminal");

    Ok(())
}

async fn serve(port: u16, config: &DrafterConfig) -> Result<()> {
    tracing::info!("Model: {} at {}", config.backend.model, config.backend.base_url);

    let model = Arc::new(OpenAiClient::from_config(&config.backend));
    let state = AppState::new(model, &config.backend);
    let app = create_router(state);

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", port))
        .await
        .with_context(|| format!("Failed to bind port {}", port))?;

    println!();
    println!("drafter server");
    println!("════════════════════════════════════════");
    println!();
    println!("  API Server:  http://localhost:{}", port);
    println!("  Swagger UI:  http://localhost:{}/swagger-ui", port);
    println!();
    println!("Press Ctrl+C to stop");
    println!();

    axum::serve(listener, app).await?;

    Ok(())
}

async fn propose(
    cwd: &Path,
    server_url: &str,
    prompt: String,
    files: &[PathBuf],
    new: bool,
) -> Result<()> {
    let drafter_dir = drafter_dir(cwd);
    let plan_dir = plan_dir(cwd);

    let parent_id = if new {
        None
    } else {
        SessionPointer::read(&drafter_dir)
            .await?
            .map(|pointer| pointer.proposal_id)
    };

    let mut request = ProposalRequest::new(prompt).with_parent(parent_id.clone());
    for path in files {
        let body = tokio::fs::read_to_string(cwd.join(path))
            .await
            .with_context(|| format!("Failed to read context file {}", path.display()))?;
        request.context.push(ContextFile {
            path: path.display().to_string(),
            body,
        });
    }
    if parent_id.is_some() {
        request.current_plan = read_plan(&plan_dir).await?;
    } else if plan_dir.exists() {
        tokio::fs::remove_dir_all(&plan_dir).await?;
    }

    let api = ApiClient::new(server_url);
    let frames = api.stream_proposal(&request).await?;

    let (tx, rx) = mpsc::unbounded_channel();
    let renderer = tokio::spawn(render_effects(rx, drafter_dir));
    let client = ProposalClient::new(ConsoleObserver::new(tx)).with_request(&request);

    let cancel = CancellationToken::new();
    let ctrl_c = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                cancel.cancel();
            }
        })
    };

    let outcome = consume(frames, client, cancel).await;
    ctrl_c.abort();
    let proposal_id = renderer.await.ok().flatten();
    println!();

    if let (Err(OrchestratorError::Aborted(_)), Some(id)) = (&outcome, &proposal_id) {
        if let Err(e) = api.abort(id).await {
            tracing::warn!("Failed to abort {} on the server: {}", id, e);
        }
    }
    if let Some(id) = &proposal_id {
        release(&api, id).await;
    }

    match outcome {
        Ok(summary) => {
            write_plan(&plan_dir, &summary).await?;
            print_summary(&summary, &plan_dir);
            Ok(())
        }
        Err(OrchestratorError::Aborted(reason)) => bail!("Proposal aborted: {}", reason),
        Err(e) => bail!("Proposal failed: {}", e),
    }
}

const DRAIN_ATTEMPTS: u32 = 3;
const DRAIN_RETRY_DELAY: Duration = Duration::from_millis(200);

/// Drain the settled proposal from the server. The server may still be
/// closing the session when the client settles, so a running answer is
/// retried a few times before giving up with a warning.
async fn release(api: &ApiClient, proposal_id: &str) -> DrainOutcome {
    let mut outcome = DrainOutcome::Running;
    for attempt in 1..=DRAIN_ATTEMPTS {
        outcome = match api.drain(proposal_id).await {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::warn!("Failed to drain {}: {}", proposal_id, e);
                return DrainOutcome::Unknown;
            }
        };
        if outcome != DrainOutcome::Running {
            break;
        }
        if attempt < DRAIN_ATTEMPTS {
            tokio::time::sleep(DRAIN_RETRY_DELAY).await;
        }
    }

    match outcome {
        DrainOutcome::Drained => tracing::debug!("Drained {}", proposal_id),
        DrainOutcome::Running => tracing::warn!("Proposal {} still running, not drained", proposal_id),
        DrainOutcome::Unknown => tracing::debug!("Proposal {} already gone", proposal_id),
    }
    outcome
}

async fn abort(server_url: &str, proposal_id: &str) -> Result<()> {
    if ApiClient::new(server_url).abort(proposal_id).await? {
        println!("Aborted {}", proposal_id);
        Ok(())
    } else {
        bail!("Unknown proposal: {}", proposal_id)
    }
}

fn print_summary(summary: &SessionSummary, plan_dir: &Path) {
    let total = summary.files.len() + summary.errors.len();

    if total == 0 {
        println!("Complete: no files to change");
    } else if summary.is_partial() {
        println!(
            "Partial: {} of {} file(s) drafted in {}",
            summary.files.len(),
            total,
            plan_dir.display()
        );
        for (path, failure) in &summary.errors {
            println!("  ✗ {}: {}", path, failure);
        }
    } else {
        println!(
            "Complete: {} file(s) drafted in {}",
            summary.files.len(),
            plan_dir.display()
        );
    }
    println!("Proposal: {}", summary.proposal_id);
}

/// Paths come from the model, so anything escaping the plan dir is dropped.
fn plan_relative(path: &str) -> Option<PathBuf> {
    let path = Path::new(path);
    path.components()
        .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
        .then(|| path.to_path_buf())
}

async fn write_plan(plan_dir: &Path, summary: &SessionSummary) -> Result<()> {
    for (path, content) in &summary.files {
        let Some(relative) = plan_relative(path) else {
            tracing::warn!("Skipping file outside the plan directory: {}", path);
            continue;
        };

        let target = plan_dir.join(relative);
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&target, content)
            .await
            .with_context(|| format!("Failed to write {}", target.display()))?;
    }
    Ok(())
}

/// Drafted files from earlier revisions, keyed by plan-relative path.
async fn read_plan(plan_dir: &Path) -> Result<BTreeMap<String, String>> {
    let mut files = BTreeMap::new();
    if !plan_dir.exists() {
        return Ok(files);
    }

    let mut pending = vec![plan_dir.to_path_buf()];
    while let Some(dir) = pending.pop() {
        let mut entries = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if entry.file_type().await?.is_dir() {
                pending.push(path);
                continue;
            }

            let Ok(relative) = path.strip_prefix(plan_dir) else {
                continue;
            };
            match tokio::fs::read_to_string(&path).await {
                Ok(content) => {
                    let key = relative
                        .components()
                        .map(|c| c.as_os_str().to_string_lossy())
                        .collect::<Vec<_>>()
                        .join("/");
                    files.insert(key, content);
                }
                Err(e) => tracing::warn!("Skipping unreadable plan file {}: {}", path.display(), e),
            }
        }
    }

    Ok(files)
}

fn init_tracing(default_filter: &str) {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .init();
}
