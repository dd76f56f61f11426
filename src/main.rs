use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

use message_triage::api::{AppState, api_routes};
use message_triage::channels::SlackSender;
use message_triage::config::{ApiConfig, DriverConfig, EngineConfig, SlackConfig};
use message_triage::driver::{Driver, spawn_driver};
use message_triage::llm::{LlmConfig, LlmReplyGenerator, create_provider};
use message_triage::store::{Database, LibSqlBackend};
use message_triage::workflow::{Classifier, Message, RetryPolicy, RuleSet, WorkflowEngine};

const LOG_FILE_PREFIX: &str = "message-triage.log";

#[derive(Parser)]
#[command(name = "message-triage")]
#[command(about = "Resumable triage workflow for chat messages", long_about = None)]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the polling driver and HTTP surface in the foreground
    Run,

    /// Show driver status and per-status message counts
    Status,

    /// Ask a running driver to stop after its current cycle
    Stop,

    /// Print the tail of the newest log file
    Logs {
        /// Number of lines to print
        #[arg(short = 'n', long, default_value_t = 50)]
        lines: usize,
    },

    /// List messages awaiting a human reply
    Pending {
        #[arg(short, long, default_value_t = 20)]
        limit: usize,
    },

    /// Submit a human reply for a suspended message
    Feedback {
        /// Message ID
        id: String,
        /// Reply text to send
        reply: String,
        /// Checkpoint version the reply was written against
        #[arg(long)]
        checkpoint_version: Option<i64>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install rustls crypto provider before any TLS usage
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    let cli = Cli::parse();
    let api = ApiConfig::from_env().unwrap_or_else(|e| fatal(e));

    match cli.command {
        Commands::Run => {
            let _guard = init_tracing(Some(&api.log_dir))?;
            run(api).await
        }
        Commands::Status => {
            init_tracing(None)?;
            status(&api).await
        }
        Commands::Stop => {
            init_tracing(None)?;
            stop(&api).await
        }
        Commands::Logs { lines } => logs(&api.log_dir, lines),
        Commands::Pending { limit } => {
            init_tracing(None)?;
            pending(&api, limit).await
        }
        Commands::Feedback {
            id,
            reply,
            checkpoint_version,
        } => {
            init_tracing(None)?;
            feedback(&api, &id, &reply, checkpoint_version).await
        }
    }
}

fn fatal(e: impl std::fmt::Display) -> ! {
    eprintln!("Error: {e}");
    std::process::exit(1);
}

/// Stderr logging, plus a daily-rolling file when `log_dir` is given.
///
/// The returned guard flushes the file writer and must live as long as the process.
fn init_tracing(log_dir: Option<&Path>) -> anyhow::Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let stderr_layer = fmt::layer().with_target(false).with_writer(std::io::stderr);

    let (file_layer, guard) = match log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("creating log directory {}", dir.display()))?;
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .with_ansi(false)
                .with_target(false)
                .with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(stderr_layer)
        .with(file_layer)
        .init();
    Ok(guard)
}

// ── run ─────────────────────────────────────────────────────────────────

async fn run(api: ApiConfig) -> anyhow::Result<()> {
    let driver_config = DriverConfig::from_env().unwrap_or_else(|e| fatal(e));
    let engine_config = EngineConfig::from_env().unwrap_or_else(|e| fatal(e));
    let retry = RetryPolicy::from_env().unwrap_or_else(|e| fatal(e));
    let llm_config = LlmConfig::from_env().unwrap_or_else(|e| fatal(e));
    let slack_config = SlackConfig::from_env().unwrap_or_else(|e| fatal(e));

    eprintln!("📨 Message Triage v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Model: {}", llm_config.model);
    eprintln!("   Database: {}", api.db_path.display());
    eprintln!("   API: {}", api.base_url());
    eprintln!("   Logs: {}", api.log_dir.display());
    eprintln!(
        "   Driver: every {}s, batch {}, {} workers, stale after {}s\n",
        driver_config.poll_interval.as_secs(),
        driver_config.batch_size,
        driver_config.max_workers,
        driver_config.stale_claim_after.as_secs(),
    );

    let store: Arc<dyn Database> = Arc::new(
        LibSqlBackend::new_local(&api.db_path)
            .await
            .unwrap_or_else(|e| fatal(format!("opening {}: {e}", api.db_path.display()))),
    );

    let llm = create_provider(&llm_config)?;
    let classifier = Classifier::new(RuleSet::default_rules(), Some(Arc::clone(&llm)))
        .with_bot_prefix(engine_config.bot_prefix.clone())
        .with_timeout(engine_config.call_timeout);
    let engine = WorkflowEngine::new(
        Arc::clone(&store),
        Arc::new(classifier),
        Arc::new(LlmReplyGenerator::new(llm)),
        Arc::new(SlackSender::new(slack_config)),
    )
    .with_retry(retry)
    .with_config(engine_config);

    let driver = Arc::new(Driver::new(
        Arc::clone(&store),
        Arc::new(engine),
        driver_config,
    ));
    let (mut driver_join, handle) = spawn_driver(driver);

    let app = api_routes(AppState {
        store,
        driver: Some(handle.clone()),
    });
    let listener = tokio::net::TcpListener::bind(api.bind_addr)
        .await
        .with_context(|| format!("binding {}", api.bind_addr))?;
    info!(addr = %api.bind_addr, "HTTP server started");

    // Serve until the driver exits, either from ctrl-c or POST /api/driver/stop.
    let shutdown = async move {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupt received, stopping driver");
                handle.stop();
            }
            _ = &mut driver_join => return,
        }
        let _ = driver_join.await;
    };
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .context("HTTP server failed")?;

    info!("Stopped");
    Ok(())
}

// ── remote commands ─────────────────────────────────────────────────────

async fn get_json(url: &str) -> anyhow::Result<serde_json::Value> {
    let resp = reqwest::get(url)
        .await
        .with_context(|| format!("reaching {url}; is `message-triage run` running?"))?;
    read_json(resp).await
}

async fn post_json(url: &str, body: serde_json::Value) -> anyhow::Result<serde_json::Value> {
    let resp = reqwest::Client::new()
        .post(url)
        .json(&body)
        .send()
        .await
        .with_context(|| format!("reaching {url}; is `message-triage run` running?"))?;
    read_json(resp).await
}

async fn read_json(resp: reqwest::Response) -> anyhow::Result<serde_json::Value> {
    let status = resp.status();
    let body: serde_json::Value = resp.json().await.context("decoding response")?;
    if !status.is_success() {
        let detail = body["error"].as_str().unwrap_or("unknown error");
        anyhow::bail!("{status}: {detail}");
    }
    Ok(body)
}

async fn status(api: &ApiConfig) -> anyhow::Result<()> {
    let body = get_json(&format!("{}/api/driver/status", api.base_url())).await?;
    println!("{}", serde_json::to_string_pretty(&body)?);
    Ok(())
}

async fn stop(api: &ApiConfig) -> anyhow::Result<()> {
    post_json(
        &format!("{}/api/driver/stop", api.base_url()),
        serde_json::json!({}),
    )
    .await?;
    println!("Driver stopping after its current cycle");
    Ok(())
}

async fn pending(api: &ApiConfig, limit: usize) -> anyhow::Result<()> {
    let url = format!(
        "{}/api/messages?status=awaiting_human&limit={limit}",
        api.base_url()
    );
    let messages: Vec<Message> = serde_json::from_value(get_json(&url).await?)?;
    if messages.is_empty() {
        println!("No messages awaiting a reply");
        return Ok(());
    }
    for m in &messages {
        let preview: String = m.text.chars().take(80).collect();
        println!(
            "{}  {}  #{} <{}> {}",
            m.id,
            m.received_at.format("%Y-%m-%d %H:%M"),
            m.channel,
            m.sender,
            preview
        );
    }
    Ok(())
}

async fn feedback(
    api: &ApiConfig,
    id: &str,
    reply: &str,
    checkpoint_version: Option<i64>,
) -> anyhow::Result<()> {
    let body = post_json(
        &format!("{}/api/messages/{id}/feedback", api.base_url()),
        serde_json::json!({
            "reply": reply,
            "checkpoint_version": checkpoint_version,
        }),
    )
    .await?;
    match body["outcome"].as_str() {
        Some("accepted") => println!("Accepted; the reply will be sent on the next cycle"),
        _ => println!(
            "Ignored: {}",
            body["reason"].as_str().unwrap_or("no reason given")
        ),
    }
    Ok(())
}

// ── logs ────────────────────────────────────────────────────────────────

fn newest_log(dir: &Path) -> anyhow::Result<Option<PathBuf>> {
    let entries = std::fs::read_dir(dir)
        .with_context(|| format!("reading log directory {}", dir.display()))?;
    let mut newest: Option<(std::time::SystemTime, PathBuf)> = None;
    for entry in entries.flatten() {
        let path = entry.path();
        let is_log = path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.starts_with(LOG_FILE_PREFIX));
        if !is_log {
            continue;
        }
        let modified = entry.metadata()?.modified()?;
        if newest.as_ref().is_none_or(|(t, _)| modified > *t) {
            newest = Some((modified, path));
        }
    }
    Ok(newest.map(|(_, p)| p))
}

fn logs(dir: &Path, lines: usize) -> anyhow::Result<()> {
    let Some(path) = newest_log(dir)? else {
        println!("No log files in {}", dir.display());
        return Ok(());
    };
    let content = std::fs::read_to_string(&path)
        .with_context(|| format!("reading {}", path.display()))?;
    let all: Vec<&str> = content.lines().collect();
    for line in &all[all.len().saturating_sub(lines)..] {
        println!("{line}");
    }
    Ok(())
}
