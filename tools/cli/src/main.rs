//! Driftwood CLI - inspect and drive an engine data directory.
//!
//! Every command opens the engine on the configured store, does its work
//! and shuts the engine down again. Only `drain` and `listen` go online.

mod http;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use driftwood_app::{Engine, EngineConfig};
use driftwood_cache::CacheValue;
use driftwood_common::{Priority, TaskId};
use driftwood_connectivity::{classify_rtt, HttpProbe, ReachabilityProbe};
use driftwood_realtime::ChannelEvent;
use driftwood_sync::{EnqueueOptions, StrategyRegistry, SyncTask, TaskStatus};

use crate::http::{HttpRequest, HttpStrategy};

#[derive(Parser)]
#[command(name = "driftwood")]
#[command(about = "Driftwood - offline-first sync engine")]
#[command(version)]
struct Cli {
    /// Enable verbose logging.
    #[arg(short, long)]
    verbose: bool,

    /// Engine data directory (default: platform data dir).
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Configuration file (default: <data-dir>/config.json).
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show queue and cache statistics.
    Status,

    /// List queued tasks.
    Pending {
        /// Include failed tasks.
        #[arg(short, long)]
        all: bool,

        /// Print tasks as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Queue a task for delivery.
    Enqueue {
        /// Task kind.
        #[arg(short, long, default_value = "http.request")]
        kind: String,

        /// Task payload as JSON.
        #[arg(short, long)]
        payload: String,

        /// Priority: "high", "medium" or "low".
        #[arg(long, default_value = "medium")]
        priority: String,

        /// Explicit task id; re-queuing an existing id is a no-op.
        #[arg(long)]
        id: Option<String>,

        /// Per-attempt timeout in milliseconds.
        #[arg(long)]
        timeout_ms: Option<u64>,
    },

    /// Cancel a queued or failed task.
    Cancel {
        /// Task id.
        id: String,
    },

    /// Put a failed task back in the queue.
    Retry {
        /// Task id.
        id: String,
    },

    /// Go online and deliver queued tasks.
    Drain {
        /// Keep retrying backed-off tasks for this many seconds.
        #[arg(short, long, default_value = "0")]
        wait: u64,
    },

    /// Inspect or modify the cache.
    Cache {
        #[command(subcommand)]
        command: CacheCommands,
    },

    /// Probe backend reachability.
    Probe {
        /// Probe URL (default: connectivity.probe_url).
        #[arg(short, long)]
        url: Option<String>,
    },

    /// Connect the realtime channel and print incoming messages.
    Listen {
        /// Channel URL (default: realtime.url).
        #[arg(short, long)]
        url: Option<String>,

        /// Only print messages on these topics.
        #[arg(short, long)]
        topic: Vec<String>,
    },

    /// Show or create the configuration file.
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(Subcommand)]
enum CacheCommands {
    /// Print a cached value.
    Get { key: String },

    /// Store a value. Input that is not valid JSON is stored as a string.
    Set {
        key: String,
        value: String,

        /// Time to live in milliseconds.
        #[arg(long)]
        ttl_ms: Option<u64>,
    },

    /// Remove a value.
    Invalidate { key: String },

    /// Remove expired entries.
    Sweep,

    /// Remove everything.
    Clear,
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Print the effective configuration.
    Show,

    /// Write a default configuration file.
    Init {
        /// Overwrite an existing file.
        #[arg(short, long)]
        force: bool,
    },
}

/// How much of the engine a command needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    /// Local state only; the queue never drains.
    Offline,
    /// Reachability decides whether the queue drains.
    Online,
    /// Online with the realtime channel connected.
    Listen,
}

struct Paths {
    data_dir: PathBuf,
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Logs go to stderr so command output stays machine readable.
    let level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();

    let paths = resolve_paths(cli.data_dir, cli.config)?;

    match cli.command {
        Commands::Config { command } => match command {
            ConfigCommands::Show => cmd_config_show(&paths),
            ConfigCommands::Init { force } => cmd_config_init(&paths, force),
        },

        Commands::Probe { url } => cmd_probe(&paths, url).await,

        Commands::Status => {
            let engine = open_engine(&paths, Mode::Offline).await?;
            finish(cmd_status(&engine), engine).await
        }

        Commands::Pending { all, json } => {
            let engine = open_engine(&paths, Mode::Offline).await?;
            finish(cmd_pending(&engine, all, json), engine).await
        }

        Commands::Enqueue {
            kind,
            payload,
            priority,
            id,
            timeout_ms,
        } => {
            let engine = open_engine(&paths, Mode::Offline).await?;
            let result = cmd_enqueue(&engine, &kind, &payload, &priority, id, timeout_ms).await;
            finish(result, engine).await
        }

        Commands::Cancel { id } => {
            let engine = open_engine(&paths, Mode::Offline).await?;
            finish(cmd_cancel(&engine, &id).await, engine).await
        }

        Commands::Retry { id } => {
            let engine = open_engine(&paths, Mode::Offline).await?;
            finish(cmd_retry(&engine, &id).await, engine).await
        }

        Commands::Cache { command } => {
            let engine = open_engine(&paths, Mode::Offline).await?;
            finish(cmd_cache(&engine, command), engine).await
        }

        Commands::Drain { wait } => {
            let engine = open_engine(&paths, Mode::Online).await?;
            finish(cmd_drain(&engine, Duration::from_secs(wait)).await, engine).await
        }

        Commands::Listen { url, topic } => {
            let mut config = load_config(&paths)?;
            if url.is_some() {
                config.realtime.url = url;
            }
            let engine = start_engine(config, Mode::Listen).await?;
            finish(cmd_listen(&engine, &topic).await, engine).await
        }
    }
}

/// Shut the engine down before reporting the command's outcome, so
/// queued writes reach the store even when the command failed.
async fn finish(result: Result<()>, engine: Engine) -> Result<()> {
    engine.shutdown().await;
    result
}

fn resolve_paths(data_dir: Option<PathBuf>, config: Option<PathBuf>) -> Result<Paths> {
    let data_dir = match data_dir {
        Some(dir) => dir,
        None => dirs::data_dir()
            .context("No platform data directory; pass --data-dir")?
            .join("driftwood"),
    };
    let config = config.unwrap_or_else(|| data_dir.join("config.json"));
    Ok(Paths { data_dir, config })
}

/// Configuration as the CLI runs it: the file if present, with the
/// in-memory store replaced by a local store under the data directory.
fn load_config(paths: &Paths) -> Result<EngineConfig> {
    let mut config = if paths.config.exists() {
        EngineConfig::load(&paths.config)
            .with_context(|| format!("Failed to load config {}", paths.config.display()))?
    } else {
        EngineConfig::default()
    };

    if config.storage.backend == "memory" {
        config.storage.backend = "local".to_string();
        config.storage.options = json!({ "root": store_dir(&paths.data_dir) });
    }
    Ok(config)
}

async fn open_engine(paths: &Paths, mode: Mode) -> Result<Engine> {
    start_engine(load_config(paths)?, mode).await
}

fn store_dir(data_dir: &Path) -> String {
    data_dir.join("store").to_string_lossy().to_string()
}

async fn start_engine(mut config: EngineConfig, mode: Mode) -> Result<Engine> {
    config.realtime.auto_connect = mode == Mode::Listen;
    match mode {
        Mode::Offline => {
            config.connectivity.probe_url = None;
            config.connectivity.initial_online = false;
        }
        Mode::Online | Mode::Listen => {
            // One-shot commands cannot wait out a stabilization window.
            config.connectivity.stabilization_ms = 0;
            if config.connectivity.probe_url.is_none() {
                config.connectivity.initial_online = true;
            }
        }
    }

    let mut strategies = StrategyRegistry::new();
    strategies.register::<HttpRequest, _>(HttpStrategy::default())?;

    Engine::builder(config)
        .strategies(strategies)
        .start()
        .await
        .context("Failed to start engine")
}

/// Show queue and cache statistics.
fn cmd_status(engine: &Engine) -> Result<()> {
    let status = engine.status();
    let config = engine.config();

    println!("Engine Status:");
    println!("  Store: {}", engine.store().name());
    println!("  Queue:");
    println!("    Pending: {}", status.pending);
    println!("    Failed: {}", status.failed);
    println!("  Cache:");
    println!("    Entries: {}", status.cache.entries);
    println!(
        "    Used: {} / {} bytes",
        status.cache.used_bytes, status.cache.budget_bytes
    );
    println!(
        "  Probe: {}",
        config.connectivity.probe_url.as_deref().unwrap_or("(none)")
    );
    println!(
        "  Channel: {}",
        config.realtime.url.as_deref().unwrap_or("(none)")
    );

    Ok(())
}

/// List queued tasks.
fn cmd_pending(engine: &Engine, all: bool, as_json: bool) -> Result<()> {
    let tasks = if all {
        engine.queue().tasks()
    } else {
        engine.queue().get_pending()
    };

    if as_json {
        println!("{}", serde_json::to_string_pretty(&tasks)?);
        return Ok(());
    }

    if tasks.is_empty() {
        println!("No queued tasks.");
        return Ok(());
    }

    for task in &tasks {
        print_task(task);
    }
    Ok(())
}

fn print_task(task: &SyncTask) {
    println!(
        "{}  {:<14} {:<6} {:<9} attempts={} created={}",
        task.id,
        task.kind,
        task.priority,
        task.status.as_str(),
        task.attempts,
        task.created_at.format("%Y-%m-%d %H:%M:%S")
    );
    if let Some(at) = task.next_attempt_at {
        println!("    next attempt: {}", at.format("%Y-%m-%d %H:%M:%S"));
    }
    if let Some(error) = &task.last_error {
        println!("    last error: {}", error);
    }
}

/// Queue a task.
async fn cmd_enqueue(
    engine: &Engine,
    kind: &str,
    payload: &str,
    priority: &str,
    id: Option<String>,
    timeout_ms: Option<u64>,
) -> Result<()> {
    let payload: Value = serde_json::from_str(payload).context("Payload is not valid JSON")?;
    let priority: Priority = priority.parse().context("Invalid priority")?;
    let id = id
        .map(|id| TaskId::parse(&id))
        .transpose()
        .context("Invalid task id")?;

    let options = EnqueueOptions {
        id,
        priority,
        timeout: timeout_ms.map(Duration::from_millis),
    };

    let id = engine
        .queue()
        .enqueue_with(kind, payload, options)
        .await
        .context("Failed to enqueue task")?;

    info!("Queued {} task {}", kind, id);
    println!("{}", id);
    Ok(())
}

/// Cancel a task.
async fn cmd_cancel(engine: &Engine, id: &str) -> Result<()> {
    let id = TaskId::parse(id).context("Invalid task id")?;
    if engine.queue().cancel(&id).await {
        println!("Task cancelled: {}", id);
        Ok(())
    } else {
        anyhow::bail!("No such task: {}", id)
    }
}

/// Reset a failed task.
async fn cmd_retry(engine: &Engine, id: &str) -> Result<()> {
    let id = TaskId::parse(id).context("Invalid task id")?;
    let requeued = engine
        .queue()
        .retry(&id)
        .await
        .context("Failed to requeue task")?;

    if requeued {
        println!("Task requeued: {}", id);
        Ok(())
    } else {
        anyhow::bail!("No failed task with id {}", id)
    }
}

/// Deliver queued tasks.
async fn cmd_drain(engine: &Engine, wait: Duration) -> Result<()> {
    let queue = engine.queue();
    let before = queue.pending_count();
    let failed_before = queue.failed().len();
    if before == 0 {
        println!("Nothing to deliver.");
        return Ok(());
    }

    let probe_timeout = Duration::from_millis(engine.config().connectivity.probe_timeout_ms);
    let mut online = engine.monitor().watch_online();
    let settle = probe_timeout + Duration::from_secs(1);
    let reachable = tokio::time::timeout(settle, online.wait_for(|up| *up))
        .await
        .map(|changed| changed.is_ok())
        .unwrap_or(false);

    if !reachable {
        warn!("Backend unreachable");
        println!("Backend unreachable; {} task(s) remain queued.", before);
        return Ok(());
    }

    let deadline = Instant::now() + wait;
    loop {
        queue.flush().await;

        let pending = queue.get_pending();
        let in_flight = pending.iter().any(|t| t.status == TaskStatus::InFlight);

        if !in_flight && (pending.is_empty() || Instant::now() >= deadline) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    let status = engine.status();
    let delivered = (before + failed_before).saturating_sub(status.pending + status.failed);
    println!("Delivered: {}", delivered);
    println!("Pending: {}", status.pending);
    println!("Failed: {}", status.failed);
    Ok(())
}

fn cmd_cache(engine: &Engine, command: CacheCommands) -> Result<()> {
    let cache = engine.cache();

    match command {
        CacheCommands::Get { key } => match cache.get(&key) {
            Some(CacheValue::Json(value)) => println!("{}", serde_json::to_string_pretty(&value)?),
            Some(CacheValue::Bytes(bytes)) => println!("<{} bytes>", bytes.len()),
            None => anyhow::bail!("Not cached: {}", key),
        },

        CacheCommands::Set { key, value, ttl_ms } => {
            let value = serde_json::from_str(&value).unwrap_or(Value::String(value));
            cache.set(key.as_str(), value, ttl_ms.map(Duration::from_millis));
            if cache.get(&key).is_some() {
                println!("Cached: {}", key);
            } else {
                anyhow::bail!("Value for {} exceeds the cache budget", key);
            }
        }

        CacheCommands::Invalidate { key } => {
            if cache.invalidate(&key) {
                println!("Invalidated: {}", key);
            } else {
                println!("Not cached: {}", key);
            }
        }

        CacheCommands::Sweep => {
            let removed = cache.sweep_expired();
            println!("Removed {} expired entr{}", removed, if removed == 1 { "y" } else { "ies" });
        }

        CacheCommands::Clear => {
            cache.clear();
            println!("Cache cleared.");
        }
    }

    Ok(())
}

/// Probe reachability once.
async fn cmd_probe(paths: &Paths, url: Option<String>) -> Result<()> {
    let config = load_config(paths)?;
    let url = url
        .or(config.connectivity.probe_url)
        .context("No probe URL; pass --url or set connectivity.probe_url")?;
    let timeout = Duration::from_millis(config.connectivity.probe_timeout_ms);

    let probe = HttpProbe::new(&url, timeout)?;
    match tokio::time::timeout(timeout, probe.probe()).await {
        Ok(Ok(rtt)) => {
            println!("Reachable: {}", url);
            println!("  Round trip: {} ms", rtt.as_millis());
            println!("  Effective type: {}", classify_rtt(rtt));
        }
        Ok(Err(e)) => println!("Unreachable: {} ({})", url, e),
        Err(_) => println!("Unreachable: {} (timed out after {:?})", url, timeout),
    }
    Ok(())
}

/// Print channel messages until interrupted.
async fn cmd_listen(engine: &Engine, topics: &[String]) -> Result<()> {
    let channel = engine
        .channel()
        .context("No channel URL; pass --url or set realtime.url")?;

    let topics = topics.to_vec();
    let _events = channel.subscribe_events(move |event| match event {
        ChannelEvent::StateChanged(state) => info!("Channel {}", state),
        ChannelEvent::Degraded { attempts } => {
            warn!("Channel still down after {} attempts", attempts)
        }
        ChannelEvent::Message(envelope) => {
            if topics.is_empty() || topics.contains(&envelope.topic) {
                println!("{} {}", envelope.topic, envelope.payload);
            }
        }
    });

    tokio::signal::ctrl_c()
        .await
        .context("Failed to wait for Ctrl-C")?;
    info!("Interrupted; disconnecting");
    Ok(())
}

fn cmd_config_show(paths: &Paths) -> Result<()> {
    let config = load_config(paths)?;
    println!("{}", config.to_json()?);
    Ok(())
}

fn cmd_config_init(paths: &Paths, force: bool) -> Result<()> {
    if paths.config.exists() && !force {
        anyhow::bail!(
            "{} already exists; pass --force to overwrite",
            paths.config.display()
        );
    }

    let mut config = EngineConfig::default();
    config.storage.backend = "local".to_string();
    config.storage.options = json!({ "root": store_dir(&paths.data_dir) });

    if let Some(parent) = paths.config.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    std::fs::write(&paths.config, config.to_json()?)
        .with_context(|| format!("Failed to write {}", paths.config.display()))?;

    println!("Config written: {}", paths.config.display());
    Ok(())
}
