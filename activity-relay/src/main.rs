//! activity-relay - reliable local relay for client activity events
//!
//! Commands:
//! - `run`: the long-running agent (delivery timer, stream connection)
//! - `submit`: append one event to the local store
//! - `flush`: run one delivery cycle now
//! - `export` / `stats` / `status`: inspect the local store
//!
//! Uses XDG Base Directory specification for file locations:
//! - Store: $XDG_DATA_HOME/activity-relay/events.db (~/.local/share/activity-relay/events.db)
//! - Config: $XDG_CONFIG_HOME/activity-relay/config.toml (~/.config/activity-relay/config.toml)
//! - Logs: $XDG_STATE_HOME/activity-relay/ (`run` only; `--verbose` logs to stderr)

mod process_lock;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use activity_relay_core::collector::{CycleReport, CycleSummary};
use activity_relay_core::logging::{self, LogSink};
use activity_relay_core::{intake, Agent, Config, Error, EventStore};
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};

use crate::process_lock::acquire_delivery_guard;

/// Default export file name
const DEFAULT_EXPORT_FILE: &str = "activity_events.json";

#[derive(Parser)]
#[command(name = "activity-relay")]
#[command(about = "Queue activity events locally and deliver them to a collector")]
#[command(version)]
struct Args {
    /// Log to stderr for one-off commands
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the relay until interrupted
    Run {
        /// Read newline-delimited JSON events from stdin; stop at end of input
        #[arg(long)]
        stdin: bool,
    },

    /// Append one JSON event to the local store
    Submit {
        /// Event as a JSON object
        event: String,
    },

    /// Run one delivery cycle now
    Flush,

    /// Write all stored events to a JSON file
    Export {
        /// Output file
        #[arg(short, long, default_value = DEFAULT_EXPORT_FILE)]
        output: PathBuf,
    },

    /// Print statistics over stored events
    Stats,

    /// Show configuration and queue status
    Status,
}

fn main() -> Result<()> {
    let args = Args::parse();

    Config::ensure_xdg_env();

    let config = Config::load().context("failed to load configuration")?;

    // The agent always logs to file; one-off commands to stderr when asked
    let sink = match args.command {
        Command::Run { .. } => Some(LogSink::File),
        _ if args.verbose => Some(LogSink::Stderr),
        _ => None,
    };
    let _log_guard = match sink {
        Some(sink) => Some(
            logging::init(&config.logging, sink).context("failed to initialize logging")?,
        ),
        None => None,
    };

    match args.command {
        Command::Run { stdin } => cmd_run(config, stdin),
        Command::Submit { event } => cmd_submit(&config, &event),
        Command::Flush => cmd_flush(config),
        Command::Export { output } => cmd_export(&config, &output),
        Command::Stats => cmd_stats(&config),
        Command::Status => cmd_status(&config),
    }
}

fn open_store(config: &Config) -> Result<Arc<EventStore>> {
    let path = config.store_path();
    let store = EventStore::open(&path, &config.store)
        .with_context(|| format!("failed to open event store at {}", path.display()))?;
    store.migrate().context("failed to run store migrations")?;
    Ok(Arc::new(store))
}

fn runtime() -> Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start async runtime")
}

fn cmd_run(config: Config, read_stdin: bool) -> Result<()> {
    let db_path = config.store_path();
    let _guard = acquire_delivery_guard(&db_path).context("failed to acquire process lock")?;

    let store = open_store(&config)?;
    let agent = Arc::new(Agent::new(config, store).context("failed to build agent")?);

    let rt = runtime()?;
    let result = rt.block_on(async move {
        agent.start().await.context("failed to start agent")?;
        println!("activity-relay running (store: {})", db_path.display());
        if !agent.is_online() {
            println!("Collector unreachable, events will queue locally");
        }

        if read_stdin {
            let producer = Arc::clone(&agent);
            let mut lines = BufReader::new(tokio::io::stdin()).lines();
            let read = async move {
                while let Some(line) = lines.next_line().await? {
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }
                    match serde_json::from_str(line) {
                        Ok(value) => {
                            producer.submit(value);
                        }
                        Err(e) => tracing::warn!(error = %e, "Ignoring malformed input line"),
                    }
                }
                Ok::<_, std::io::Error>(())
            };

            tokio::select! {
                result = read => result.context("failed to read stdin")?,
                _ = tokio::signal::ctrl_c() => {}
            }
        } else {
            tokio::signal::ctrl_c()
                .await
                .context("failed to listen for Ctrl-C")?;
        }

        let report = agent.shutdown().await.context("final flush failed")?;
        print_report(&report);
        println!("Pending events: {}", agent.store().count()?);
        Ok::<(), anyhow::Error>(())
    });

    // A stdin read may still be parked on the blocking pool
    rt.shutdown_background();
    result
}

fn cmd_submit(config: &Config, event: &str) -> Result<()> {
    let value: serde_json::Value =
        serde_json::from_str(event).context("event is not valid JSON")?;
    let record = intake::prepare(value).context("event rejected")?;

    let store = open_store(config)?;
    let id = store.append(&record).context("failed to store event")?;
    println!("Stored event {}", id);
    Ok(())
}

fn cmd_flush(config: Config) -> Result<()> {
    let db_path = config.store_path();
    let _guard = acquire_delivery_guard(&db_path)
        .context("refusing to flush: the running agent owns delivery for this store")?;

    let store = open_store(&config)?;
    let agent = Agent::new(config, store).context("failed to build agent")?;

    let report = runtime()?.block_on(agent.flush_now())?;
    print_report(&report);

    if let CycleReport::Failed { reason, .. } = report {
        return Err(Error::Transport(reason)).context("delivery failed");
    }
    Ok(())
}

fn cmd_export(config: &Config, output: &Path) -> Result<()> {
    let store = open_store(config)?;
    let events = store.read_all()?;

    let json = serde_json::to_string_pretty(&events)?;
    std::fs::write(output, json)
        .with_context(|| format!("failed to write {}", output.display()))?;

    println!("Exported {} events to {}", events.len(), output.display());
    Ok(())
}

fn cmd_stats(config: &Config) -> Result<()> {
    let store = open_store(config)?;
    let stats = activity_relay_core::ActivityStats::compute(&store.read_all()?);
    println!("{}", serde_json::to_string_pretty(&stats)?);
    Ok(())
}

fn cmd_status(config: &Config) -> Result<()> {
    println!("Activity Relay Configuration");
    println!("============================");
    println!();
    println!("Config File:     {}", Config::config_path().display());
    println!("Store:           {}", config.store_path().display());
    println!("Log Directory:   {}", Config::state_dir().display());
    println!("Stream URL:      {}", config.collector.stream_url);
    println!("Stream Enabled:  {}", config.collector.stream_enabled);
    println!("HTTP URL:        {}", config.collector.http_url);
    println!("Flush Interval:  {}s", config.delivery.flush_interval_secs);
    println!("Batch Size:      {}", config.delivery.batch_size);
    println!("Retry Limit:     {}", config.delivery.retry_limit);
    println!(
        "Reconnect:       {}ms base, {}ms cap, {} attempts",
        config.connection.reconnect_base_ms,
        config.connection.reconnect_cap_ms,
        config.connection.max_reconnect_attempts
    );
    println!();

    let store = open_store(config)?;
    println!("Pending Events:  {}", store.count()?);
    Ok(())
}

fn print_report(report: &CycleReport) {
    let summary = CycleSummary::from(report);
    match summary.detail {
        Some(detail) => println!(
            "Flush {}: {} events ({})",
            summary.outcome, summary.events, detail
        ),
        None => println!("Flush {}: {} events", summary.outcome, summary.events),
    }
}
