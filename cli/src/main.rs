//! MetaStore's administrative binary (SPEC_FULL.md §1, §6): process
//! bootstrap, logging setup, config loading, signal handling, and a handful
//! of maintenance subcommands against a locally opened `Store`. Deliberately
//! not a gRPC/etcd gateway — there is no network-facing client surface here.

use std::fs;
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use log::LevelFilter;
use metastore_consensus::NullTransport;
use metastore_model::config::{LogConfig, NodeConfig};
use tracing_appender::rolling::{RollingFileAppender, Rotation};

const MAX_LOG_FILES: usize = 10;

const APP_NAME: &str = "metastore";

#[derive(Parser, Debug)]
#[command(name = "metastore", about = "MetaStore node and maintenance CLI")]
struct Cli {
    /// Path to a TOML config file; falls back to confy's default config
    /// location for this app when omitted.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// This node's Raft id.
    #[arg(long, global = true, default_value_t = 1)]
    node_id: u64,

    /// Comma-separated Raft peer ids bootstrapping initial membership
    /// (include `node_id` itself). Defaults to a single-node cluster.
    #[arg(long, global = true, value_delimiter = ',')]
    peers: Vec<u64>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run this node until interrupted (Ctrl-C or SIGTERM).
    Serve,
    /// Print the current revision and leadership state.
    Status,
    /// Write a full snapshot (current_revision, compacted_revision, leases,
    /// key-values) to a file.
    Snapshot {
        #[arg(long)]
        output: PathBuf,
    },
    /// Raise the compaction floor to the given revision.
    Compact {
        revision: u64,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;
    let _log_guards = init_logging(&config.log)?;

    let peers = if cli.peers.is_empty() { vec![cli.node_id] } else { cli.peers.clone() };
    let store = metastore_store::open(&config, cli.node_id, &peers, Arc::new(NullTransport))?;

    match cli.command {
        Command::Serve => serve(store),
        Command::Status => {
            println!(
                "node_id={} leader={} current_revision={}",
                cli.node_id,
                store.is_leader(),
                store.current_revision()
            );
            store.shutdown();
            Ok(())
        }
        Command::Snapshot { output } => {
            // A snapshot is a local read of whatever this node already has;
            // unlike `compact` it proposes nothing through Raft, so no
            // leadership wait is needed.
            let bytes = store.get_snapshot()?;
            fs::write(&output, bytes)?;
            log::info!("wrote snapshot to {}", output.display());
            store.shutdown();
            Ok(())
        }
        Command::Compact { revision } => {
            wait_briefly_for_leader(&store);
            store.compact(revision)?;
            log::info!("compacted up to revision {}", revision);
            store.shutdown();
            Ok(())
        }
    }
}

/// Loads a `NodeConfig` via `confy`: a `Default` impl overlaid by an on-disk
/// TOML file. An explicit `--config` path bypasses confy's own path
/// resolution.
fn load_config(path: Option<&std::path::Path>) -> anyhow::Result<NodeConfig> {
    let mut config: NodeConfig = match path {
        Some(path) => confy::load_path(path)?,
        None => confy::load(APP_NAME, None)?,
    };
    config.fix_settings();
    Ok(config)
}

/// Colored stderr logging plus, when `log.dir` is configured, a daily
/// rolling file appender behind a non-blocking writer. The returned guards
/// must outlive `main`; dropping one stops its writer from flushing.
fn init_logging(log_config: &LogConfig) -> anyhow::Result<Vec<Box<dyn Drop + Send + Sync + 'static>>> {
    let mut guards: Vec<Box<dyn Drop + Send + Sync + 'static>> = Vec::new();
    let level = LevelFilter::from_str(&log_config.level).unwrap_or(LevelFilter::Info);
    let mut logger = fern::Dispatch::new();

    if let Some(dir) = &log_config.dir {
        let rolling = RollingFileAppender::builder()
            .rotation(Rotation::DAILY)
            .filename_prefix(format!("{}.log", APP_NAME))
            .max_log_files(MAX_LOG_FILES)
            .build(dir)?;
        let (non_blocking, flush_guard) = tracing_appender::non_blocking(rolling);
        let buffered = BufWriter::with_capacity(64 * 1024, non_blocking);
        guards.push(Box::new(flush_guard));

        let dispatch_file = fern::Dispatch::new()
            .format(|out, message, record| {
                out.finish(format_args!(
                    "[{}] - {} - [{}] {}",
                    chrono::Local::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
                    record.level(),
                    record.target(),
                    message
                ))
            })
            .level(level)
            .chain(Box::new(buffered) as Box<dyn Write + Send>);
        logger = logger.chain(dispatch_file);
    }

    let dispatch_stderr = fern::Dispatch::new()
        .level(level)
        .format(|out, message, record| {
            out.finish(format_args!(
                "[{} {} {}] {}",
                chrono::Local::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
                record.level(),
                record.target(),
                message
            ))
        })
        .chain(std::io::stderr());
    logger = logger.chain(dispatch_stderr);

    if logger.apply().is_err() {
        eprintln!("logger has already been set");
        return Ok(Vec::new());
    }
    Ok(guards)
}

/// Runs the node until a termination signal arrives: Ctrl-C and `SIGTERM`
/// both flip an `Arc<AtomicBool>` that the run loop polls.
fn serve(store: metastore_store::AnyStore) -> anyhow::Result<()> {
    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || r.store(false, Ordering::SeqCst))?;

    // `flag::register` sets its flag to `true` on receipt, the opposite
    // polarity of `running` — a dedicated flag keeps that straight.
    let term_requested = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register(signal_hook::consts::SIGTERM, term_requested.clone())?;

    log::info!("node running, press Ctrl-C to stop");
    while running.load(Ordering::SeqCst) && !term_requested.load(Ordering::SeqCst) {
        std::thread::sleep(Duration::from_millis(200));
    }
    log::info!("shutting down");
    store.shutdown();
    Ok(())
}

/// Maintenance subcommands run as a one-shot process against a freshly
/// opened single-node store, so a brief wait for the (self-)election to
/// land is needed before a mutating call can be proposed.
fn wait_briefly_for_leader(store: &metastore_store::AnyStore) {
    for _ in 0..200 {
        if store.is_leader() {
            return;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
}
