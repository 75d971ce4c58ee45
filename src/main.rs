//! EchoMIDI
//!
//! Echo MIDI input devices into any number of MIDI outputs, with per-output
//! mute and focus mute.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use echo_midi::cli::{self, ReplContext};
use echo_midi::config::AppConfig;
use echo_midi::context::EchoContext;
use echo_midi::device::{DeviceSubsystem, Inventory, MidirSubsystem};
use echo_midi::echo::SendFailure;
use echo_midi::focus;
use echo_midi::paths::AppPaths;
use echo_midi::persistence::RoutingDocument;
use echo_midi::registry::Registry;
use echo_midi::watcher::InventoryWatcher;

/// EchoMIDI - echo MIDI inputs into multiple MIDI outputs
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file (defaults to the application directory)
    #[arg(short, long, env = "ECHOMIDI_CONFIG")]
    config: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(short, long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Routing file to load and save instead of the configured one
    #[arg(short, long)]
    routing: Option<PathBuf>,

    /// List available MIDI ports and exit
    #[arg(long)]
    list_devices: bool,

    /// Disable focus mute tracking
    #[arg(long)]
    no_focus: bool,

    /// Run without the interactive prompt until Ctrl-C
    #[arg(long)]
    headless: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    let args = Args::parse();

    let paths = AppPaths::detect();
    paths
        .ensure_directories()
        .context("Failed to create application directories")?;

    let config_path = args.config.clone().unwrap_or_else(|| paths.config.clone());
    let config = AppConfig::load_or_default(&config_path).await?;

    let logs_dir = config.logging.file.then_some(paths.logs_dir.as_path());
    let _log_guard = init_logging(&args.log_level, logs_dir)?;

    info!("==== EchoMIDI v{} START ====", env!("CARGO_PKG_VERSION"));
    info!("Layout: {:?} ({})", paths.layout, paths.base_dir().display());
    info!("Configuration file: {}", config_path.display());

    let subsystem: Arc<dyn DeviceSubsystem> = Arc::new(MidirSubsystem::new());

    if args.list_devices {
        cli::print_inventory(subsystem.as_ref())?;
        return Ok(());
    }

    let mut context = EchoContext::new(subsystem.clone());
    if config.focus.enabled && !args.no_focus {
        match focus::platform_source() {
            Some(source) => {
                if let Err(e) = context.init(Some(source)) {
                    warn!("Focus tracking unavailable: {}", e);
                }
            },
            None => info!("No focus source on this platform, focus mute is inactive"),
        }
    } else {
        context.init(None)?;
    }

    let routing_path = args
        .routing
        .clone()
        .unwrap_or_else(|| config.routing_path(&paths));
    info!("Routing file: {}", routing_path.display());

    let send_failures = Arc::new(AtomicU64::new(0));
    let mut registry = context.registry();
    {
        let send_failures = send_failures.clone();
        registry.set_send_failure_callback(Arc::new(move |_: &SendFailure| {
            send_failures.fetch_add(1, Ordering::Relaxed);
        }));
    }
    registry.reconcile();

    match RoutingDocument::load_or_default(&routing_path).await {
        Ok(document) => {
            let failures = document.apply_to(&mut registry);
            if !failures.is_empty() {
                warn!("{} routing entr(ies) could not be restored", failures.len());
            }
        },
        Err(e) => warn!("Ignoring routing file: {:#}", e),
    }

    let registry = Arc::new(Mutex::new(registry));
    let baseline = Inventory::capture(subsystem.as_ref()).unwrap_or_default();
    let watcher = InventoryWatcher::spawn(subsystem.clone(), config.poll_interval(), baseline);

    let repl = if args.headless {
        None
    } else {
        Some(spawn_repl(ReplContext {
            registry: registry.clone(),
            routing_path: routing_path.clone(),
            runtime: tokio::runtime::Handle::current(),
        })?)
    };

    run_app(registry.clone(), watcher, repl, shutdown_signal()).await;

    // Cleanup
    info!("Shutting down...");
    if config.autosave {
        let document = RoutingDocument::from_registry(&registry.lock());
        if let Err(e) = document.save_to_file(&routing_path).await {
            error!("Failed to save routing: {:#}", e);
        }
    }
    registry.lock().shutdown();
    context.shutdown();

    let failures = send_failures.load(Ordering::Relaxed);
    if failures > 0 {
        info!("{} forward(s) failed during this session", failures);
    }
    info!("==== EchoMIDI END ====");
    Ok(())
}

/// Run the REPL on its own thread; the receiver resolves when it exits.
fn spawn_repl(ctx: ReplContext) -> Result<oneshot::Receiver<Result<()>>> {
    let (tx, rx) = oneshot::channel();
    std::thread::Builder::new()
        .name("echo-midi-repl".to_string())
        .spawn(move || {
            let _ = tx.send(cli::run_repl(ctx));
        })
        .context("Failed to spawn REPL thread")?;
    Ok(rx)
}

async fn run_app(
    registry: Arc<Mutex<Registry>>,
    mut watcher: InventoryWatcher,
    repl: Option<oneshot::Receiver<Result<()>>>,
    shutdown: impl std::future::Future<Output = ()>,
) {
    info!("Ready to echo MIDI events!");

    let repl_done = async move {
        match repl {
            Some(rx) => rx.await.unwrap_or(Ok(())),
            None => std::future::pending().await,
        }
    };
    tokio::pin!(repl_done);
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            Some(inventory) = watcher.next_change() => {
                debug!(
                    "Inventory change: {} input(s), {} output(s)",
                    inventory.inputs.len(),
                    inventory.outputs.len()
                );
                // Enumeration and port opens block; keep them off the runtime workers
                let registry = registry.clone();
                if let Err(e) = tokio::task::spawn_blocking(move || registry.lock().reconcile()).await {
                    error!("Reconciliation task failed: {}", e);
                }
            }

            result = &mut repl_done => {
                if let Err(e) = result {
                    warn!("Interactive prompt failed: {:#}", e);
                }
                break;
            }

            _ = &mut shutdown => {
                info!("Shutdown signal received, stopping event loop");
                break;
            }
        }
    }
}

fn init_logging(level: &str, logs_dir: Option<&Path>) -> Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let (file_layer, guard) = match logs_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "echo-midi.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_target(false);
            (Some(layer), Some(guard))
        },
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_target(false)
                .with_thread_ids(false)
                .with_thread_names(false),
        )
        .with(file_layer)
        .try_init()
        .context("Failed to install tracing subscriber")?;

    Ok(guard)
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to install CTRL+C signal handler: {}", e);
        std::future::pending::<()>().await;
    }
}
