//! Reference host for rpgvault.
//!
//! Runs a fixed-rate tick loop on the main thread, the way a game server
//! would, with the persistence coordinator registered as its tick handler.
//! Players are driven from an operator console on stdin.
//!
//! # Startup Sequence
//!
//! 1. Load configuration from `rpgvault.yaml` (or the path given as the first argument)
//! 2. Initialize structured logging (tracing)
//! 3. Build the storage worker runtime
//! 4. Connect to SQLite and bring the schema up to date (fatal on failure)
//! 5. Start the console reader thread
//! 6. Run the tick loop until `quit` or end of input
//! 7. Flush every online player and log the shutdown report

mod console;
mod error;

use std::path::PathBuf;
use std::sync::mpsc::{self, Receiver, TryRecvError};
use std::time::{Duration, Instant};

use anyhow::Context as _;
use rpgvault_core::config::{LoggingConfig, StorageConfig};
use rpgvault_core::{
    Bridge, Coordinator, CoordinatorEvent, HostEvent, LeaveReason, PlayerDataView, RetryPolicy,
    TickHandler, VaultConfig, build_worker_runtime,
};
use rpgvault_db::{SqliteConfig, SqlitePool, SqliteStore, ensure_schema};
use rpgvault_types::SessionId;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::console::Command;
use crate::error::HostError;

/// Config file read when no path is given on the command line.
const DEFAULT_CONFIG_PATH: &str = "rpgvault.yaml";

/// How long to wait for worker tasks after the shutdown flush.
const RUNTIME_SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

fn main() -> anyhow::Result<()> {
    let config_path = std::env::args()
        .nth(1)
        .map_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH), PathBuf::from);
    let mut config = VaultConfig::load_or_default(&config_path)
        .map_err(HostError::from)
        .with_context(|| format!("loading {}", config_path.display()))?;
    config.storage.apply_env_overrides();

    init_logging(&config.logging);
    info!(
        config = %config_path.display(),
        database_url = %config.storage.database_url,
        tick_interval_ms = config.host.tick_interval_ms,
        "rpgvault-host starting"
    );

    let runtime = build_worker_runtime(config.bridge.worker_threads).map_err(HostError::from)?;
    let pool = runtime
        .block_on(connect(&config.storage))
        .context("connecting to the player store")?;
    let report = runtime
        .block_on(ensure_schema(pool.pool()))
        .map_err(HostError::from)
        .context("bringing the schema up to date")?;
    info!(
        from_version = report.from_version,
        to_version = report.to_version,
        applied = report.applied.len(),
        "Schema ready"
    );

    let store = SqliteStore::new(&pool);
    let bridge = Bridge::new(
        runtime,
        store,
        &config.bridge,
        RetryPolicy::from_config(&config.retry),
    );
    let mut coordinator = Coordinator::new(bridge, config.lifecycle.clone());

    let (commands_tx, commands_rx) = mpsc::channel();
    console::spawn_reader(commands_tx).map_err(HostError::from)?;
    info!("Console ready; type 'join <uuid> <name>' to connect a player");

    let ticks = run_tick_loop(&mut coordinator, &commands_rx, config.host.tick_interval());
    info!(ticks, "Tick loop stopped; flushing players");

    coordinator.handle_event(HostEvent::Shutdown);
    log_events(coordinator.drain_events());

    coordinator.bridge().block_on(pool.close());
    coordinator.close(RUNTIME_SHUTDOWN_GRACE);
    info!("rpgvault-host shutdown complete");
    Ok(())
}

/// Initialize the tracing subscriber. `RUST_LOG` overrides the configured
/// level.
fn init_logging(logging: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true);
    if logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn connect(storage: &StorageConfig) -> Result<SqlitePool, HostError> {
    let config = SqliteConfig::new(&storage.database_url)
        .with_max_connections(storage.max_connections)
        .with_busy_timeout(storage.busy_timeout());
    Ok(SqlitePool::connect(&config).await?)
}

/// Run ticks at `interval` until the console asks to quit. Returns the
/// number of ticks run.
fn run_tick_loop<T: TickHandler + CommandSink>(
    host: &mut T,
    commands: &Receiver<Command>,
    interval: Duration,
) -> u64 {
    let mut tick: u64 = 0;
    let mut next = Instant::now();
    loop {
        tick = tick.saturating_add(1);
        let quit = apply_commands(host, commands);
        host.on_tick(tick);
        host.after_tick();
        if quit {
            return tick;
        }

        next = next.checked_add(interval).unwrap_or(next);
        let now = Instant::now();
        let wait = next.saturating_duration_since(now);
        if wait.is_zero() {
            // Behind schedule: do not try to catch up with a burst of ticks.
            next = now;
        } else {
            std::thread::sleep(wait);
        }
    }
}

/// Apply every queued console command. Returns whether to stop.
fn apply_commands<T: CommandSink>(host: &mut T, commands: &Receiver<Command>) -> bool {
    loop {
        match commands.try_recv() {
            Ok(Command::Quit) | Err(TryRecvError::Disconnected) => return true,
            Ok(command) => host.apply(command),
            Err(TryRecvError::Empty) => return false,
        }
    }
}

/// Receiver of console commands on the tick thread.
trait CommandSink {
    /// Apply one command.
    fn apply(&mut self, command: Command);

    /// Called after each tick.
    fn after_tick(&mut self);
}

impl CommandSink for Coordinator<SqliteStore> {
    fn apply(&mut self, command: Command) {
        match command {
            Command::Join { player_id, name } => self.handle_event(HostEvent::Join {
                player_id,
                session: SessionId::new(),
                name,
            }),
            Command::Leave { player_id } => self.handle_event(HostEvent::Leave {
                player_id,
                reason: LeaveReason::Quit,
            }),
            Command::Xp { player_id, amount } => match self.add_experience(player_id, amount) {
                Ok(changes) => info!(player_id = %player_id, amount, levels = changes.len(), "Experience granted"),
                Err(e) => tracing::warn!(player_id = %player_id, error = %e, "xp rejected"),
            },
            Command::Pay { player_id, delta } => match self.add_currency(player_id, delta) {
                Ok(balance) => info!(player_id = %player_id, delta, balance, "Currency changed"),
                Err(e) => tracing::warn!(player_id = %player_id, error = %e, "pay rejected"),
            },
            Command::Save { player_id } => match self.request_save(player_id) {
                Ok(Some(op)) => info!(player_id = %player_id, op = %op, "Save queued"),
                Ok(None) => info!(player_id = %player_id, "Nothing to save"),
                Err(e) => tracing::warn!(player_id = %player_id, error = %e, "save rejected"),
            },
            Command::Show { player_id } => show(self.player_data(player_id), player_id),
            Command::Quit => {}
        }
    }

    fn after_tick(&mut self) {
        log_events(self.drain_events());
    }
}

fn show(view: PlayerDataView<'_>, player_id: rpgvault_types::PlayerId) {
    match view {
        PlayerDataView::Ready(record) => {
            let data = record.data();
            info!(
                player_id = %player_id,
                name = %data.name,
                level = data.level(),
                experience = data.experience(),
                currency = data.currency(),
                items = data.inventory.items().len(),
                revision = record.revision(),
                dirty = record.is_dirty(),
                "Player record"
            );
        }
        PlayerDataView::NotReady => info!(player_id = %player_id, "Player record is loading"),
        PlayerDataView::Offline => info!(player_id = %player_id, "Player is offline"),
    }
}

fn log_events(events: Vec<CoordinatorEvent>) {
    for event in events {
        match event {
            CoordinatorEvent::PlayerReady {
                player_id,
                session,
                created,
            } => info!(player_id = %player_id, session = %session, created, "Player ready"),
            CoordinatorEvent::LoadFailed {
                player_id, error, ..
            } => tracing::error!(player_id = %player_id, error = %error, "Player playing on a temporary record"),
            CoordinatorEvent::SessionEnded { player_id, clean } => {
                info!(player_id = %player_id, clean, "Session ended");
            }
            CoordinatorEvent::LevelUp {
                player_id,
                from,
                to,
            } => info!(player_id = %player_id, from, to, "Level up"),
            CoordinatorEvent::ShutdownComplete(report) => info!(
                saved = report.saved,
                failed = report.failed,
                unfinished = report.unfinished,
                clean = report.is_clean(),
                "Shutdown flush report"
            ),
        }
    }
}
