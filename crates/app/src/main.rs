use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use crossbeam_channel::{Receiver, RecvTimeoutError};
use drift_sync_core::config::DEFAULT_CONFIG_PATH;
use drift_sync_core::{AppConfig, LogRotation, LoggingConfig, PatternStore, Session, SessionMode};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

const FEEDBACK_INTERVAL: Duration = Duration::from_secs(1);

fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(err) => {
            let console_only = LoggingConfig {
                file: String::new(),
                ..LoggingConfig::default()
            };
            let _log_guard = init_tracing(cli.debug, &console_only);
            tracing::error!(error = %err, "failed to load configuration");
            return ExitCode::FAILURE;
        }
    };
    let _log_guard = init_tracing(cli.debug, &config.logging);

    let interrupts = interrupt_channel();
    match run(&cli, &config, &interrupts) {
        Ok(_) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!(error = %err, "session aborted");
            ExitCode::FAILURE
        }
    }
}

fn load_config(cli: &Cli) -> drift_sync_core::Result<AppConfig> {
    match &cli.config {
        Some(path) => AppConfig::load(path, &cli.overrides),
        None => AppConfig::load_or_default(Path::new(DEFAULT_CONFIG_PATH), &cli.overrides),
    }
}

/// Routes Ctrl-C into a channel. Without a handler the returned receiver
/// never fires, so the session runs until killed.
fn interrupt_channel() -> Receiver<()> {
    let (interrupt_tx, interrupts) = crossbeam_channel::bounded::<()>(1);
    match ctrlc::set_handler(move || {
        let _ = interrupt_tx.try_send(());
    }) {
        Ok(()) => interrupts,
        Err(err) => {
            tracing::warn!(error = %err, "could not install Ctrl-C handler");
            crossbeam_channel::never()
        }
    }
}

/// Runs one session until `interrupts` fires. Returns the stopped session,
/// or `None` when interrupted during the drift safety delay.
fn run(
    cli: &Cli,
    config: &AppConfig,
    interrupts: &Receiver<()>,
) -> drift_sync_core::Result<Option<Session>> {
    let mode = SessionMode::from(cli.mode).resolve(config);
    tracing::info!(%mode, pattern = %cli.pattern, "starting drift sync");

    let store = PatternStore::new(&config.patterns.directory);
    let pattern = store.load(&cli.pattern)?;

    if mode == SessionMode::Drift {
        tracing::warn!("drift mode drives a real vehicle, make sure the area is closed and safe");
        let delay = Duration::from_secs(config.safety.warning_delay_secs);
        if interrupted(interrupts, delay) {
            tracing::info!("session interrupted before start");
            return Ok(None);
        }
    }

    let mut session = Session::start(config, mode, pattern)?;

    loop {
        if interrupted(interrupts, FEEDBACK_INTERVAL) {
            tracing::info!("session interrupted by user");
            break;
        }
        if mode == SessionMode::AudioOnly && config.sync.visual_feedback {
            tracing::info!(beat_phase = session.beat_phase(), "beat");
        }
    }

    if let Err(err) = session.stop() {
        tracing::error!(error = %err, "session did not shut down cleanly");
    }
    tracing::info!("session completed");
    Ok(Some(session))
}

/// Waits up to `timeout` for an interrupt.
fn interrupted(interrupts: &Receiver<()>, timeout: Duration) -> bool {
    !matches!(interrupts.recv_timeout(timeout), Err(RecvTimeoutError::Timeout))
}

/// Console logging plus, when configured, a rolling session log file. The
/// returned guard flushes the file writer when dropped.
fn init_tracing(debug: bool, logging: &LoggingConfig) -> Option<WorkerGuard> {
    let fallback = if debug { "debug" } else { logging.level.as_str() };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));

    let (file_layer, guard, file_error) = match session_log(logging) {
        Ok(Some(appender)) => {
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer().with_ansi(false).with_writer(writer);
            (Some(layer), Some(guard), None)
        }
        Ok(None) => (None, None, None),
        Err(err) => (None, None, Some(err)),
    };

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(io::stderr))
        .with(file_layer)
        .try_init();

    if let Some(err) = file_error {
        tracing::warn!(error = %err, "session log file disabled");
    }
    guard
}

fn session_log(logging: &LoggingConfig) -> io::Result<Option<RollingFileAppender>> {
    let Some(path) = logging.file_path() else {
        return Ok(None);
    };
    let directory = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let prefix = path
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "log file has no name"))?;
    fs::create_dir_all(directory)?;

    let rotation = match logging.rotation {
        LogRotation::Minutely => Rotation::MINUTELY,
        LogRotation::Hourly => Rotation::HOURLY,
        LogRotation::Daily => Rotation::DAILY,
        LogRotation::Never => Rotation::NEVER,
    };
    RollingFileAppender::builder()
        .rotation(rotation)
        .filename_prefix(prefix)
        .max_log_files(logging.backup_count + 1)
        .build(directory)
        .map(Some)
        .map_err(|err| io::Error::new(io::ErrorKind::Other, err))
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Beat-synchronised drift choreography", long_about = None)]
struct Cli {
    /// Configuration file. Defaults to `config/default.toml` when present.
    #[arg(short, long)]
    config: Option<PathBuf>,
    /// What the session drives.
    #[arg(short, long, value_enum, default_value_t = ModeArg::Simulation)]
    mode: ModeArg,
    /// Pattern name (looked up in the pattern directory) or path.
    #[arg(short, long, default_value = "basic_drift")]
    pattern: String,
    /// Override a configuration value, e.g. `--set sync.pattern_timing=auto`.
    #[arg(long = "set", value_name = "KEY=VALUE")]
    overrides: Vec<String>,
    /// Enable debug logging.
    #[arg(long)]
    debug: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum ModeArg {
    Drift,
    Simulation,
    AudioOnly,
}

impl From<ModeArg> for SessionMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Drift => SessionMode::Drift,
            ModeArg::Simulation => SessionMode::Simulation,
            ModeArg::AudioOnly => SessionMode::AudioOnly,
        }
    }
}
