//! Structured logging for weave.
//!
//! All modules log through `tracing`. This module only wires the
//! subscriber: events go to `~/.weave/weave.log`, truncated on startup.
//!
//! Levels:
//! - ERROR: failures that abort a round or the whole run
//! - WARN: recoverable problems (abandoned agents, failed cleanup)
//! - INFO: round, node and task lifecycle
//! - DEBUG: dispatch decisions, git operations, agent prompts
//! - TRACE: poll ticks and channel traffic
//!
//! Debug mode can be enabled with `--debug` or `WEAVE_DEBUG=1`. `RUST_LOG`
//! overrides the level filter entirely.

use std::fs::File;
use std::path::PathBuf;
use std::sync::OnceLock;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

static LOG_GUARD: OnceLock<WorkerGuard> = OnceLock::new();
static LOG_PATH: OnceLock<PathBuf> = OnceLock::new();

/// Initialize logging with explicit debug mode setting.
pub fn init_with_debug(debug: bool) {
    let debug_enabled = debug || env_debug();

    let Some(weave_dir) = dirs::home_dir().map(|h| h.join(".weave")) else {
        return;
    };
    let _ = std::fs::create_dir_all(&weave_dir);
    let path = weave_dir.join("weave.log");

    // Truncate file on startup
    let Ok(file) = File::create(&path) else {
        return;
    };
    let _ = LOG_PATH.set(path);

    let (writer, guard) = tracing_appender::non_blocking(file);
    if LOG_GUARD.set(guard).is_err() {
        // Already initialized
        return;
    }

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(debug_enabled)));

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_target(false),
        )
        .try_init();
}

/// Path of the active log file, if logging was initialized.
pub fn log_path() -> Option<&'static PathBuf> {
    LOG_PATH.get()
}

fn env_debug() -> bool {
    std::env::var("WEAVE_DEBUG")
        .map(|v| v == "1" || v.to_lowercase() == "true")
        .unwrap_or(false)
}

fn default_directive(debug: bool) -> &'static str {
    if debug {
        "weave=debug"
    } else {
        "weave=info"
    }
}
