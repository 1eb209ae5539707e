//! Structured logging for forge.
//!
//! Log levels:
//! - ERROR: Failures that halt a project (fatal task, dependency cycle)
//! - WARN: Recoverable conditions (retries, missed heartbeats, handler errors)
//! - INFO: Stage transitions, dispatches, registrations
//! - DEBUG: Scheduling passes, bus deliveries, ignored duplicate events
//! - TRACE: Per-message traces
//!
//! Debug mode can be enabled with `--debug` flag or `FORGE_DEBUG=1` env var.
//! `FORGE_LOG` takes a full `EnvFilter` directive and wins over both.

use std::fs::File;
use std::path::PathBuf;
use std::sync::Mutex;

use tracing_subscriber::EnvFilter;

/// Environment variable that enables debug logging.
pub const DEBUG_ENV: &str = "FORGE_DEBUG";

/// Environment variable holding an explicit filter directive.
pub const FILTER_ENV: &str = "FORGE_LOG";

/// Initialize logging to ~/.forge/forge.log
pub fn init() {
    init_with_debug(false);
}

/// Initialize logging with explicit debug mode setting.
///
/// Safe to call more than once; only the first call installs a subscriber.
pub fn init_with_debug(debug: bool) {
    let debug_enabled = debug || env_debug();
    let filter = std::env::var(FILTER_ENV)
        .ok()
        .and_then(|directive| EnvFilter::try_new(directive).ok())
        .unwrap_or_else(|| EnvFilter::new(default_directive(debug_enabled)));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_ansi(false);

    // Truncate file on startup
    match log_path().and_then(|path| File::create(path).ok()) {
        Some(file) => {
            let _ = builder.with_writer(Mutex::new(file)).try_init();
        }
        None => {
            let _ = builder.with_writer(std::io::stderr).try_init();
        }
    }
}

/// Check whether the environment requests debug mode.
pub fn env_debug() -> bool {
    std::env::var(DEBUG_ENV)
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

/// Filter directive used when `FORGE_LOG` is not set.
pub fn default_directive(debug: bool) -> &'static str {
    if debug {
        "forge=debug"
    } else {
        "forge=info"
    }
}

fn log_path() -> Option<PathBuf> {
    let forge_dir = dirs::home_dir()?.join(".forge");
    std::fs::create_dir_all(&forge_dir).ok()?;
    Some(forge_dir.join("forge.log"))
}
