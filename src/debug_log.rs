//! Shared debug logging for all three roles.
//!
//! None of the roles can use their standard streams for diagnostics: the
//! local proxy's stderr is the app's error channel, the remote proxy's
//! stdout/stderr carry streams 1 and 2, and the daemon's streams point at
//! the null device. Diagnostics therefore go to an opt-in append-only file.
//!
//! The `tag` parameter identifies the source role or subsystem
//! (e.g. "local", "remote", "daemon", "spawn").

use std::io::Write;
use std::path::PathBuf;
use std::sync::OnceLock;

static LOG_PATH: OnceLock<Option<PathBuf>> = OnceLock::new();

/// Installs the log destination from configuration. The `SSHIM_DEBUG_LOG`
/// environment variable wins over the configured path. Calling more than
/// once keeps the first installation.
pub fn init(configured: Option<PathBuf>) {
    let _ = LOG_PATH.set(resolve(configured));
}

fn resolve(configured: Option<PathBuf>) -> Option<PathBuf> {
    if let Some(path) = std::env::var_os("SSHIM_DEBUG_LOG") {
        return Some(PathBuf::from(path));
    }
    configured
}

/// Appends one timestamped line to the debug log. No-op when logging is
/// not configured; errors while writing are swallowed.
pub fn debug_log(tag: &str, msg: &str) {
    let path = match LOG_PATH.get_or_init(|| resolve(None)) {
        Some(path) => path,
        None => return,
    };
    if let Ok(mut file) = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
    {
        let now = chrono::Local::now().format("%H:%M:%S%.3f");
        let _ = writeln!(file, "[{}] [{}] [{}] {}", now, std::process::id(), tag, msg);
    }
}
