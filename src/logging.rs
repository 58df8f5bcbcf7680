//! Structured logging: console plus a daily rolling file.

use std::fs;
use std::path::{Path, PathBuf};
use tracing::warn;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Rolled files are named `fuel-sync.YYYY-MM-DD`.
pub const LOG_FILE_PREFIX: &str = "fuel-sync";

/// Maximum number of log files kept by [`prune_old_logs`].
pub const MAX_LOG_FILES: usize = 14;

/// Initialise the global subscriber. The returned guard flushes the file
/// writer when dropped and must live as long as the process logs.
pub fn init_logging(log_dir: &Path) -> WorkerGuard {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,fuel_order_sync_lib=debug"));

    if let Err(e) = fs::create_dir_all(log_dir) {
        eprintln!("failed to create log dir {}: {e}", log_dir.display());
    }

    let file_appender = tracing_appender::rolling::daily(log_dir, LOG_FILE_PREFIX);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_target(true);
    let console_layer = fmt::layer().with_target(true);
    // A second initialisation (tests, embedding) keeps the first subscriber.
    let _ = tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .try_init();

    guard
}

/// Remove rolled log files beyond the newest `keep`. Returns how many were
/// deleted.
pub fn prune_old_logs(log_dir: &Path, keep: usize) -> usize {
    if !log_dir.exists() {
        return 0;
    }

    let mut log_files: Vec<(PathBuf, std::time::SystemTime)> = Vec::new();
    if let Ok(entries) = fs::read_dir(log_dir) {
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let is_log = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|name| name.starts_with(LOG_FILE_PREFIX));
            if is_log {
                let modified = entry
                    .metadata()
                    .ok()
                    .and_then(|m| m.modified().ok())
                    .unwrap_or(std::time::UNIX_EPOCH);
                log_files.push((path, modified));
            }
        }
    }

    // Newest first
    log_files.sort_by(|a, b| b.1.cmp(&a.1));

    let mut removed = 0;
    for (path, _) in log_files.iter().skip(keep) {
        match fs::remove_file(path) {
            Ok(()) => removed += 1,
            Err(e) => warn!("Failed to remove old log {}: {e}", path.display()),
        }
    }
    removed
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prune_keeps_newest_and_ignores_other_files() {
        let dir = std::env::temp_dir().join(format!("fuel-sync-logs-{}", uuid::Uuid::new_v4()));
        fs::create_dir_all(&dir).unwrap();
        for day in 1..=4 {
            let path = dir.join(format!("{LOG_FILE_PREFIX}.2026-10-0{day}"));
            fs::write(&path, "log").unwrap();
            let mtime = std::time::UNIX_EPOCH + std::time::Duration::from_secs(1_000 * day);
            fs::File::options()
                .write(true)
                .open(&path)
                .unwrap()
                .set_modified(mtime)
                .unwrap();
        }
        fs::write(dir.join("notes.txt"), "keep me").unwrap();

        assert_eq!(prune_old_logs(&dir, 2), 2);
        assert!(dir.join(format!("{LOG_FILE_PREFIX}.2026-10-04")).exists());
        assert!(dir.join(format!("{LOG_FILE_PREFIX}.2026-10-03")).exists());
        assert!(!dir.join(format!("{LOG_FILE_PREFIX}.2026-10-01")).exists());
        assert!(dir.join("notes.txt").exists());

        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn prune_on_missing_dir_is_a_noop() {
        let dir = std::env::temp_dir().join(format!("fuel-sync-missing-{}", uuid::Uuid::new_v4()));
        assert_eq!(prune_old_logs(&dir, 1), 0);
    }
}
