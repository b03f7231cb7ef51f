//! Logging setup: daily log file with 7-day cleanup plus stderr

use anyhow::Result;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

const LOG_RETENTION_DAYS: u64 = 7;
const LOG_PREFIX: &str = "gauguin";

pub struct LogManager {
    log_dir: PathBuf,
}

impl LogManager {
    pub fn new(log_dir: PathBuf) -> Self {
        Self { log_dir }
    }

    pub fn current_log_path(&self) -> PathBuf {
        let today = chrono::Local::now().format("%Y-%m-%d");
        self.log_dir.join(format!("{}.{}.log", LOG_PREFIX, today))
    }

    fn is_log_file(path: &Path) -> bool {
        path.file_name()
            .and_then(|n| n.to_str())
            .map(|name| name.starts_with(LOG_PREFIX) && name.ends_with(".log"))
            .unwrap_or(false)
    }

    /// Removes our log files last modified before `cutoff`; returns how many went.
    pub fn cleanup_before(&self, cutoff: SystemTime) -> Result<usize> {
        let mut deleted = 0;
        for entry in fs::read_dir(&self.log_dir)? {
            let entry = entry?;
            let path = entry.path();
            if !path.is_file() || !Self::is_log_file(&path) {
                continue;
            }
            if entry.metadata()?.modified()? >= cutoff {
                continue;
            }
            match fs::remove_file(&path) {
                Ok(()) => deleted += 1,
                Err(e) => eprintln!("Failed to delete old log {}: {}", path.display(), e),
            }
        }
        Ok(deleted)
    }

    pub fn cleanup_old_logs(&self) -> Result<usize> {
        let cutoff = SystemTime::now() - Duration::from_secs(LOG_RETENTION_DAYS * 24 * 60 * 60);
        self.cleanup_before(cutoff)
    }
}

pub struct LoggingGuard {
    _guard: Option<WorkerGuard>,
}

fn env_filter(log_level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::try_new(log_level).unwrap_or_else(|_| EnvFilter::new("info"))
    })
}

/// File + stderr logging for the long-running server.
pub fn init_logging(log_dir: &Path, log_level: &str) -> Result<LoggingGuard> {
    fs::create_dir_all(log_dir)?;
    let manager = LogManager::new(log_dir.to_path_buf());
    let cleaned = manager.cleanup_old_logs()?;

    let file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(manager.current_log_path())?;
    let (non_blocking, guard) = tracing_appender::non_blocking(file);

    let file_layer = fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_target(true)
        .with_line_number(true)
        .with_filter(env_filter(log_level));

    let stderr_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_filter(env_filter(log_level));

    tracing_subscriber::registry()
        .with(file_layer)
        .with(stderr_layer)
        .try_init()?;

    if cleaned > 0 {
        tracing::info!("Cleaned up {} old log file(s)", cleaned);
    }
    Ok(LoggingGuard {
        _guard: Some(guard),
    })
}

/// Stderr only, for one-shot commands.
pub fn init_stderr_logging(log_level: &str) -> Result<LoggingGuard> {
    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false)
                .with_filter(env_filter(log_level)),
        )
        .try_init()?;
    Ok(LoggingGuard { _guard: None })
}

#[cfg(test)]
mod tests {
    use super::LogManager;
    use std::fs;
    use std::time::{Duration, SystemTime, UNIX_EPOCH};

    fn temp_log_dir() -> std::path::PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system time")
            .as_nanos();
        let dir = std::env::temp_dir().join(format!("gauguin-logs-{}", nanos));
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn current_log_path_is_dated() {
        let manager = LogManager::new("/var/log/gauguin".into());
        let name = manager
            .current_log_path()
            .file_name()
            .and_then(|n| n.to_str())
            .map(str::to_string)
            .unwrap();
        assert!(name.starts_with("gauguin."));
        assert!(name.ends_with(".log"));
        assert_eq!(name.len(), "gauguin.2024-01-01.log".len());
    }

    #[test]
    fn cleanup_only_touches_our_log_files() {
        let dir = temp_log_dir();
        fs::write(dir.join("gauguin.2024-01-01.log"), "old").unwrap();
        fs::write(dir.join("other.log"), "foreign").unwrap();
        fs::write(dir.join("gauguin.db"), "db").unwrap();

        let manager = LogManager::new(dir.clone());
        let future = SystemTime::now() + Duration::from_secs(60);
        assert_eq!(manager.cleanup_before(future).unwrap(), 1);
        assert!(!dir.join("gauguin.2024-01-01.log").exists());
        assert!(dir.join("other.log").exists());
        assert!(dir.join("gauguin.db").exists());
    }

    #[test]
    fn fresh_logs_survive_retention_cleanup() {
        let dir = temp_log_dir();
        fs::write(dir.join("gauguin.2024-01-02.log"), "new").unwrap();
        let manager = LogManager::new(dir.clone());
        assert_eq!(manager.cleanup_old_logs().unwrap(), 0);
        assert!(dir.join("gauguin.2024-01-02.log").exists());
    }
}
