use std::path::{Path, PathBuf};

use anyhow::Context;
use glob::glob;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{Builder, Rotation};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

/// Maps a configured level name to a filter directive. Unknown names fall
/// back to `info`; `fatal` and `silly` are accepted as aliases.
pub fn level_directive(level: &str) -> &'static str {
    match level.trim().to_ascii_lowercase().as_str() {
        "silly" | "trace" => "trace",
        "debug" => "debug",
        "warn" | "warning" => "warn",
        "error" | "fatal" => "error",
        "off" => "off",
        _ => "info",
    }
}

/// Removes all but the newest log file of `app_name` in `log_dir`.
///
/// Log file names embed their date, so the lexically greatest is the newest.
pub fn rotate_logs(app_name: &str, log_dir: &Path) -> usize {
    let pattern = format!("{}/{}.*.log", log_dir.display(), app_name);
    let Ok(entries) = glob(&pattern) else {
        return 0;
    };
    let mut log_files: Vec<PathBuf> = entries.flatten().collect();
    log_files.sort_by(|a, b| b.file_name().cmp(&a.file_name()));

    let mut removed = 0;
    for old_file in log_files.iter().skip(1) {
        match std::fs::remove_file(old_file) {
            Ok(()) => removed += 1,
            Err(e) => eprintln!("Error deleting old log file {}: {}", old_file.display(), e),
        }
    }
    removed
}

/// Installs the global subscriber: console output plus, when `log_dir` is
/// given, a daily file `<app_name>.<date>.log` written off-thread.
///
/// `RUST_LOG` overrides `level`. Keep the returned guard alive for as long
/// as file output is wanted; dropping it flushes and stops the writer.
pub fn init_logging(app_name: &str, log_dir: Option<&Path>, level: &str) -> anyhow::Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level_directive(level)));
    let console = fmt::layer().with_target(true);

    let Some(dir) = log_dir else {
        tracing_subscriber::registry()
            .with(filter)
            .with(console)
            .try_init()
            .context("a global subscriber is already installed")?;
        return Ok(None);
    };

    std::fs::create_dir_all(dir).with_context(|| format!("creating log directory {}", dir.display()))?;
    rotate_logs(app_name, dir);

    let appender = Builder::new()
        .rotation(Rotation::DAILY)
        .filename_prefix(app_name)
        .filename_suffix("log")
        .build(dir)
        .with_context(|| format!("opening log file in {}", dir.display()))?;
    let (writer, guard) = tracing_appender::non_blocking(appender);

    tracing_subscriber::registry()
        .with(filter)
        .with(console)
        .with(fmt::layer().with_ansi(false).with_writer(writer))
        .try_init()
        .context("a global subscriber is already installed")?;

    Ok(Some(guard))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_names() {
        assert_eq!(level_directive("Fatal"), "error");
        assert_eq!(level_directive("debug"), "debug");
        assert_eq!(level_directive("loud"), "info");
    }

    #[test]
    fn only_the_newest_log_survives() {
        let dir = tempfile::tempdir().unwrap();
        for name in [
            "livesync.2025-07-18.log",
            "livesync.2025-07-20.log",
            "livesync.2025-07-19.log",
            "other.2025-07-01.log",
        ] {
            std::fs::write(dir.path().join(name), "x").unwrap();
        }

        assert_eq!(rotate_logs("livesync", dir.path()), 2);
        assert!(dir.path().join("livesync.2025-07-20.log").exists());
        assert!(!dir.path().join("livesync.2025-07-18.log").exists());
        assert!(dir.path().join("other.2025-07-01.log").exists());
    }
}
