use anyhow::{Context, Result};
use chrono::{Days, Local, NaiveDate};
use std::{
    env,
    fs::{self, OpenOptions},
    io,
    path::{Path, PathBuf},
    sync::Mutex,
};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Console at `RUST_LOG` (default info) plus a dated debug log file in `log_dir`.
pub fn init(log_dir: &Path, retention_days: u32) -> Result<PathBuf> {
    fs::create_dir_all(log_dir)
        .with_context(|| format!("creating log directory {}", log_dir.display()))?;
    let today = Local::now().date_naive();
    let removed = clean_old_logs(log_dir, retention_days, today)?;

    let log_file = log_dir.join(format!("{today}.log"));
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_file)
        .with_context(|| format!("opening {}", log_file.display()))?;

    tracing_subscriber::registry()
        .with(
            fmt::layer().with_filter(EnvFilter::new(
                env::var("RUST_LOG").unwrap_or_else(|_| "attempt_loader=info".into()),
            )),
        )
        .with(
            fmt::layer()
                .with_ansi(false)
                .with_writer(Mutex::new(file))
                .with_filter(EnvFilter::new("attempt_loader=debug")),
        )
        .init();

    tracing::info!(log_file = %log_file.display(), "logging initialized");
    for path in removed {
        tracing::debug!(path = %path.display(), "old log removed");
    }
    Ok(log_file)
}

/// Deletes `<YYYY-MM-DD>.log` files dated `retention_days` or more before `today`.
pub fn clean_old_logs(dir: &Path, retention_days: u32, today: NaiveDate) -> io::Result<Vec<PathBuf>> {
    let cutoff = today
        .checked_sub_days(Days::new(u64::from(retention_days)))
        .unwrap_or(NaiveDate::MIN);
    let mut removed = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) != Some("log") {
            continue;
        }
        let dated = path
            .file_stem()
            .and_then(|s| s.to_str())
            .and_then(|s| NaiveDate::parse_from_str(s, "%Y-%m-%d").ok());
        if matches!(dated, Some(d) if d <= cutoff) {
            fs::remove_file(&path)?;
            removed.push(path);
        }
    }
    Ok(removed)
}
