use std::path::Path;

use anyhow::Context;
use once_cell::sync::OnceCell;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

pub const LOG_ENV: &str = "SITEPORT_LOG";
pub const DEFAULT_FILTER: &str = "siteport=info,sqlx=warn";
const LOG_FILE_PREFIX: &str = "siteport.log";

static INSTALLED: OnceCell<()> = OnceCell::new();

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
}

/// Installs the JSON stderr subscriber. Later calls are no-ops.
pub fn init() {
    INSTALLED.get_or_init(|| {
        let _ = tracing_log::LogTracer::init();
        let stderr = fmt::layer()
            .json()
            .with_target(true)
            .with_timer(UtcTime::rfc_3339())
            .with_writer(std::io::stderr)
            .with_filter(env_filter());
        let _ = tracing_subscriber::registry().with(stderr).try_init();
    });
}

/// Installs the stderr subscriber plus a daily rolling JSON file under `dir`.
///
/// The returned guard flushes the non-blocking writer on drop and must live
/// as long as the process logs. When a subscriber is already installed the
/// file sink is not attached and `None` is returned.
pub fn init_file_logging(dir: &Path) -> anyhow::Result<Option<WorkerGuard>> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("create log directory {}", dir.display()))?;
    if INSTALLED.get().is_some() {
        return Ok(None);
    }

    let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
    let (writer, guard) = tracing_appender::non_blocking(appender);

    let mut attached = false;
    INSTALLED.get_or_init(|| {
        let _ = tracing_log::LogTracer::init();
        let stderr = fmt::layer()
            .json()
            .with_target(true)
            .with_timer(UtcTime::rfc_3339())
            .with_writer(std::io::stderr)
            .with_filter(env_filter());
        let file = fmt::layer()
            .json()
            .with_target(true)
            .with_ansi(false)
            .with_timer(UtcTime::rfc_3339())
            .with_writer(writer)
            .with_filter(env_filter());
        attached = tracing_subscriber::registry()
            .with(stderr)
            .with(file)
            .try_init()
            .is_ok();
    });

    if attached {
        tracing::debug!(target: "siteport", event = "file_logging_ready", dir = %dir.display());
        Ok(Some(guard))
    } else {
        Ok(None)
    }
}
