use std::fs;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use crate::{
    config::{LogLevel, LoggingConfig},
    errors::Error,
    Result,
};

/// Keeps the non-blocking file writer alive. Hold it until shutdown.
#[must_use = "dropping the guard stops the background log writer"]
pub struct LogGuard {
    _file: Option<WorkerGuard>,
}

/// Initialize logging/tracing for the bot from the `logging` config section.
///
/// `RUST_LOG` overrides the configured level. With both console and file
/// output disabled no subscriber is installed and the bot runs silently.
pub fn init(service_name: &str, cfg: &LoggingConfig) -> Result<LogGuard> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directives(service_name, cfg.level)));

    let mut layers = Vec::new();

    if cfg.console_logging.enabled {
        layers.push(fmt::layer().with_target(false).with_ansi(true).boxed());
    }

    let guard = if cfg.file_logging.enabled {
        let path = &cfg.file_logging.filepath;
        let file_name = path
            .file_name()
            .ok_or_else(|| Error::Logging(format!("not a file path: {}", path.display())))?;
        let dir = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => std::path::PathBuf::from("."),
        };
        fs::create_dir_all(&dir)?;

        let appender = tracing_appender::rolling::never(&dir, file_name);
        let (writer, guard) = tracing_appender::non_blocking(appender);
        layers.push(fmt::layer().with_writer(writer).with_ansi(false).boxed());
        Some(guard)
    } else {
        None
    };

    if layers.is_empty() {
        return Ok(LogGuard { _file: guard });
    }

    tracing_subscriber::registry()
        .with(filter)
        .with(layers)
        .try_init()
        .map_err(|e| Error::Logging(e.to_string()))?;

    Ok(LogGuard { _file: guard })
}

/// Configured level for our crates; HTTP internals stay at warn unless debugging them explicitly.
fn default_directives(service_name: &str, level: LogLevel) -> String {
    let lvl = level.as_directive();
    let service = service_name.replace('-', "_");
    format!("{lvl},{service}={lvl},jose_core={lvl},jose_matrix={lvl},hyper=warn,reqwest=warn")
}
