use anyhow::{Context, Result};
use std::fs;
use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{
    fmt::{self},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

/// Configuration for console and file logging
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub log_dir: String,
    pub enable_console: bool,
    pub enable_file: bool,
    pub log_level: Level,
    pub enable_json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_dir: "logs".to_string(),
            enable_console: true,
            enable_file: false,
            log_level: Level::INFO,
            enable_json: false,
        }
    }
}

impl LoggingConfig {
    /// `LOG_DIR` turns on the daily file log, `LOG_FORMAT=json` switches
    /// the console to JSON lines.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(dir) = std::env::var("LOG_DIR") {
            if !dir.trim().is_empty() {
                config.log_dir = dir;
                config.enable_file = true;
            }
        }
        config.enable_json = std::env::var("LOG_FORMAT")
            .map(|f| f.eq_ignore_ascii_case("json"))
            .unwrap_or(false);
        config
    }

    fn default_filter(&self) -> String {
        format!(
            "chat_consistency={level},sqlx=warn,rdkafka=warn,tower_http=info",
            level = self.log_level
        )
    }
}

/// Installs the global subscriber. `RUST_LOG` overrides the default filter.
///
/// The returned guards flush the file writer when dropped, so `main` has to
/// keep them alive until shutdown.
pub fn init_logging(config: LoggingConfig) -> Result<Vec<WorkerGuard>> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.default_filter()));

    let mut guards = Vec::new();
    let mut layers: Vec<Box<dyn Layer<_> + Send + Sync>> = Vec::new();

    if config.enable_console {
        let console_layer = fmt::layer()
            .with_target(true)
            .with_thread_ids(true)
            .with_line_number(true)
            .with_level(true);
        if config.enable_json {
            layers.push(Box::new(console_layer.json()));
        } else {
            layers.push(Box::new(console_layer.with_ansi(true)));
        }
    }

    if config.enable_file {
        fs::create_dir_all(&config.log_dir)
            .with_context(|| format!("Failed to create log directory {}", config.log_dir))?;

        let appender =
            RollingFileAppender::new(Rotation::DAILY, &config.log_dir, "chat-consistency.log");
        let (writer, guard) = tracing_appender::non_blocking(appender);
        guards.push(guard);

        let file_layer = fmt::layer()
            .with_writer(writer)
            .with_target(true)
            .with_thread_ids(true)
            .with_file(true)
            .with_line_number(true)
            .with_ansi(false);
        layers.push(Box::new(file_layer));

        let error_appender = RollingFileAppender::new(Rotation::DAILY, &config.log_dir, "error.log");
        let (error_writer, error_guard) = tracing_appender::non_blocking(error_appender);
        guards.push(error_guard);

        let error_layer = fmt::layer()
            .with_writer(error_writer)
            .with_target(true)
            .with_file(true)
            .with_line_number(true)
            .with_ansi(false)
            .with_filter(tracing_subscriber::filter::LevelFilter::ERROR);
        layers.push(Box::new(error_layer));
    }

    tracing_subscriber::registry()
        .with(env_filter)
        .with(layers)
        .try_init()
        .context("Failed to install tracing subscriber")?;

    Ok(guards)
}
