//! File-based logging.
//!
//! Every component writes to its own daily rolling file besides the root
//! `quince.log`:
//!
//! | Log File           | Component                     | Target Prefixes                 |
//! |--------------------|-------------------------------|---------------------------------|
//! | quince.log         | Root logger (all components)  | (all)                           |
//! | config-server.log  | Config cache and long polling | quince_config, quince_server::api |
//! | remote.log         | Connections and ejection      | quince_core                     |
//! | plugin-control.log | TPS and connection control    | quince_control                  |
//!
//! Log files are stored in `~/quince/logs` by default.
//! Override with `QUINCE_LOG_DIR` or `quince.logs.path`.

use std::path::PathBuf;

use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::filter::{LevelFilter, Targets};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry, fmt};

use quince_core::Configuration;

struct ComponentLogDef {
    file_name: &'static str,
    /// Target module prefixes routed to this file
    targets: &'static [&'static str],
}

const ROOT_LOG: &str = "quince.log";

const COMPONENT_LOGS: &[ComponentLogDef] = &[
    ComponentLogDef {
        file_name: "config-server.log",
        targets: &["quince_config", "quince_server::api"],
    },
    ComponentLogDef {
        file_name: "remote.log",
        targets: &["quince_core"],
    },
    ComponentLogDef {
        file_name: "plugin-control.log",
        targets: &["quince_control"],
    },
];

/// Log rotation policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogRotation {
    Daily,
    Hourly,
    Never,
}

impl From<LogRotation> for Rotation {
    fn from(rotation: LogRotation) -> Self {
        match rotation {
            LogRotation::Daily => Rotation::DAILY,
            LogRotation::Hourly => Rotation::HOURLY,
            LogRotation::Never => Rotation::NEVER,
        }
    }
}

impl LogRotation {
    fn parse(value: &str) -> Self {
        match value.to_ascii_lowercase().as_str() {
            "hourly" => LogRotation::Hourly,
            "never" => LogRotation::Never,
            _ => LogRotation::Daily,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub log_dir: PathBuf,
    pub console_output: bool,
    pub console_level: Level,
    pub file_logging: bool,
    pub file_level: Level,
    pub rotation: LogRotation,
}

fn default_log_dir() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(format!("{}/quince/logs", home))
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_dir: default_log_dir(),
            console_output: true,
            console_level: Level::INFO,
            file_logging: true,
            file_level: Level::INFO,
            rotation: LogRotation::Daily,
        }
    }
}

impl LoggingConfig {
    /// Create from application configuration.
    pub fn from_configuration(configuration: &Configuration) -> Self {
        let config = &configuration.config;
        let level = config
            .get_string("quince.logs.level")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(Level::INFO);
        let file_level = config
            .get_string("quince.logs.file-level")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(level);

        Self {
            log_dir: config
                .get_string("quince.logs.path")
                .map(PathBuf::from)
                .unwrap_or_else(|_| default_log_dir()),
            console_output: config.get_bool("quince.logs.console").unwrap_or(true),
            console_level: level,
            file_logging: config.get_bool("quince.logs.file").unwrap_or(true),
            file_level,
            rotation: config
                .get_string("quince.logs.rotation")
                .map(|v| LogRotation::parse(&v))
                .unwrap_or(LogRotation::Daily),
        }
    }
}

/// Keeps the non-blocking file writers alive; dropping it flushes them.
pub struct LoggingGuard {
    _file_guards: Vec<WorkerGuard>,
}

/// Install the global subscriber.
///
/// `RUST_LOG` overrides the console and root file levels. Component files
/// take everything their targets emit.
pub fn init_logging(config: &LoggingConfig) -> anyhow::Result<LoggingGuard> {
    if config.file_logging {
        std::fs::create_dir_all(&config.log_dir)?;
    }

    let mut guards: Vec<WorkerGuard> = Vec::new();
    let mut layers: Vec<Box<dyn Layer<Registry> + Send + Sync>> = Vec::new();

    if config.console_output {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(config.console_level.to_string()));
        let console_layer = fmt::layer()
            .with_target(true)
            .with_thread_names(true)
            .with_filter(filter);
        layers.push(Box::new(console_layer));
    }

    if config.file_logging {
        let root_appender = RollingFileAppender::new(config.rotation.into(), &config.log_dir, ROOT_LOG);
        let (root_nb, root_guard) = tracing_appender::non_blocking(root_appender);
        guards.push(root_guard);

        let root_filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(config.file_level.to_string()));
        let root_layer = fmt::layer()
            .with_writer(root_nb)
            .with_target(true)
            .with_thread_names(true)
            .with_ansi(false)
            .with_filter(root_filter);
        layers.push(Box::new(root_layer));

        for component in COMPONENT_LOGS {
            let appender = RollingFileAppender::new(
                config.rotation.into(),
                &config.log_dir,
                component.file_name,
            );
            let (nb, guard) = tracing_appender::non_blocking(appender);
            guards.push(guard);

            let mut targets = Targets::new();
            for target in component.targets {
                targets = targets.with_target(*target, LevelFilter::from_level(config.file_level));
            }

            let layer = fmt::layer()
                .with_writer(nb)
                .with_target(true)
                .with_thread_names(true)
                .with_ansi(false)
                .with_filter(targets);
            layers.push(Box::new(layer));
        }
    }

    Registry::default()
        .with(layers)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to initialize logging: {}", e))?;

    if config.file_logging {
        tracing::info!(
            log_dir = %config.log_dir.display(),
            component_files = COMPONENT_LOGS.len(),
            "File logging initialized"
        );
    }

    Ok(LoggingGuard {
        _file_guards: guards,
    })
}
