//! Configuration loading
//!
//! Sources, lowest precedence first: `conf/application.yml`, `QUINCE_`
//! environment variables (`QUINCE_SERVER_MAIN_PORT` sets
//! `quince.server.main.port`), then command line flags.

use clap::Parser;
use config::{Config, Environment};

use quince_core::Configuration;

/// Command line arguments for the server
#[derive(Debug, Default, Parser)]
#[command(name = "quince-server", version, about)]
pub struct Cli {
    #[arg(short = 'c', long = "config", default_value = "conf/application.yml")]
    pub config_file: String,
    #[arg(short = 'p', long = "port")]
    pub port: Option<u16>,
    #[arg(long = "data-dir")]
    pub data_dir: Option<String>,
    #[arg(long = "log-dir", env = "QUINCE_LOG_DIR")]
    pub log_dir: Option<String>,
}

pub fn load_configuration(cli: &Cli) -> anyhow::Result<Configuration> {
    let mut builder = Config::builder()
        .add_source(config::File::with_name(&cli.config_file).required(false))
        .add_source(
            Environment::with_prefix("quince")
                .prefix_separator("_")
                .separator("_")
                .keep_prefix(true)
                .try_parsing(true),
        );

    if let Some(port) = cli.port {
        builder = builder.set_override("quince.server.main.port", i64::from(port))?;
    }
    if let Some(dir) = &cli.data_dir {
        builder = builder.set_override("quince.data.dir", dir.as_str())?;
    }
    if let Some(dir) = &cli.log_dir {
        builder = builder.set_override("quince.logs.path", dir.as_str())?;
    }

    Ok(Configuration::from_config(builder.build()?))
}
