//! Main entry point for the Quince server.

use std::sync::Arc;

use clap::Parser;
use tracing::info;

use quince_config::{MemoryConfigRepository, ProcessExitHandler};
use quince_server::{
    model::{
        app_state::AppState,
        config::{Cli, load_configuration},
    },
    startup::{self, LoggingConfig},
};

#[actix_web::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let configuration = load_configuration(&cli)?;

    let _logging_guard = startup::init_logging(&LoggingConfig::from_configuration(&configuration))?;

    let server_address = configuration.server_address();
    let server_main_port = configuration.server_main_port();

    let app_state = Arc::new(AppState::build(
        configuration,
        Arc::new(MemoryConfigRepository::new()),
        Arc::new(ProcessExitHandler),
    ));
    let _background_tasks = app_state.start().await?;

    info!(
        address = %server_address,
        port = server_main_port,
        version = %app_state.configuration.version(),
        "Starting Quince server"
    );

    startup::main_server(app_state, server_address, server_main_port)?.await?;

    Ok(())
}
