//! Config service routing
//!
//! Routes:
//! - GET /v1/cs/configs - Get config
//! - POST /v1/cs/configs - Publish config
//! - DELETE /v1/cs/configs - Delete config
//! - POST /v1/cs/configs/listener - Long poll for config changes
//! - GET /v1/cs/configs/listener - Pending long polls by config or client ip

use actix_web::{Scope, web};

use super::{config, listener};

pub fn routes() -> Scope {
    web::scope("/v1/cs").service(
        web::scope("/configs")
            .service(listener::config_listener)
            .service(listener::listener_state)
            .service(config::get_config)
            .service(config::publish_config)
            .service(config::delete_config),
    )
}
