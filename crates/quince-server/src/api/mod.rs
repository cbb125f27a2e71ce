// HTTP API for config reads, publishing, and long polling

pub mod config;
pub mod listener;
pub mod model;
pub mod route;

use std::net::SocketAddr;

use actix_web::HttpRequest;

/// Client ip of a request without the port.
pub(crate) fn client_ip(req: &HttpRequest) -> String {
    let info = req.connection_info();
    let addr = info.realip_remote_addr().unwrap_or("unknown");
    match addr.parse::<SocketAddr>() {
        Ok(socket) => socket.ip().to_string(),
        Err(_) => addr.to_string(),
    }
}
