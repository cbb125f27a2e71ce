//! Config listener handlers
//!
//! - POST /v1/cs/configs/listener - Long poll for config changes
//! - GET /v1/cs/configs/listener - Pending long polls by config or client ip

use actix_web::{HttpRequest, HttpResponse, Responder, get, post, web};
use tracing::{debug, info, warn};

use quince_common::{error, group_key};
use quince_config::service::listener::{
    CLIENT_APP_NAME_HEADER, LONG_POLLING_NO_HANG_UP_HEADER, LONG_POLLING_TIMEOUT_HEADER,
    VIPSERVER_TAG_HEADER, encode_changed_groups, parse_listening_configs,
};
use quince_config::{LongPollingRequest, PendingPoll, SubscriberInfo};
use quince_control::{MonitorKey, TpsCheckRequest};

use super::client_ip;
use super::model::{ListenerParam, ListenerStateParam};
use crate::model::app_state::AppState;
use crate::model::constants::CONFIG_LISTEN_POINT;
use crate::model::response::Result;

fn header<'a>(req: &'a HttpRequest, name: &str) -> Option<&'a str> {
    req.headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

fn changed_response(changed: &[String]) -> HttpResponse {
    HttpResponse::Ok()
        .content_type("text/html; charset=UTF-8")
        .insert_header(("Pragma", "no-cache"))
        .insert_header(("Cache-Control", "no-cache,no-store"))
        .body(encode_changed_groups(changed))
}

fn over_threshold(message: String) -> HttpResponse {
    Result::<String>::http_response(503, error::OVER_THRESHOLD.code, message, String::new())
}

/// Listen for configuration changes
///
/// Without a `Long-Pulling-Timeout` header the digests are compared once and
/// answered right away. With it the request is held until one of the configs
/// changes or the timeout elapses; both answer 200, empty when unchanged.
#[post("/listener")]
pub async fn config_listener(
    req: HttpRequest,
    data: web::Data<AppState>,
    form: web::Form<ListenerParam>,
) -> impl Responder {
    let client_ip = client_ip(&req);
    let tps = data.tps_control.check(
        &TpsCheckRequest::new(CONFIG_LISTEN_POINT)
            .with_monitor_key(MonitorKey::client_ip(client_ip.clone())),
    );
    if !tps.success {
        return over_threshold(tps.message);
    }

    let client_md5_map = match parse_listening_configs(&form.listening_configs) {
        Ok(map) => map,
        Err(e) => {
            return Result::<String>::http_response(
                400,
                error::PARAMETER_VALIDATE_ERROR.code,
                e.to_string(),
                String::new(),
            );
        }
    };
    let tag = header(&req, VIPSERVER_TAG_HEADER).map(str::to_string);

    let Some(timeout) = header(&req, LONG_POLLING_TIMEOUT_HEADER) else {
        let changed = data
            .config_cache
            .compare_md5(&client_md5_map, &client_ip, tag.as_deref());
        debug!(client_ip = %client_ip, changed = changed.len(), "Config listener compared");
        return changed_response(&changed);
    };
    let Ok(timeout_ms) = timeout.parse::<u64>() else {
        return Result::<String>::http_response(
            400,
            error::PARAMETER_VALIDATE_ERROR.code,
            format!("invalid {}: {}", LONG_POLLING_TIMEOUT_HEADER, timeout),
            String::new(),
        );
    };

    let request = LongPollingRequest {
        client_md5_map,
        client_ip: client_ip.clone(),
        app_name: header(&req, CLIENT_APP_NAME_HEADER)
            .unwrap_or_default()
            .to_string(),
        tag,
        timeout_ms,
        no_hang_up: header(&req, LONG_POLLING_NO_HANG_UP_HEADER)
            .is_some_and(|v| v.eq_ignore_ascii_case("true")),
    };

    match data.long_polling.add_long_polling_client(request) {
        PendingPoll::Ready(changed) => changed_response(&changed),
        PendingPoll::Suspended(rx) => match rx.await {
            Ok(changed) => changed_response(&changed),
            Err(_) => {
                warn!(client_ip = %client_ip, "Long poll dropped without an answer");
                changed_response(&[])
            }
        },
        PendingPoll::Rejected(message) => {
            info!(client_ip = %client_ip, message = %message, "Long poll rejected by connection control");
            over_threshold(message)
        }
    }
}

/// Pending long polls of one config, or of one client ip
#[get("/listener")]
pub async fn listener_state(
    data: web::Data<AppState>,
    params: web::Query<ListenerStateParam>,
) -> impl Responder {
    if let (Some(data_id), Some(group)) = (&params.data_id, &params.group) {
        let key = group_key::get_key(data_id, group, &params.tenant);
        return Result::<Vec<SubscriberInfo>>::http_success(data.long_polling.collect_subscribe_info(&key));
    }
    if let Some(ip) = &params.ip {
        return Result::<Vec<SubscriberInfo>>::http_success(
            data.long_polling.collect_subscribe_info_by_ip(ip),
        );
    }
    Result::<String>::http_response(
        400,
        error::PARAMETER_MISSING.code,
        "Required parameter 'dataId' and 'group', or 'ip' is missing".to_string(),
        String::new(),
    )
}
