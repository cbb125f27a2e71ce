//! Config read and publish handlers
//!
//! - GET /v1/cs/configs - Get config
//! - POST /v1/cs/configs - Publish config
//! - DELETE /v1/cs/configs - Delete config

use actix_web::{HttpRequest, HttpResponse, Responder, delete, get, post, web};
use tracing::{info, warn};

use quince_common::error;
use quince_config::{ConfigRecord, GrayRule, QueryResult, is_valid_identity, is_valid_part};
use quince_control::{MonitorKey, TpsCheckRequest};

use super::client_ip;
use super::model::{ConfigDeleteParam, ConfigGetParam, ConfigPublishParam};
use crate::model::app_state::AppState;
use crate::model::constants::CONFIG_PUBLISH_POINT;
use crate::model::response::Result;

const BETA_IPS_HEADER: &str = "betaIps";

/// The tenant may be empty; a tag, when present, must also name a valid gray variant.
fn check_identity(data_id: &str, group: &str, tenant: &str, tag: Option<&str>) -> Option<HttpResponse> {
    if data_id.is_empty() {
        return Some(Result::<String>::http_response(
            400,
            error::PARAMETER_MISSING.code,
            "Required parameter 'dataId' is missing".to_string(),
            String::new(),
        ));
    }
    if group.is_empty() {
        return Some(Result::<String>::http_response(
            400,
            error::PARAMETER_MISSING.code,
            "Required parameter 'group' is missing".to_string(),
            String::new(),
        ));
    }
    if !is_valid_identity(data_id, group, tenant) {
        return Some(Result::<String>::http_response(
            400,
            error::PARAMETER_VALIDATE_ERROR.code,
            format!("invalid dataId, group or tenant: {}, {}, {}", data_id, group, tenant),
            String::new(),
        ));
    }
    if let Some(tag) = tag
        && !is_valid_part(&GrayRule::tag(tag).gray_name())
    {
        return Some(Result::<String>::http_response(
            400,
            error::PARAMETER_VALIDATE_ERROR.code,
            format!("invalid tag: {}", tag),
            String::new(),
        ));
    }
    None
}

/// Get configuration
///
/// Serves the gray variant when the client ip is in a beta list or the tag
/// matches, the main content otherwise.
#[get("")]
pub async fn get_config(
    req: HttpRequest,
    data: web::Data<AppState>,
    params: web::Query<ConfigGetParam>,
) -> impl Responder {
    if let Some(response) =
        check_identity(&params.data_id, &params.group, &params.tenant, params.tag())
    {
        return response;
    }

    let client_ip = client_ip(&req);
    match data
        .config_query
        .query(&params.data_id, &params.group, &params.tenant, &client_ip, params.tag())
        .await
    {
        Ok(QueryResult::Found(config)) => {
            let mut response = HttpResponse::Ok();
            response
                .content_type("text/plain; charset=UTF-8")
                .insert_header(("Config-Type", config.r#type.as_str()))
                .insert_header(("Content-MD5", config.md5.as_str()))
                .insert_header(("Last-Modified", config.last_modified.to_string()))
                .insert_header(("Cache-Control", "no-cache"))
                .insert_header(("Pragma", "no-cache"));
            if !config.encrypted_data_key.is_empty() {
                response.insert_header(("Encrypted-Data-Key", config.encrypted_data_key.as_str()));
            }
            if let Some(gray_name) = &config.gray_name {
                response.insert_header(("Gray-Name", gray_name.as_str()));
            }
            response.body(config.content)
        }
        Ok(QueryResult::NotFound) => Result::<Option<String>>::http_response(
            404,
            error::RESOURCE_NOT_FOUND.code,
            format!(
                "config data not exist, dataId={}, group={}, tenant={}",
                params.data_id, params.group, params.tenant
            ),
            None::<String>,
        ),
        Ok(QueryResult::Conflict) => Result::<Option<String>>::http_response(
            409,
            error::RESOURCE_CONFLICT.code,
            "requested file is being modified, please try later".to_string(),
            None::<String>,
        ),
        Err(e) => {
            warn!(error = %e, data_id = %params.data_id, group = %params.group, "Config query failed");
            Result::<String>::http_response(
                500,
                error::SERVER_ERROR.code,
                e.to_string(),
                String::new(),
            )
        }
    }
}

/// Publish configuration
///
/// A `betaIps` header publishes a beta variant and a `tag` publishes a tag
/// variant; otherwise the main content is replaced.
#[post("")]
pub async fn publish_config(
    req: HttpRequest,
    data: web::Data<AppState>,
    form: web::Form<ConfigPublishParam>,
) -> impl Responder {
    if let Some(response) = check_identity(
        &form.data_id,
        &form.group,
        &form.tenant,
        form.tag.as_deref().filter(|t| !t.is_empty()),
    ) {
        return response;
    }

    let client_ip = client_ip(&req);
    let tps = data.tps_control.check(
        &TpsCheckRequest::new(CONFIG_PUBLISH_POINT)
            .with_monitor_key(MonitorKey::client_ip(client_ip.clone())),
    );
    if !tps.success {
        return Result::<bool>::http_response(
            503,
            error::OVER_THRESHOLD.code,
            tps.message,
            false,
        );
    }

    let form = form.into_inner();
    let mut record = ConfigRecord::new(form.data_id, form.group, form.tenant, form.content);
    if let Some(r#type) = form.r#type.filter(|t| !t.is_empty()) {
        record.r#type = r#type;
    }
    record.encrypted_data_key = form.encrypted_data_key;

    let beta_ips = req
        .headers()
        .get(BETA_IPS_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.trim().is_empty());
    if let Some(ips) = beta_ips {
        record = record.with_gray_rule(GrayRule::beta(ips));
    } else if let Some(tag) = form.tag.filter(|t| !t.is_empty()) {
        record = record.with_gray_rule(GrayRule::tag(tag));
    }

    match data.dump_service.publish(record).await {
        Ok(stored) => {
            info!(
                group_key = %stored.group_key(),
                md5 = %stored.md5,
                gray = ?stored.gray_rule.as_ref().map(|r| r.gray_name()),
                client_ip = %client_ip,
                "Config published"
            );
            Result::<bool>::http_success(true)
        }
        Err(e) => {
            warn!(error = %e, client_ip = %client_ip, "Config publish failed");
            Result::<bool>::http_response(500, error::SERVER_ERROR.code, e.to_string(), false)
        }
    }
}

/// Delete configuration, or only one of its gray variants
#[delete("")]
pub async fn delete_config(
    req: HttpRequest,
    data: web::Data<AppState>,
    params: web::Query<ConfigDeleteParam>,
) -> impl Responder {
    if let Some(response) = check_identity(
        &params.data_id,
        &params.group,
        &params.tenant,
        params.tag.as_deref().filter(|t| !t.is_empty()),
    ) {
        return response;
    }

    let gray_name = if params.beta {
        Some(GrayRule::beta("").gray_name())
    } else {
        params
            .tag
            .as_deref()
            .filter(|t| !t.is_empty())
            .map(|t| GrayRule::tag(t).gray_name())
    };

    let result = match &gray_name {
        Some(gray_name) => {
            data.dump_service
                .remove_gray(&params.data_id, &params.group, &params.tenant, gray_name)
                .await
        }
        None => {
            data.dump_service
                .remove(&params.data_id, &params.group, &params.tenant)
                .await
        }
    };

    match result {
        Ok(existed) => {
            info!(
                data_id = %params.data_id,
                group = %params.group,
                tenant = %params.tenant,
                gray = ?gray_name,
                existed,
                client_ip = %client_ip(&req),
                "Config deleted"
            );
            Result::<bool>::http_success(true)
        }
        Err(e) => {
            warn!(error = %e, "Config delete failed");
            Result::<bool>::http_response(500, error::SERVER_ERROR.code, e.to_string(), false)
        }
    }
}
