// Core data models and structures
// This file defines connection metadata, the payloads exchanged with clients,
// and the configuration wrapper shared by every component.

use std::collections::HashMap;

use serde::{Deserialize, Serialize, de::DeserializeOwned};

use quince_common::{LABEL_APP_NAME, LABEL_SOURCE, LABEL_SOURCE_CLUSTER, LABEL_SOURCE_SDK, Result};
use quince_control::TpsControlConfig;

/// Connection meta infomation
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionMeta {
    /// ConnectionType.
    pub connect_type: String,

    /// Client IP Address.
    pub client_ip: String,

    /// Remote IP Address.
    pub remote_ip: String,

    /// Remote IP Port.
    pub remote_port: u16,

    /// Local Ip Port.
    pub local_port: u16,

    /// Client version.
    pub version: String,

    /// Identify Unique connectionId.
    pub connection_id: String,

    /// Create time.
    pub create_time: i64,

    /// Last active time when the meta was captured.
    pub last_active_time: i64,

    /// App name.
    pub app_name: String,

    /// Namespace id.
    pub namespace_id: String,

    /// Labels.
    pub labels: HashMap<String, String>,
}

impl ConnectionMeta {
    pub fn new(
        connection_id: impl Into<String>,
        client_ip: impl Into<String>,
        labels: HashMap<String, String>,
    ) -> Self {
        let now = quince_common::now_millis();
        let client_ip = client_ip.into();
        let app_name = labels.get(LABEL_APP_NAME).cloned().unwrap_or_default();
        Self {
            connection_id: connection_id.into(),
            remote_ip: client_ip.clone(),
            client_ip,
            app_name,
            labels,
            create_time: now,
            last_active_time: now,
            ..Default::default()
        }
    }

    /// Meta for an sdk client connection
    pub fn sdk(connection_id: impl Into<String>, client_ip: impl Into<String>) -> Self {
        Self::new(
            connection_id,
            client_ip,
            HashMap::from([(LABEL_SOURCE.to_string(), LABEL_SOURCE_SDK.to_string())]),
        )
    }

    pub fn is_sdk_source(&self) -> bool {
        self.labels
            .get(LABEL_SOURCE)
            .is_some_and(|e| e.eq_ignore_ascii_case(LABEL_SOURCE_SDK))
    }

    pub fn is_cluster_source(&self) -> bool {
        self.labels
            .get(LABEL_SOURCE)
            .is_some_and(|e| e.eq_ignore_ascii_case(LABEL_SOURCE_CLUSTER))
    }

    pub fn source(&self) -> &str {
        self.labels.get(LABEL_SOURCE).map_or("", |s| s.as_str())
    }
}

/// Message exchanged with a client over its transport
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Payload {
    pub r#type: String,
    pub request_id: String,
    #[serde(default)]
    pub body: serde_json::Value,
}

impl Payload {
    /// Server to client request with a fresh request id
    pub fn request<T: Serialize>(r#type: &str, body: &T) -> Result<Self> {
        Ok(Self {
            r#type: r#type.to_string(),
            request_id: uuid::Uuid::new_v4().to_string(),
            body: serde_json::to_value(body)?,
        })
    }

    /// Client response to the request with `request_id`
    pub fn response<T: Serialize>(request_id: &str, r#type: &str, body: &T) -> Result<Self> {
        Ok(Self {
            r#type: r#type.to_string(),
            request_id: request_id.to_string(),
            body: serde_json::to_value(body)?,
        })
    }

    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_value(self.body.clone())?)
    }
}

/// Ask a client to drop its connection, optionally reconnecting elsewhere
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectResetRequest {
    pub server_ip: Option<String>,
    pub server_port: Option<String>,
}

impl ConnectResetRequest {
    pub const TYPE: &'static str = "ConnectResetRequest";

    /// Parse an optional `ip:port` redirect target
    pub fn redirect_to(address: Option<&str>) -> Self {
        match address.and_then(|a| a.rsplit_once(':')) {
            Some((ip, port)) if !ip.is_empty() && port.parse::<u16>().is_ok() => Self {
                server_ip: Some(ip.to_string()),
                server_port: Some(port.to_string()),
            },
            _ => Self::default(),
        }
    }
}

/// Liveness probe
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientDetectionRequest {}

impl ClientDetectionRequest {
    pub const TYPE: &'static str = "ClientDetectionRequest";
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientResponse {
    pub result_code: i32,
    #[serde(default)]
    pub error_code: i32,
    #[serde(default)]
    pub message: String,
}

impl ClientResponse {
    pub const SUCCESS_CODE: i32 = 200;
    pub const TYPE: &'static str = "ClientResponse";

    pub fn success() -> Self {
        Self {
            result_code: Self::SUCCESS_CODE,
            ..Default::default()
        }
    }

    pub fn is_success(&self) -> bool {
        self.result_code == Self::SUCCESS_CODE
    }
}

/// Application configuration wrapper
/// Provides access to configuration values for every component
#[derive(Clone, Debug)]
pub struct Configuration {
    pub config: config::Config,
}

impl Default for Configuration {
    fn default() -> Self {
        Self::from_config(config::Config::default())
    }
}

impl Configuration {
    /// Create a new configuration from a Config instance
    pub fn from_config(config: config::Config) -> Self {
        Self { config }
    }

    fn get_u64(&self, key: &str, default: u64) -> u64 {
        self.config
            .get_int(key)
            .ok()
            .and_then(|v| u64::try_from(v).ok())
            .unwrap_or(default)
    }

    /// Get the main server port
    pub fn server_main_port(&self) -> u16 {
        self.config
            .get_int("quince.server.main.port")
            .ok()
            .and_then(|v| u16::try_from(v).ok())
            .unwrap_or(8848)
    }

    /// Get the address the HTTP server binds to
    pub fn server_address(&self) -> String {
        self.config
            .get_string("quince.server.address")
            .unwrap_or_else(|_| "0.0.0.0".to_string())
    }

    /// Get the server version
    pub fn version(&self) -> String {
        self.config
            .get_string("quince.version")
            .unwrap_or_else(|_| env!("CARGO_PKG_VERSION").to_string())
    }

    /// Get the base directory for cached config files and rules
    pub fn data_dir(&self) -> String {
        self.config
            .get_string("quince.data.dir")
            .unwrap_or_else(|_| "data".to_string())
    }

    // ===================== Connection Ejection =====================

    /// Get ejector tick interval in milliseconds (default: 3000ms)
    pub fn eject_interval_ms(&self) -> u64 {
        self.get_u64("quince.remote.server.eject.interval", 3000)
    }

    /// Get how long a connection may stay silent before it is probed (default: 20000ms)
    pub fn keep_alive_time_ms(&self) -> u64 {
        self.get_u64("quince.remote.server.keep-alive-time", 20000)
    }

    /// Get the per-probe timeout in milliseconds (default: 1000ms)
    pub fn probe_timeout_ms(&self) -> u64 {
        self.get_u64("quince.remote.server.probe.timeout", 1000)
    }

    /// Get the wait for a whole probe batch in milliseconds (default: 3000ms)
    pub fn probe_batch_wait_ms(&self) -> u64 {
        self.get_u64("quince.remote.server.probe.batch-wait", 3000)
    }

    /// Get pending server requests kept per connection (default: 1000)
    pub fn ack_capacity_per_connection(&self) -> usize {
        self.get_u64("quince.remote.server.ack.capacity", 1000) as usize
    }

    // ===================== TPS Control =====================

    pub fn tps_control_config(&self) -> TpsControlConfig {
        let defaults = TpsControlConfig::default();
        TpsControlConfig {
            reporter_interval_ms: self.get_u64(
                "quince.plugin.control.tps.report-interval",
                defaults.reporter_interval_ms,
            ),
            denied_event_capacity: self.get_u64(
                "quince.plugin.control.tps.denied-event-capacity",
                defaults.denied_event_capacity as u64,
            ) as usize,
        }
    }

    /// Get the directory holding control rule files
    pub fn control_rule_dir(&self) -> String {
        self.config
            .get_string("quince.plugin.control.rule.dir")
            .unwrap_or_else(|_| format!("{}/control", self.data_dir()))
    }

    // ===================== Config Service =====================

    /// Get the minimum long polling timeout in milliseconds (default: 10000ms)
    pub fn long_polling_min_timeout_ms(&self) -> u64 {
        self.get_u64("quince.config.long-polling.min-timeout", 10000)
    }

    /// Get the safety margin subtracted from the long polling timeout (default: 500ms)
    pub fn long_polling_fixed_delay_ms(&self) -> u64 {
        self.get_u64("quince.config.long-polling.fixed-delay", 500)
    }

    pub fn long_polling_fixed_polling(&self) -> bool {
        self.config
            .get_bool("quince.config.long-polling.fixed-polling")
            .unwrap_or(false)
    }

    pub fn long_polling_fixed_polling_interval_ms(&self) -> u64 {
        self.get_u64("quince.config.long-polling.fixed-polling-interval", 10000)
    }

    /// Get read lock retries when serving config content (default: 10)
    pub fn config_read_lock_retries(&self) -> u32 {
        self.get_u64("quince.config.cache.read-lock-retries", 10) as u32
    }

    pub fn config_write_lock_retries(&self) -> u32 {
        self.get_u64("quince.config.cache.write-lock-retries", 10) as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_meta_source_labels() {
        let meta = ConnectionMeta::sdk("c1", "10.0.0.1");
        assert!(meta.is_sdk_source());
        assert!(!meta.is_cluster_source());
        assert_eq!(meta.source(), "sdk");

        let mut labels = HashMap::new();
        labels.insert(LABEL_SOURCE.to_string(), "CLUSTER".to_string());
        labels.insert(LABEL_APP_NAME.to_string(), "orders".to_string());
        let meta = ConnectionMeta::new("c2", "10.0.0.2", labels);
        assert!(meta.is_cluster_source());
        assert_eq!(meta.app_name, "orders");
    }

    #[test]
    fn test_redirect_parse() {
        let reset = ConnectResetRequest::redirect_to(Some("10.0.0.9:8848"));
        assert_eq!(reset.server_ip.as_deref(), Some("10.0.0.9"));
        assert_eq!(reset.server_port.as_deref(), Some("8848"));

        assert_eq!(ConnectResetRequest::redirect_to(Some("bad")), ConnectResetRequest::default());
        assert_eq!(ConnectResetRequest::redirect_to(None), ConnectResetRequest::default());
    }

    #[test]
    fn test_payload_roundtrip() {
        let payload = Payload::request(ClientDetectionRequest::TYPE, &ClientDetectionRequest {}).unwrap();
        assert!(!payload.request_id.is_empty());

        let response =
            Payload::response(&payload.request_id, ClientResponse::TYPE, &ClientResponse::success())
                .unwrap();
        assert!(response.decode::<ClientResponse>().unwrap().is_success());
    }

    #[test]
    fn test_configuration_defaults() {
        let configuration = Configuration::default();
        assert_eq!(configuration.server_main_port(), 8848);
        assert_eq!(configuration.keep_alive_time_ms(), 20000);
        assert_eq!(configuration.long_polling_min_timeout_ms(), 10000);
        assert_eq!(configuration.tps_control_config(), TpsControlConfig::default());
    }

    #[test]
    fn test_configuration_overrides() {
        let config = config::Config::builder()
            .set_override("quince.remote.server.eject.interval", 500)
            .unwrap()
            .build()
            .unwrap();
        let configuration = Configuration::from_config(config);
        assert_eq!(configuration.eject_interval_ms(), 500);
    }
}
