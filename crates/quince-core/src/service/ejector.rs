//! Runtime connection ejection
//!
//! A fixed-delay task that sheds sdk connections over the configured limits
//! and probes connections that have been silent for too long.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashSet;
use futures::future::join_all;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use quince_common::now_millis;

use super::connection::Connection;
use super::remote::ConnectionManager;
use crate::model::{ClientDetectionRequest, ClientResponse, Configuration, Payload};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EjectorConfig {
    pub interval_ms: u64,
    /// Silence after which a connection is probed
    pub keep_alive_ms: u64,
    pub probe_timeout_ms: u64,
    /// Upper bound on waiting for a whole probe batch
    pub probe_batch_wait_ms: u64,
}

impl Default for EjectorConfig {
    fn default() -> Self {
        Self {
            interval_ms: 3_000,
            keep_alive_ms: 20_000,
            probe_timeout_ms: 1_000,
            probe_batch_wait_ms: 3_000,
        }
    }
}

impl EjectorConfig {
    pub fn from_configuration(configuration: &Configuration) -> Self {
        Self {
            interval_ms: configuration.eject_interval_ms(),
            keep_alive_ms: configuration.keep_alive_time_ms(),
            probe_timeout_ms: configuration.probe_timeout_ms(),
            probe_batch_wait_ms: configuration.probe_batch_wait_ms(),
        }
    }
}

/// What one ejection tick did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EjectReport {
    /// Connections told to reconnect because of a quota or the total limit
    pub evicted: Vec<String>,
    /// Connections probed for liveness
    pub probed: Vec<String>,
    /// Probed connections that did not answer and were unregistered
    pub expired: Vec<String>,
}

#[async_trait]
pub trait RuntimeConnectionEjector: Send + Sync {
    fn name(&self) -> &str;

    async fn do_eject(&self) -> EjectReport;
}

pub struct DefaultConnectionEjector {
    manager: Arc<ConnectionManager>,
    config: EjectorConfig,
}

impl DefaultConnectionEjector {
    pub fn new(manager: Arc<ConnectionManager>, config: EjectorConfig) -> Self {
        Self { manager, config }
    }

    /// Pick the sdk connections to evict this tick, per ip and per app
    /// quota first, then down to the total limit.
    fn select_over_limit(&self, load_client: Option<usize>) -> Vec<Arc<Connection>> {
        let control = self.manager.control();
        let mut selected: Vec<Arc<Connection>> = Vec::new();
        let mut selected_ids: HashSet<String> = HashSet::new();

        let mut per_ip: Vec<(String, usize)> =
            self.manager.get_connection_for_client_ip().into_iter().collect();
        per_ip.sort();
        for (ip, count) in per_ip {
            let limit = control.per_ip_limit(&ip);
            if limit < 0 || count as i64 <= limit {
                continue;
            }
            let over = count - limit as usize;
            info!(client_ip = %ip, count, limit, over, "Client ip over connection quota");
            for conn in self.manager.sdk_connections_for_ip(&ip).into_iter().take(over) {
                selected_ids.insert(conn.id().to_string());
                selected.push(conn);
            }
        }

        let mut sdk: Vec<Arc<Connection>> = self
            .manager
            .connections()
            .into_iter()
            .filter(|c| c.is_sdk_source())
            .collect();
        sdk.sort_by(|a, b| a.id().cmp(b.id()));

        let mut per_app: BTreeMap<String, Vec<Arc<Connection>>> = BTreeMap::new();
        for conn in sdk.iter().filter(|c| !c.app_name().is_empty()) {
            per_app
                .entry(conn.app_name().to_string())
                .or_default()
                .push(conn.clone());
        }
        for (app, conns) in per_app {
            let limit = control.per_app_limit(&app);
            if limit < 0 || conns.len() as i64 <= limit {
                continue;
            }
            let over = conns.len() - limit as usize;
            info!(app_name = %app, count = conns.len(), limit, "Client app over connection quota");
            let mut already = conns.iter().filter(|c| selected_ids.contains(c.id())).count();
            for conn in conns {
                if already >= over {
                    break;
                }
                if selected_ids.insert(conn.id().to_string()) {
                    selected.push(conn);
                    already += 1;
                }
            }
        }

        let max_client = match load_client {
            Some(load) => Some(load),
            None => usize::try_from(control.count_limit()).ok(),
        };
        if let Some(max_client) = max_client {
            let expel_count = self
                .manager
                .current_sdk_client_count()
                .saturating_sub(max_client)
                .saturating_sub(selected.len());
            if expel_count > 0 {
                info!(expel_count, max_client, "Sdk connections over total limit");
                // longest idle first
                sdk.sort_by_key(|c| c.last_active_time());
                let idle: Vec<Arc<Connection>> = sdk
                    .into_iter()
                    .filter(|c| !selected_ids.contains(c.id()))
                    .take(expel_count)
                    .collect();
                for conn in idle {
                    selected_ids.insert(conn.id().to_string());
                    selected.push(conn);
                }
            }
        }

        selected
    }

    async fn probe(&self, candidates: Vec<Arc<Connection>>) -> Vec<String> {
        if candidates.is_empty() {
            return Vec::new();
        }
        let alive: Arc<DashSet<String>> = Arc::new(DashSet::new());
        let probe_timeout = Duration::from_millis(self.config.probe_timeout_ms);

        let probes = candidates.iter().map(|conn| {
            let alive = alive.clone();
            let conn = conn.clone();
            async move {
                let payload =
                    match Payload::request(ClientDetectionRequest::TYPE, &ClientDetectionRequest {}) {
                        Ok(payload) => payload,
                        Err(e) => {
                            warn!(connection_id = %conn.id(), error = %e, "Failed to build probe");
                            return;
                        }
                    };
                match conn.request(payload, probe_timeout).await {
                    Ok(response) => match response.decode::<ClientResponse>() {
                        Ok(r) if r.is_success() => {
                            conn.refresh_active_time();
                            alive.insert(conn.id().to_string());
                        }
                        Ok(r) => debug!(connection_id = %conn.id(), code = r.result_code, "Probe rejected"),
                        Err(e) => debug!(connection_id = %conn.id(), error = %e, "Probe answer unreadable"),
                    },
                    Err(e) => debug!(connection_id = %conn.id(), error = %e, "Probe failed"),
                }
            }
        });

        let batch_wait = Duration::from_millis(self.config.probe_batch_wait_ms);
        if tokio::time::timeout(batch_wait, join_all(probes)).await.is_err() {
            warn!(probes = candidates.len(), "Probe batch did not finish in time");
        }

        let mut expired = Vec::new();
        for conn in candidates {
            if !alive.contains(conn.id()) {
                info!(connection_id = %conn.id(), client_ip = %conn.client_ip(), "Unregistering unresponsive connection");
                self.manager.unregister(conn.id());
                expired.push(conn.id().to_string());
            }
        }
        expired
    }
}

#[async_trait]
impl RuntimeConnectionEjector for DefaultConnectionEjector {
    fn name(&self) -> &str {
        "default"
    }

    async fn do_eject(&self) -> EjectReport {
        let load = self.manager.take_load_override();
        let redirect = load.as_ref().and_then(|l| l.redirect_address.clone());
        debug!(
            total = self.manager.current_clients_count(),
            sdk = self.manager.current_sdk_client_count(),
            "Connection ejection tick"
        );

        let evict = self.select_over_limit(load.map(|l| l.load_client));
        let evicted_ids: HashSet<&str> = evict.iter().map(|c| c.id()).collect();

        let now = now_millis();
        let keep_alive = self.config.keep_alive_ms as i64;
        let candidates: Vec<Arc<Connection>> = self
            .manager
            .connections()
            .into_iter()
            .filter(|c| now - c.last_active_time() >= keep_alive)
            .filter(|c| !evicted_ids.contains(c.id()))
            .collect();

        let mut report = EjectReport {
            probed: candidates.iter().map(|c| c.id().to_string()).collect(),
            ..Default::default()
        };

        for conn in &evict {
            self.manager.send_reset(conn, redirect.as_deref());
            report.evicted.push(conn.id().to_string());
        }
        if !evict.is_empty() {
            info!(evicted = evict.len(), redirect = ?redirect, "Over limit connections reset");
        }

        report.expired = self.probe(candidates).await;
        report
    }
}

/// Run the ejector with a fixed delay between ticks.
pub fn start_ejector(ejector: Arc<dyn RuntimeConnectionEjector>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!(ejector = ejector.name(), interval_ms = interval.as_millis() as u64, "Connection ejector started");
        loop {
            tokio::time::sleep(interval).await;
            let ejector = ejector.clone();
            // a panicking tick must not stop later ticks
            match tokio::spawn(async move { ejector.do_eject().await }).await {
                Ok(report) => {
                    if !report.evicted.is_empty() || !report.expired.is_empty() {
                        info!(
                            evicted = report.evicted.len(),
                            expired = report.expired.len(),
                            probed = report.probed.len(),
                            "Connection ejection finished"
                        );
                    }
                }
                Err(e) => error!(error = %e, "Connection ejection tick failed"),
            }
        }
    })
}
