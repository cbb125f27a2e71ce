//! Connection registry
//!
//! `ConnectionManager` owns every registered client connection. Totals and
//! per-ip counts of sdk connections are maintained on register/unregister so
//! reading them never scans the table.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use quince_common::QuinceError;
use quince_control::{
    ConnectionCheckRequest, ConnectionControlManager, ConnectionMetricsCollector,
};

use super::ack::RpcAckSynchronizer;
use super::connection::Connection;
use crate::model::{ConnectResetRequest, Payload};

/// Notified after a connection is registered or unregistered
pub trait ConnectionEventListener: Send + Sync {
    fn name(&self) -> &str;

    fn client_connected(&self, connection: &Connection);

    fn client_disconnected(&self, connection: &Connection);
}

/// One-shot load balancing request consumed by the next ejector tick
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadOverride {
    /// Sdk connections to keep on this server
    pub load_client: usize,
    /// `ip:port` clients are told to reconnect to
    pub redirect_address: Option<String>,
}

pub struct ConnectionManager {
    connections: DashMap<String, Arc<Connection>>,
    sdk_per_ip: DashMap<String, usize>,
    total: AtomicUsize,
    sdk_total: AtomicUsize,
    started: AtomicBool,
    acks: Arc<RpcAckSynchronizer>,
    control: Arc<ConnectionControlManager>,
    listeners: RwLock<Vec<Arc<dyn ConnectionEventListener>>>,
    load_override: Mutex<Option<LoadOverride>>,
}

impl ConnectionManager {
    pub fn new(acks: Arc<RpcAckSynchronizer>, control: Arc<ConnectionControlManager>) -> Self {
        Self {
            connections: DashMap::new(),
            sdk_per_ip: DashMap::new(),
            total: AtomicUsize::new(0),
            sdk_total: AtomicUsize::new(0),
            started: AtomicBool::new(false),
            acks,
            control,
            listeners: RwLock::new(Vec::new()),
            load_override: Mutex::new(None),
        }
    }

    pub fn acks(&self) -> &Arc<RpcAckSynchronizer> {
        &self.acks
    }

    pub fn control(&self) -> &Arc<ConnectionControlManager> {
        &self.control
    }

    /// End the starting phase; registrations are refused until then.
    pub fn mark_started(&self) {
        self.started.store(true, Ordering::Release);
        info!("Connection manager accepting connections");
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    pub fn register_listener(&self, listener: Arc<dyn ConnectionEventListener>) {
        let mut listeners = self.listeners.write();
        listeners.retain(|l| l.name() != listener.name());
        listeners.push(listener);
    }

    /// Register a connection.
    ///
    /// Returns false if the id is already taken (the existing connection is
    /// kept), or if the server is starting or over its limits, in which case
    /// the client is told to reconnect.
    pub fn register(&self, connection_id: &str, connection: Arc<Connection>) -> bool {
        if !self.is_started() {
            info!(connection_id, "Refusing connection, server is starting");
            self.send_reset(&connection, None);
            return false;
        }

        let inserted = if connection.is_sdk_source() {
            let request = ConnectionCheckRequest::new(
                connection.client_ip(),
                connection.app_name(),
                connection.meta().source(),
            );
            match self
                .control
                .admit(&request, || self.insert(connection_id, &connection))
            {
                Ok(inserted) => inserted,
                Err(check) => {
                    warn!(
                        connection_id,
                        client_ip = %connection.client_ip(),
                        code = %check.code,
                        "Refusing connection over limit"
                    );
                    self.send_reset(&connection, None);
                    return false;
                }
            }
        } else {
            self.insert(connection_id, &connection)
        };
        if !inserted {
            debug!(connection_id, "Connection already registered");
            return false;
        }

        info!(
            connection_id,
            client_ip = %connection.client_ip(),
            source = %connection.meta().source(),
            "Connection registered"
        );
        for listener in self.listeners.read().iter() {
            listener.client_connected(&connection);
        }
        true
    }

    fn insert(&self, connection_id: &str, connection: &Arc<Connection>) -> bool {
        let Entry::Vacant(vacant) = self.connections.entry(connection_id.to_string()) else {
            return false;
        };
        self.total.fetch_add(1, Ordering::AcqRel);
        if connection.is_sdk_source() {
            self.sdk_total.fetch_add(1, Ordering::AcqRel);
            *self
                .sdk_per_ip
                .entry(connection.client_ip().to_string())
                .or_insert(0) += 1;
        }
        vacant.insert(connection.clone());
        true
    }

    /// Remove a connection. Unknown ids are ignored.
    pub fn unregister(&self, connection_id: &str) {
        let Some((_, connection)) = self.connections.remove(connection_id) else {
            return;
        };

        self.total.fetch_sub(1, Ordering::AcqRel);
        if connection.is_sdk_source() {
            self.sdk_total.fetch_sub(1, Ordering::AcqRel);
            let ip = connection.client_ip();
            if let Some(mut count) = self.sdk_per_ip.get_mut(ip) {
                *count = count.saturating_sub(1);
            }
            self.sdk_per_ip.remove_if(ip, |_, count| *count == 0);
        }
        connection.close();

        info!(connection_id, client_ip = %connection.client_ip(), "Connection unregistered");
        for listener in self.listeners.read().iter() {
            listener.client_disconnected(&connection);
        }
    }

    pub fn get_connection(&self, connection_id: &str) -> Option<Arc<Connection>> {
        self.connections.get(connection_id).map(|c| c.clone())
    }

    pub fn connections(&self) -> Vec<Arc<Connection>> {
        self.connections.iter().map(|c| c.value().clone()).collect()
    }

    pub fn sdk_connections_for_ip(&self, client_ip: &str) -> Vec<Arc<Connection>> {
        let mut conns: Vec<Arc<Connection>> = self
            .connections
            .iter()
            .filter(|c| c.is_sdk_source() && c.client_ip() == client_ip)
            .map(|c| c.value().clone())
            .collect();
        conns.sort_by(|a, b| a.id().cmp(b.id()));
        conns
    }

    /// Mark a connection active. No-op if it is already gone.
    pub fn refresh_active_time(&self, connection_id: &str) {
        if let Some(connection) = self.connections.get(connection_id) {
            connection.refresh_active_time();
        }
    }

    pub fn current_clients_count(&self) -> usize {
        self.total.load(Ordering::Acquire)
    }

    pub fn current_sdk_client_count(&self) -> usize {
        self.sdk_total.load(Ordering::Acquire)
    }

    /// Live sdk connection counts per client ip
    pub fn get_connection_for_client_ip(&self) -> HashMap<String, usize> {
        self.sdk_per_ip
            .iter()
            .map(|e| (e.key().clone(), *e.value()))
            .collect()
    }

    /// Route a client response to the request waiting for it.
    pub fn ack(&self, connection_id: &str, payload: Payload) -> bool {
        self.refresh_active_time(connection_id);
        self.acks.ack(connection_id, payload)
    }

    /// Ask the next ejector tick to shed sdk connections down to `load_client`.
    pub fn load_count(&self, load_client: usize, redirect_address: Option<String>) {
        info!(load_client, redirect_address = ?redirect_address, "Load count requested");
        *self.load_override.lock() = Some(LoadOverride {
            load_client,
            redirect_address,
        });
    }

    /// Consume the pending load override, if any.
    pub fn take_load_override(&self) -> Option<LoadOverride> {
        self.load_override.lock().take()
    }

    /// Reset one connection right away. Returns false if it is unknown.
    pub fn load_single(&self, connection_id: &str, redirect_address: Option<&str>) -> bool {
        match self.get_connection(connection_id) {
            Some(connection) => {
                info!(connection_id, redirect_address = ?redirect_address, "Load single requested");
                self.send_reset(&connection, redirect_address);
                true
            }
            None => false,
        }
    }

    /// Tell a client to reconnect without waiting for it.
    ///
    /// A closed transport unregisters the connection instead of failing.
    pub fn send_reset(&self, connection: &Connection, redirect_address: Option<&str>) {
        let reset = ConnectResetRequest::redirect_to(redirect_address);
        let payload = match Payload::request(ConnectResetRequest::TYPE, &reset) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(connection_id = %connection.id(), error = %e, "Failed to build connect reset");
                return;
            }
        };
        match connection.push(payload) {
            Ok(()) => debug!(connection_id = %connection.id(), "Connect reset sent"),
            Err(QuinceError::ConnectionAlreadyClosed(_)) => {
                debug!(connection_id = %connection.id(), "Connection closed before reset");
                self.unregister(connection.id());
            }
            Err(e) => warn!(connection_id = %connection.id(), error = %e, "Connect reset failed"),
        }
    }
}

impl ConnectionMetricsCollector for ConnectionManager {
    fn name(&self) -> &str {
        "rpc"
    }

    fn total_count(&self) -> usize {
        self.current_sdk_client_count()
    }

    fn count_for_ip(&self, ip: &str) -> usize {
        self.sdk_per_ip.get(ip).map_or(0, |c| *c)
    }
}
