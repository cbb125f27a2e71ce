//! Live client connection
//!
//! Wraps the outbound half of a client transport. Payloads are written to an
//! mpsc channel drained by the transport; replies come back through
//! `ConnectionManager::ack`.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::time::Duration;

use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::debug;

use quince_common::{QuinceError, Result, now_millis};

use super::ack::RpcAckSynchronizer;
use crate::model::{ConnectionMeta, Payload};

pub struct Connection {
    meta: ConnectionMeta,
    last_active_time: AtomicI64,
    tx: mpsc::Sender<Payload>,
    closed: AtomicBool,
    acks: Arc<RpcAckSynchronizer>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("connection_id", &self.meta.connection_id)
            .field("client_ip", &self.meta.client_ip)
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish()
    }
}

impl Connection {
    pub fn new(meta: ConnectionMeta, tx: mpsc::Sender<Payload>, acks: Arc<RpcAckSynchronizer>) -> Self {
        let last_active = if meta.last_active_time > 0 {
            meta.last_active_time
        } else {
            now_millis()
        };
        Self {
            meta,
            last_active_time: AtomicI64::new(last_active),
            tx,
            closed: AtomicBool::new(false),
            acks,
        }
    }

    pub fn id(&self) -> &str {
        &self.meta.connection_id
    }

    pub fn meta(&self) -> &ConnectionMeta {
        &self.meta
    }

    pub fn client_ip(&self) -> &str {
        &self.meta.client_ip
    }

    pub fn app_name(&self) -> &str {
        &self.meta.app_name
    }

    pub fn is_sdk_source(&self) -> bool {
        self.meta.is_sdk_source()
    }

    pub fn is_cluster_source(&self) -> bool {
        self.meta.is_cluster_source()
    }

    pub fn last_active_time(&self) -> i64 {
        self.last_active_time.load(Ordering::Relaxed)
    }

    /// Record client activity now. Never moves the active time backwards.
    pub fn refresh_active_time(&self) {
        self.last_active_time.fetch_max(now_millis(), Ordering::Relaxed);
    }

    pub fn is_connected(&self) -> bool {
        !self.closed.load(Ordering::Acquire) && !self.tx.is_closed()
    }

    fn closed_error(&self) -> QuinceError {
        QuinceError::ConnectionAlreadyClosed(self.meta.connection_id.clone())
    }

    /// Queue a payload without waiting.
    ///
    /// A full channel hands the send to a background task; only a closed
    /// transport is reported as an error.
    pub fn push(&self, payload: Payload) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(self.closed_error());
        }
        match self.tx.try_send(payload) {
            Ok(()) => Ok(()),
            Err(TrySendError::Closed(_)) => {
                self.closed.store(true, Ordering::Release);
                Err(self.closed_error())
            }
            Err(TrySendError::Full(payload)) => {
                let tx = self.tx.clone();
                let connection_id = self.meta.connection_id.clone();
                tokio::spawn(async move {
                    if tx.send(payload).await.is_err() {
                        debug!(connection_id = %connection_id, "Push dropped, connection closed");
                    }
                });
                Ok(())
            }
        }
    }

    async fn send(&self, payload: Payload, timeout: Duration) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(self.closed_error());
        }
        let request_id = payload.request_id.clone();
        match tokio::time::timeout(timeout, self.tx.send(payload)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => {
                self.closed.store(true, Ordering::Release);
                Err(self.closed_error())
            }
            Err(_) => Err(QuinceError::RequestTimeout(request_id)),
        }
    }

    /// Push a payload, waiting up to `timeout_ms` for room on the transport.
    pub async fn send_push(&self, payload: Payload, timeout_ms: u64) -> bool {
        match self.send(payload, Duration::from_millis(timeout_ms)).await {
            Ok(()) => true,
            Err(e) => {
                debug!(connection_id = %self.id(), error = %e, "Push failed");
                false
            }
        }
    }

    /// Send a request and wait for the client's ack.
    pub async fn request(&self, payload: Payload, timeout: Duration) -> Result<Payload> {
        let request_id = payload.request_id.clone();
        let rx = self.acks.register(self.id(), &request_id);

        let deadline = tokio::time::Instant::now() + timeout;
        if let Err(e) = self.send(payload, timeout).await {
            self.acks.remove(self.id(), &request_id);
            return Err(e);
        }

        match tokio::time::timeout_at(deadline, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(QuinceError::RequestEvicted(request_id)),
            Err(_) => {
                self.acks.remove(self.id(), &request_id);
                Err(QuinceError::RequestTimeout(request_id))
            }
        }
    }

    /// Send a request in the background and hand the outcome to `callback`.
    pub fn async_request<F>(self: &Arc<Self>, payload: Payload, timeout: Duration, callback: F)
    where
        F: FnOnce(Result<Payload>) + Send + 'static,
    {
        let connection = self.clone();
        tokio::spawn(async move {
            callback(connection.request(payload, timeout).await);
        });
    }

    /// Mark the connection closed and fail its pending requests.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.acks.clear_connection(self.id());
            debug!(connection_id = %self.id(), "Connection closed");
        }
    }
}
