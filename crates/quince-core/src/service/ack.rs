//! Server to client request correlation
//!
//! Every request the server sends and expects an answer to is parked here
//! under `(connection_id, request_id)` until the client acks it, the waiter
//! gives up, or the connection goes away.

use std::collections::VecDeque;

use dashmap::DashMap;
use tokio::sync::oneshot;
use tracing::debug;

use quince_common::{QuinceError, Result};

use crate::model::Payload;

pub const DEFAULT_ACK_CAPACITY: usize = 1000;

type AckSender = oneshot::Sender<Result<Payload>>;

#[derive(Debug)]
pub struct RpcAckSynchronizer {
    capacity: usize,
    pending: DashMap<String, VecDeque<(String, AckSender)>>,
}

impl Default for RpcAckSynchronizer {
    fn default() -> Self {
        Self::new(DEFAULT_ACK_CAPACITY)
    }
}

impl RpcAckSynchronizer {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            pending: DashMap::new(),
        }
    }

    /// Park a request. When the connection already has `capacity` pending
    /// requests the oldest one fails with `RequestEvicted`.
    pub fn register(&self, connection_id: &str, request_id: &str) -> oneshot::Receiver<Result<Payload>> {
        let (tx, rx) = oneshot::channel();
        let mut queue = self.pending.entry(connection_id.to_string()).or_default();
        while queue.len() >= self.capacity {
            if let Some((evicted_id, sender)) = queue.pop_front() {
                debug!(connection_id, request_id = %evicted_id, "Evicting unacknowledged request");
                let _ = sender.send(Err(QuinceError::RequestEvicted(evicted_id)));
            }
        }
        queue.push_back((request_id.to_string(), tx));
        rx
    }

    /// Complete the pending request matching `payload.request_id`.
    pub fn ack(&self, connection_id: &str, payload: Payload) -> bool {
        let sender = {
            let Some(mut queue) = self.pending.get_mut(connection_id) else {
                return false;
            };
            let Some(pos) = queue.iter().position(|(id, _)| *id == payload.request_id) else {
                return false;
            };
            queue.remove(pos).map(|(_, sender)| sender)
        };
        self.pending.remove_if(connection_id, |_, q| q.is_empty());

        match sender {
            Some(sender) => sender.send(Ok(payload)).is_ok(),
            None => false,
        }
    }

    /// Drop a pending request without completing it, e.g. after its waiter timed out.
    pub fn remove(&self, connection_id: &str, request_id: &str) {
        if let Some(mut queue) = self.pending.get_mut(connection_id) {
            queue.retain(|(id, _)| id != request_id);
        }
        self.pending.remove_if(connection_id, |_, q| q.is_empty());
    }

    /// Fail every pending request of a closed connection.
    pub fn clear_connection(&self, connection_id: &str) {
        if let Some((_, queue)) = self.pending.remove(connection_id) {
            for (_, sender) in queue {
                let _ = sender.send(Err(QuinceError::ConnectionAlreadyClosed(
                    connection_id.to_string(),
                )));
            }
        }
    }

    pub fn pending_count(&self, connection_id: &str) -> usize {
        self.pending.get(connection_id).map_or(0, |q| q.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(request_id: &str) -> Payload {
        Payload {
            r#type: "ClientResponse".to_string(),
            request_id: request_id.to_string(),
            body: serde_json::Value::Null,
        }
    }

    #[tokio::test]
    async fn test_ack_completes_waiter() {
        let acks = RpcAckSynchronizer::new(4);
        let rx = acks.register("c1", "r1");
        assert!(acks.ack("c1", response("r1")));
        assert_eq!(rx.await.unwrap().unwrap().request_id, "r1");
        assert_eq!(acks.pending_count("c1"), 0);

        assert!(!acks.ack("c1", response("r1")));
    }

    #[tokio::test]
    async fn test_over_capacity_evicts_oldest() {
        let acks = RpcAckSynchronizer::new(2);
        let first = acks.register("c1", "r1");
        let _second = acks.register("c1", "r2");
        let _third = acks.register("c1", "r3");

        assert!(matches!(first.await.unwrap(), Err(QuinceError::RequestEvicted(id)) if id == "r1"));
        assert_eq!(acks.pending_count("c1"), 2);
    }

    #[tokio::test]
    async fn test_clear_connection_fails_pending() {
        let acks = RpcAckSynchronizer::default();
        let rx = acks.register("c1", "r1");
        let other = acks.register("c2", "r1");

        acks.clear_connection("c1");
        assert!(matches!(rx.await.unwrap(), Err(QuinceError::ConnectionAlreadyClosed(_))));
        assert_eq!(acks.pending_count("c2"), 1);
        drop(other);
    }

    #[test]
    fn test_remove_drops_entry() {
        let acks = RpcAckSynchronizer::default();
        let _rx = acks.register("c1", "r1");
        acks.remove("c1", "r1");
        assert_eq!(acks.pending_count("c1"), 0);
    }
}
