//! HTTP long polling
//!
//! A pending poll is answered exactly once: by a change event, by its timer,
//! or right away when the client is already stale. The poll is indexed by
//! group key before the initial digest comparison, so a change that lands in
//! between is never missed.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use quince_common::{LABEL_SOURCE_SDK, now_millis};
use quince_control::{ConnectionCheckRequest, ConnectionControlManager, ConnectionMetricsCollector};

use super::cache::ConfigCacheService;
use crate::model::{LocalDataChangeEvent, LongPollingConfig, SubscriberInfo};

/// A long poll as the transport received it
#[derive(Clone, Debug, Default)]
pub struct LongPollingRequest {
    pub client_md5_map: HashMap<String, String>,
    pub client_ip: String,
    pub app_name: String,
    pub tag: Option<String>,
    /// Timeout the client asked for
    pub timeout_ms: u64,
    /// Answer right away even when nothing changed
    pub no_hang_up: bool,
}

#[derive(Debug)]
pub enum PendingPoll {
    /// Answer now with these changed group keys
    Ready(Vec<String>),
    /// Resolves with the changed group keys, empty on timeout
    Suspended(oneshot::Receiver<Vec<String>>),
    /// Over a connection limit; the message says which
    Rejected(String),
}

struct ClientLongPolling {
    id: u64,
    client_md5_map: HashMap<String, String>,
    client_ip: String,
    app_name: String,
    tag: Option<String>,
    create_time: i64,
    timeout_ms: u64,
    completed: AtomicBool,
    responder: Mutex<Option<oneshot::Sender<Vec<String>>>>,
    timeout_task: Mutex<Option<JoinHandle<()>>>,
}

impl ClientLongPolling {
    /// Send the answer unless another path already did.
    fn complete(&self, changed: Vec<String>) -> bool {
        if self.completed.swap(true, Ordering::AcqRel) {
            return false;
        }
        if let Some(responder) = self.responder.lock().take() {
            // the client may have gone away
            let _ = responder.send(changed);
        }
        if let Some(task) = self.timeout_task.lock().take() {
            task.abort();
        }
        true
    }

    fn is_completed(&self) -> bool {
        self.completed.load(Ordering::Acquire)
    }

    fn info(&self) -> SubscriberInfo {
        SubscriberInfo {
            client_ip: self.client_ip.clone(),
            app_name: self.app_name.clone(),
            tag: self.tag.clone(),
            create_time: self.create_time,
            timeout_ms: self.timeout_ms,
            listening_configs: self.client_md5_map.clone(),
        }
    }
}

pub struct LongPollingService {
    cache: Arc<ConfigCacheService>,
    control: Arc<ConnectionControlManager>,
    config: LongPollingConfig,
    subs: DashMap<u64, Arc<ClientLongPolling>>,
    by_group_key: DashMap<String, HashSet<u64>>,
    by_client_ip: DashMap<String, HashSet<u64>>,
    next_id: AtomicU64,
}

impl LongPollingService {
    pub fn new(
        cache: Arc<ConfigCacheService>,
        control: Arc<ConnectionControlManager>,
        config: LongPollingConfig,
    ) -> Self {
        Self {
            cache,
            control,
            config,
            subs: DashMap::new(),
            by_group_key: DashMap::new(),
            by_client_ip: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn config(&self) -> &LongPollingConfig {
        &self.config
    }

    pub fn add_long_polling_client(self: &Arc<Self>, request: LongPollingRequest) -> PendingPoll {
        let check_request = ConnectionCheckRequest::new(
            request.client_ip.as_str(),
            request.app_name.as_str(),
            LABEL_SOURCE_SDK,
        );
        let timeout_ms = self.config.effective_timeout_ms(request.timeout_ms);
        let (tx, rx) = oneshot::channel();
        let sub = Arc::new(ClientLongPolling {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            client_md5_map: request.client_md5_map,
            client_ip: request.client_ip,
            app_name: request.app_name,
            tag: request.tag,
            create_time: now_millis(),
            timeout_ms,
            completed: AtomicBool::new(false),
            responder: Mutex::new(Some(tx)),
            timeout_task: Mutex::new(None),
        });
        let admitted = self.control.admit(&check_request, || {
            self.register(&sub);
            true
        });
        if let Err(check) = admitted {
            info!(client_ip = %sub.client_ip, code = %check.code, "Long polling rejected");
            return PendingPoll::Rejected(check.message);
        }

        if !self.config.fixed_polling {
            let changed = self.compare(&sub);
            if !changed.is_empty() || request.no_hang_up {
                if sub.complete(changed.clone()) {
                    self.unregister(&sub);
                    return PendingPoll::Ready(changed);
                }
                // a change event answered first
                return PendingPoll::Suspended(rx);
            }
        }

        let service = Arc::downgrade(self);
        let id = sub.id;
        let task = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(timeout_ms)).await;
            if let Some(service) = Weak::upgrade(&service) {
                service.on_timeout(id);
            }
        });
        *sub.timeout_task.lock() = Some(task);
        if sub.is_completed()
            && let Some(task) = sub.timeout_task.lock().take()
        {
            task.abort();
        }
        debug!(client_ip = %sub.client_ip, keys = sub.client_md5_map.len(), timeout_ms, "Long polling suspended");
        PendingPoll::Suspended(rx)
    }

    fn compare(&self, sub: &ClientLongPolling) -> Vec<String> {
        self.cache
            .compare_md5(&sub.client_md5_map, &sub.client_ip, sub.tag.as_deref())
    }

    fn register(&self, sub: &Arc<ClientLongPolling>) {
        self.subs.insert(sub.id, sub.clone());
        for group_key in sub.client_md5_map.keys() {
            self.by_group_key
                .entry(group_key.clone())
                .or_default()
                .insert(sub.id);
        }
        self.by_client_ip
            .entry(sub.client_ip.clone())
            .or_default()
            .insert(sub.id);
    }

    fn unregister(&self, sub: &ClientLongPolling) {
        if self.subs.remove(&sub.id).is_none() {
            return;
        }
        for group_key in sub.client_md5_map.keys() {
            if let Some(mut ids) = self.by_group_key.get_mut(group_key) {
                ids.remove(&sub.id);
            }
            self.by_group_key.remove_if(group_key, |_, ids| ids.is_empty());
        }
        if let Some(mut ids) = self.by_client_ip.get_mut(&sub.client_ip) {
            ids.remove(&sub.id);
        }
        self.by_client_ip
            .remove_if(&sub.client_ip, |_, ids| ids.is_empty());
    }

    fn finish(&self, sub: &ClientLongPolling, changed: Vec<String>) {
        if sub.complete(changed) {
            debug!(client_ip = %sub.client_ip, "Long polling answered with changes");
        }
        self.unregister(sub);
    }

    fn on_timeout(&self, id: u64) {
        let Some(sub) = self.subs.get(&id).map(|s| s.value().clone()) else {
            return;
        };
        // the timer is the running task, nothing to abort
        sub.timeout_task.lock().take();
        let changed = if self.config.fixed_polling {
            self.compare(&sub)
        } else {
            Vec::new()
        };
        if sub.complete(changed) {
            debug!(client_ip = %sub.client_ip, timeout_ms = sub.timeout_ms, "Long polling timed out");
        }
        self.unregister(&sub);
    }

    /// Answer every pending poll that is stale for the changed group key.
    pub fn on_data_change(&self, event: &LocalDataChangeEvent) {
        if self.config.fixed_polling {
            return;
        }
        let ids: Vec<u64> = self
            .by_group_key
            .get(&event.group_key)
            .map(|ids| ids.iter().copied().collect())
            .unwrap_or_default();

        for id in ids {
            let Some(sub) = self.subs.get(&id).map(|s| s.value().clone()) else {
                continue;
            };
            if event.is_beta && !event.beta_ips.contains(&sub.client_ip) {
                continue;
            }
            if event.tag.is_some() && event.tag != sub.tag {
                continue;
            }
            let client_md5 = sub
                .client_md5_map
                .get(&event.group_key)
                .map(String::as_str)
                .unwrap_or_default();
            if self.cache.is_uptodate(
                &event.group_key,
                client_md5,
                &sub.client_ip,
                sub.tag.as_deref(),
            ) {
                continue;
            }
            self.finish(&sub, vec![event.group_key.clone()]);
        }
    }

    /// Compare every pending poll again, after change events were lost.
    pub fn rescan(&self) {
        let subs: Vec<Arc<ClientLongPolling>> = self.subs.iter().map(|s| s.value().clone()).collect();
        for sub in subs {
            let changed = self.compare(&sub);
            if !changed.is_empty() {
                self.finish(&sub, changed);
            }
        }
    }

    /// Subscribe to cache changes and answer pending polls from them.
    pub fn start_subscriber(self: Arc<Self>) -> JoinHandle<()> {
        let mut events = self.cache.events().subscribe();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => self.on_data_change(&event),
                    Err(RecvError::Lagged(missed)) => {
                        warn!(missed, "Long polling fell behind config changes, rescanning");
                        self.rescan();
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }

    pub fn subscriber_count(&self) -> usize {
        self.subs.len()
    }

    pub fn collect_subscribe_info(&self, group_key: &str) -> Vec<SubscriberInfo> {
        let ids: Vec<u64> = self
            .by_group_key
            .get(group_key)
            .map(|ids| ids.iter().copied().collect())
            .unwrap_or_default();
        self.snapshot(ids)
    }

    pub fn collect_subscribe_info_by_ip(&self, client_ip: &str) -> Vec<SubscriberInfo> {
        let ids: Vec<u64> = self
            .by_client_ip
            .get(client_ip)
            .map(|ids| ids.iter().copied().collect())
            .unwrap_or_default();
        self.snapshot(ids)
    }

    fn snapshot(&self, mut ids: Vec<u64>) -> Vec<SubscriberInfo> {
        ids.sort_unstable();
        ids.into_iter()
            .filter_map(|id| self.subs.get(&id).map(|s| s.info()))
            .collect()
    }
}

impl ConnectionMetricsCollector for LongPollingService {
    fn name(&self) -> &str {
        "long_polling"
    }

    fn total_count(&self) -> usize {
        self.subs.len()
    }

    fn count_for_ip(&self, ip: &str) -> usize {
        self.by_client_ip.get(ip).map_or(0, |ids| ids.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ConfigCacheConfig;
    use crate::service::cache::FatalHandler;
    use crate::service::disk::LocalDiskService;
    use quince_common::{EventPublisher, md5_hex};
    use quince_control::ConnectionControlRule;

    struct NoopFatal;

    impl FatalHandler for NoopFatal {
        fn on_disk_failure(&self, _group_key: &str, _error: &anyhow::Error) {}
    }

    fn setup(
        dir: &std::path::Path,
        rule: ConnectionControlRule,
        config: LongPollingConfig,
    ) -> (Arc<LongPollingService>, Arc<ConfigCacheService>) {
        let cache = Arc::new(ConfigCacheService::new(
            Arc::new(LocalDiskService::new(dir)),
            Arc::new(NoopFatal),
            EventPublisher::new(16),
            ConfigCacheConfig::default(),
        ));
        let control = Arc::new(ConnectionControlManager::new(rule));
        let service = Arc::new(LongPollingService::new(cache.clone(), control.clone(), config));
        control.register_collector(service.clone());
        (service, cache)
    }

    fn request(ip: &str, key: &str, md5: &str) -> LongPollingRequest {
        LongPollingRequest {
            client_md5_map: HashMap::from([(key.to_string(), md5.to_string())]),
            client_ip: ip.to_string(),
            app_name: "orders".to_string(),
            timeout_ms: 30_000,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_stale_client_answered_now() {
        let dir = tempfile::tempdir().unwrap();
        let (service, cache) = setup(dir.path(), ConnectionControlRule::default(), LongPollingConfig::default());
        assert!(cache.dump("a", "G", "", "v1", 1, "text", "").await);

        match service.add_long_polling_client(request("10.0.0.1", "a+G", "old")) {
            PendingPoll::Ready(changed) => assert_eq!(changed, vec!["a+G"]),
            other => panic!("expected ready, got {:?}", other),
        }
        assert_eq!(service.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_no_hang_up_returns_empty() {
        let dir = tempfile::tempdir().unwrap();
        let (service, _cache) = setup(dir.path(), ConnectionControlRule::default(), LongPollingConfig::default());
        let mut req = request("10.0.0.1", "a+G", "");
        req.no_hang_up = true;

        match service.add_long_polling_client(req) {
            PendingPoll::Ready(changed) => assert!(changed.is_empty()),
            other => panic!("expected ready, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_ip_limit_rejects() {
        let dir = tempfile::tempdir().unwrap();
        let (service, _cache) = setup(
            dir.path(),
            ConnectionControlRule::default().with_ip_limit("10.0.0.1", 1),
            LongPollingConfig::default(),
        );

        assert!(matches!(
            service.add_long_polling_client(request("10.0.0.1", "a+G", "")),
            PendingPoll::Suspended(_)
        ));
        assert_eq!(service.count_for_ip("10.0.0.1"), 1);
        assert!(matches!(
            service.add_long_polling_client(request("10.0.0.1", "b+G", "")),
            PendingPoll::Rejected(_)
        ));
        assert_eq!(service.subscriber_count(), 1);
    }

    #[tokio::test]
    async fn test_beta_change_only_wakes_beta_clients() {
        let dir = tempfile::tempdir().unwrap();
        let (service, cache) = setup(dir.path(), ConnectionControlRule::default(), LongPollingConfig::default());
        assert!(cache.dump("a", "G", "", "v1", 1, "text", "").await);
        let md5 = md5_hex("v1");

        let PendingPoll::Suspended(beta_rx) = service.add_long_polling_client(request("10.0.0.1", "a+G", &md5)) else {
            panic!("expected suspended");
        };
        let PendingPoll::Suspended(_other_rx) = service.add_long_polling_client(request("10.0.0.2", "a+G", &md5)) else {
            panic!("expected suspended");
        };

        assert!(
            cache
                .dump_gray("a", "G", "", crate::model::GrayRule::beta("10.0.0.1"), "beta", 2, "")
                .await
        );
        service.on_data_change(&LocalDataChangeEvent::gray("a+G", &crate::model::GrayRule::beta("10.0.0.1")));

        assert_eq!(beta_rx.await.unwrap(), vec!["a+G"]);
        assert_eq!(service.collect_subscribe_info("a+G").len(), 1);
        assert_eq!(service.collect_subscribe_info_by_ip("10.0.0.2").len(), 1);
        assert!(service.collect_subscribe_info_by_ip("10.0.0.1").is_empty());
    }

    #[tokio::test]
    async fn test_rescan_answers_stale_polls() {
        let dir = tempfile::tempdir().unwrap();
        let (service, cache) = setup(dir.path(), ConnectionControlRule::default(), LongPollingConfig::default());

        let PendingPoll::Suspended(rx) = service.add_long_polling_client(request("10.0.0.1", "a+G", "")) else {
            panic!("expected suspended");
        };
        // no subscriber is running, so only the rescan sees the change
        assert!(cache.dump("a", "G", "", "v1", 1, "text", "").await);
        service.rescan();

        assert_eq!(rx.await.unwrap(), vec!["a+G"]);
        assert_eq!(service.subscriber_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fixed_polling_reports_changes_at_interval() {
        let dir = tempfile::tempdir().unwrap();
        let config = LongPollingConfig {
            fixed_polling: true,
            fixed_polling_interval_ms: 2_000,
            ..Default::default()
        };
        let (service, cache) = setup(dir.path(), ConnectionControlRule::default(), config);
        assert!(cache.dump("a", "G", "", "v1", 1, "text", "").await);

        // even a stale client waits for the interval
        let PendingPoll::Suspended(rx) = service.add_long_polling_client(request("10.0.0.1", "a+G", "old")) else {
            panic!("expected suspended");
        };
        let started = tokio::time::Instant::now();
        assert_eq!(rx.await.unwrap(), vec!["a+G"]);
        assert!(started.elapsed() >= Duration::from_millis(2_000));
    }
}
