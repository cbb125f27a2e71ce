//! Long polling completion by change and by timeout.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use quince_common::{EventPublisher, md5_hex};
use quince_config::{
    ConfigCacheConfig, ConfigCacheService, ConfigDiskService, FatalHandler, LongPollingConfig,
    LongPollingRequest, LongPollingService, PendingPoll,
};
use quince_control::ConnectionControlManager;

struct NullDisk;

#[async_trait]
impl ConfigDiskService for NullDisk {
    async fn save_to_disk(&self, _: &str, _: &str, _: &str, _: &str) -> anyhow::Result<()> {
        Ok(())
    }

    async fn save_gray_to_disk(&self, _: &str, _: &str, _: &str, _: &str, _: &str) -> anyhow::Result<()> {
        Ok(())
    }

    async fn remove_config_info(&self, _: &str, _: &str, _: &str) -> anyhow::Result<()> {
        Ok(())
    }

    async fn remove_gray(&self, _: &str, _: &str, _: &str, _: &str) -> anyhow::Result<()> {
        Ok(())
    }

    async fn read_config_info(&self, _: &str, _: &str, _: &str) -> anyhow::Result<Option<String>> {
        Ok(None)
    }
}

struct NoopFatal;

impl FatalHandler for NoopFatal {
    fn on_disk_failure(&self, _group_key: &str, _error: &anyhow::Error) {}
}

async fn setup() -> (Arc<LongPollingService>, Arc<ConfigCacheService>) {
    let cache = Arc::new(ConfigCacheService::new(
        Arc::new(NullDisk),
        Arc::new(NoopFatal),
        EventPublisher::new(64),
        ConfigCacheConfig::default(),
    ));
    assert!(cache.dump("g1", "G", "T", "A", 1, "text", "").await);

    let control = Arc::new(ConnectionControlManager::default());
    let service = Arc::new(LongPollingService::new(
        cache.clone(),
        control.clone(),
        LongPollingConfig::default(),
    ));
    control.register_collector(service.clone());
    service.clone().start_subscriber();
    (service, cache)
}

fn watch(timeout_ms: u64) -> LongPollingRequest {
    LongPollingRequest {
        client_md5_map: HashMap::from([("g1+G+T".to_string(), md5_hex("A"))]),
        client_ip: "10.0.0.1".to_string(),
        app_name: "orders".to_string(),
        timeout_ms,
        ..Default::default()
    }
}

#[tokio::test(start_paused = true)]
async fn change_completes_pending_poll_once() {
    let (service, cache) = setup().await;
    let PendingPoll::Suspended(rx) = service.add_long_polling_client(watch(5_000)) else {
        panic!("client is up to date and should wait");
    };
    assert_eq!(service.subscriber_count(), 1);

    let started = tokio::time::Instant::now();
    let writer = {
        let cache = cache.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(1_100)).await;
            assert!(cache.dump("g1", "G", "T", "B", 2, "text", "").await);
        })
    };

    assert_eq!(rx.await.unwrap(), vec!["g1+G+T".to_string()]);
    assert!(started.elapsed() >= Duration::from_millis(1_100));
    assert!(started.elapsed() < Duration::from_millis(9_500));
    writer.await.unwrap();
    assert_eq!(service.subscriber_count(), 0);

    // the cancelled timer must not resurrect or answer the poll
    tokio::time::sleep(Duration::from_millis(20_000)).await;
    assert_eq!(service.subscriber_count(), 0);
    assert!(service.collect_subscribe_info("g1+G+T").is_empty());
}

#[tokio::test(start_paused = true)]
async fn timeout_is_floored_and_answers_empty() {
    let (service, _cache) = setup().await;
    let PendingPoll::Suspended(rx) = service.add_long_polling_client(watch(1_000)) else {
        panic!("client is up to date and should wait");
    };

    let started = tokio::time::Instant::now();
    let changed = rx.await.unwrap();
    let waited = started.elapsed();

    assert!(changed.is_empty());
    // max(1000, 10000) - 500
    assert!(waited >= Duration::from_millis(9_500));
    assert!(waited < Duration::from_millis(10_000));
    assert_eq!(service.subscriber_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn change_before_registration_does_not_wake() {
    let (service, cache) = setup().await;
    assert!(cache.dump("g1", "G", "T", "B", 2, "text", "").await);
    tokio::task::yield_now().await;

    let mut request = watch(30_000);
    request
        .client_md5_map
        .insert("g1+G+T".to_string(), md5_hex("B"));
    let PendingPoll::Suspended(rx) = service.add_long_polling_client(request) else {
        panic!("client already has the latest digest");
    };

    let started = tokio::time::Instant::now();
    assert!(rx.await.unwrap().is_empty());
    assert!(started.elapsed() >= Duration::from_millis(29_500));
}

#[tokio::test(start_paused = true)]
async fn unchanged_digest_does_not_wake() {
    let (service, cache) = setup().await;
    let PendingPoll::Suspended(mut rx) = service.add_long_polling_client(watch(30_000)) else {
        panic!("client is up to date and should wait");
    };

    // same content, newer timestamp: no event, poll keeps waiting
    assert!(cache.dump("g1", "G", "T", "A", 5, "text", "").await);
    tokio::time::sleep(Duration::from_millis(1_000)).await;
    assert!(rx.try_recv().is_err());
    assert_eq!(service.subscriber_count(), 1);
}
