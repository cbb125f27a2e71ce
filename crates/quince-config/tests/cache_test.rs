//! Config cache dump, remove and disk failure behaviour.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;

use quince_common::{EventPublisher, md5_hex};
use quince_config::{
    ConfigCacheConfig, ConfigCacheService, ConfigDiskService, FatalHandler, GrayRule,
};

#[derive(Default)]
struct RecordingDisk {
    saved: Mutex<Vec<(String, String)>>,
    removed: AtomicUsize,
    fail_saves: AtomicBool,
}

#[async_trait]
impl ConfigDiskService for RecordingDisk {
    async fn save_to_disk(&self, data_id: &str, _group: &str, _tenant: &str, content: &str) -> anyhow::Result<()> {
        if self.fail_saves.load(Ordering::SeqCst) {
            anyhow::bail!("disk full");
        }
        self.saved.lock().push((data_id.to_string(), content.to_string()));
        Ok(())
    }

    async fn save_gray_to_disk(
        &self,
        data_id: &str,
        _group: &str,
        _tenant: &str,
        _gray_name: &str,
        content: &str,
    ) -> anyhow::Result<()> {
        self.saved.lock().push((data_id.to_string(), content.to_string()));
        Ok(())
    }

    async fn remove_config_info(&self, _data_id: &str, _group: &str, _tenant: &str) -> anyhow::Result<()> {
        self.removed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn remove_gray(&self, _data_id: &str, _group: &str, _tenant: &str, _gray_name: &str) -> anyhow::Result<()> {
        self.removed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn read_config_info(&self, _data_id: &str, _group: &str, _tenant: &str) -> anyhow::Result<Option<String>> {
        Ok(None)
    }
}

#[derive(Default)]
struct RecordingFatal {
    failures: Mutex<Vec<String>>,
}

impl FatalHandler for RecordingFatal {
    fn on_disk_failure(&self, group_key: &str, _error: &anyhow::Error) {
        self.failures.lock().push(group_key.to_string());
    }
}

fn service() -> (Arc<ConfigCacheService>, Arc<RecordingDisk>, Arc<RecordingFatal>) {
    let disk = Arc::new(RecordingDisk::default());
    let fatal = Arc::new(RecordingFatal::default());
    let cache = Arc::new(ConfigCacheService::new(
        disk.clone(),
        fatal.clone(),
        EventPublisher::new(64),
        ConfigCacheConfig::default(),
    ));
    (cache, disk, fatal)
}

#[tokio::test]
async fn stale_dump_changes_nothing() {
    let (cache, disk, _) = service();
    assert!(cache.dump("g1", "G", "T", "v1", 10, "text", "").await);
    let mut events = cache.events().subscribe();

    assert!(cache.dump("g1", "G", "T", "v2", 5, "text", "").await);

    let item = cache.get_content_cache("g1+G+T").unwrap();
    assert_eq!(item.md5(), md5_hex("v1"));
    assert_eq!(item.last_modified_ts(), 10);
    assert_eq!(item.config_cache().content, "v1");
    assert_eq!(disk.saved.lock().len(), 1);
    assert!(events.try_recv().is_err());
}

#[tokio::test]
async fn remove_after_dump_removes_from_disk_once() {
    let (cache, disk, _) = service();
    assert!(cache.dump("g1", "G", "T", "v1", 1, "text", "").await);

    assert!(cache.remove("g1", "G", "T").await);
    assert!(cache.get_content_cache("g1+G+T").is_none());
    assert_eq!(disk.removed.load(Ordering::SeqCst), 1);

    // absent keys are a successful no-op
    assert!(cache.remove("g1", "G", "T").await);
    assert_eq!(disk.removed.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn disk_failure_is_escalated() {
    let (cache, disk, fatal) = service();
    disk.fail_saves.store(true, Ordering::SeqCst);
    let mut events = cache.events().subscribe();

    assert!(!cache.dump("g1", "G", "", "v1", 1, "text", "").await);
    assert_eq!(fatal.failures.lock().as_slice(), ["g1+G".to_string()]);
    // memory was already updated and announced
    assert_eq!(events.recv().await.unwrap().group_key, "g1+G");
    assert_eq!(cache.content_md5("g1+G", "10.0.0.1", None), Some(md5_hex("v1")));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn newest_timestamp_wins_under_contention() {
    let (cache, _, _) = service();
    let tasks: Vec<_> = (0..20i64)
        .map(|ts| {
            let cache = cache.clone();
            tokio::spawn(async move {
                let content = format!("v{}", ts);
                // a dump may lose the write lock race; callers retry
                while !cache.dump("g1", "G", "", &content, ts, "text", "").await {
                    tokio::task::yield_now().await;
                }
            })
        })
        .collect();
    for task in tasks {
        task.await.unwrap();
    }

    let item = cache.get_content_cache("g1+G").unwrap();
    assert_eq!(item.last_modified_ts(), 19);
    assert_eq!(item.config_cache().content, "v19");
}

#[tokio::test]
async fn invalid_identity_never_reaches_disk() {
    let (cache, disk, fatal) = service();

    assert!(!cache.dump("g1", "G", "team a", "v1", 1, "text", "").await);
    assert!(!cache.dump("../etc", "G", "", "v1", 1, "text", "").await);
    assert!(
        !cache
            .dump_gray("g1", "G", "", GrayRule::tag("blue green"), "v1", 1, "")
            .await
    );

    assert!(cache.is_empty());
    assert!(disk.saved.lock().is_empty());
    assert!(fatal.failures.lock().is_empty());
}
