//! Spin read/write lock guarding a cache item
//!
//! Never blocks. Readers and the single writer try a CAS on one status word:
//! 0 is free, a positive value counts readers, -1 marks the writer.

use std::sync::Arc;
use std::sync::atomic::{AtomicI32, Ordering};

use crate::model::CacheItem;

const WRITE_LOCKED: i32 = -1;

#[derive(Debug, Default)]
pub struct SimpleReadWriteLock {
    status: AtomicI32,
}

impl SimpleReadWriteLock {
    pub fn try_read_lock(&self) -> bool {
        let mut current = self.status.load(Ordering::Acquire);
        loop {
            if current == WRITE_LOCKED {
                return false;
            }
            match self.status.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    pub fn release_read_lock(&self) {
        self.status.fetch_sub(1, Ordering::AcqRel);
    }

    pub fn try_write_lock(&self) -> bool {
        self.status
            .compare_exchange(0, WRITE_LOCKED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn release_write_lock(&self) {
        self.status.store(0, Ordering::Release);
    }

    pub fn is_write_locked(&self) -> bool {
        self.status.load(Ordering::Acquire) == WRITE_LOCKED
    }

    pub fn readers(&self) -> i32 {
        self.status.load(Ordering::Acquire).max(0)
    }
}

/// Try `attempt` up to `retries` times, yielding the thread in between.
pub(crate) fn spin(retries: u32, mut attempt: impl FnMut() -> bool) -> bool {
    for i in 0..retries.max(1) {
        if attempt() {
            return true;
        }
        if i + 1 < retries {
            std::thread::yield_now();
        }
    }
    false
}

/// Read lock on a cache item, released when dropped
#[derive(Debug)]
pub struct ConfigReadGuard {
    item: Arc<CacheItem>,
}

impl ConfigReadGuard {
    pub(crate) fn new(item: Arc<CacheItem>) -> Self {
        Self { item }
    }

    pub fn item(&self) -> &CacheItem {
        &self.item
    }
}

impl Drop for ConfigReadGuard {
    fn drop(&mut self) {
        self.item.rw_lock().release_read_lock();
    }
}

/// Write lock on a cache item, released when dropped
pub(crate) struct ConfigWriteGuard {
    item: Arc<CacheItem>,
}

impl ConfigWriteGuard {
    pub(crate) fn new(item: Arc<CacheItem>) -> Self {
        Self { item }
    }

    pub(crate) fn item(&self) -> &CacheItem {
        &self.item
    }
}

impl Drop for ConfigWriteGuard {
    fn drop(&mut self) {
        self.item.rw_lock().release_write_lock();
    }
}

/// Outcome of `ConfigCacheService::try_config_read_lock`
#[derive(Debug)]
pub enum ReadLockResult {
    /// No cache item for the group key
    Absent,
    Acquired(ConfigReadGuard),
    /// A dump held the write lock for every retry
    Failed,
}

impl ReadLockResult {
    /// Numeric form: 0 absent, 1 acquired, -1 failed
    pub fn code(&self) -> i32 {
        match self {
            ReadLockResult::Absent => 0,
            ReadLockResult::Acquired(_) => 1,
            ReadLockResult::Failed => -1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_readers_share_writer_excludes() {
        let lock = SimpleReadWriteLock::default();
        assert!(lock.try_read_lock());
        assert!(lock.try_read_lock());
        assert_eq!(lock.readers(), 2);
        assert!(!lock.try_write_lock());

        lock.release_read_lock();
        lock.release_read_lock();
        assert!(lock.try_write_lock());
        assert!(lock.is_write_locked());
        assert!(!lock.try_read_lock());

        lock.release_write_lock();
        assert!(lock.try_read_lock());
    }

    #[test]
    fn test_spin_gives_up_after_retries() {
        let mut attempts = 0;
        assert!(!spin(3, || {
            attempts += 1;
            false
        }));
        assert_eq!(attempts, 3);

        let mut attempts = 0;
        assert!(spin(10, || {
            attempts += 1;
            attempts == 2
        }));
        assert_eq!(attempts, 2);
    }

    #[test]
    fn test_guard_releases_on_drop() {
        let item = Arc::new(CacheItem::new("a+G"));
        assert!(item.rw_lock().try_read_lock());
        let guard = ConfigReadGuard::new(item.clone());
        assert_eq!(guard.item().group_key(), "a+G");
        assert_eq!(item.rw_lock().readers(), 1);
        drop(guard);
        assert_eq!(item.rw_lock().readers(), 0);

        let result = ReadLockResult::Failed;
        assert_eq!(result.code(), -1);
    }
}
