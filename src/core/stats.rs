//! 运行统计 - 原子计数,工作任务汇合后一次性快照

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// 运行期间的共享计数器,全部修改走原子操作
#[derive(Debug, Default)]
pub struct SyncStats {
    pub files_new: AtomicU64,
    pub files_updated: AtomicU64,
    pub files_skipped: AtomicU64,
    pub files_failed: AtomicU64,
    pub files_deleted: AtomicU64,
    pub delete_failed: AtomicU64,
    pub deletions_previewed: AtomicU64,
    pub hash_backfilled: AtomicU64,
    pub backfill_failed: AtomicU64,
    pub compared_by_hash: AtomicU64,
    pub compared_by_size: AtomicU64,
    pub bytes_uploaded: AtomicU64,
    pub bytes_skipped: AtomicU64,
    pub cache_hits: AtomicU64,
    pub cache_misses: AtomicU64,
    pub remote_lookups: AtomicU64,
    pub fingerprint_writes: AtomicU64,
    pub fingerprint_write_failed: AtomicU64,
    pub rendered: AtomicU64,
    pub render_fallbacks: AtomicU64,
    pub render_skipped: AtomicU64,
}

impl SyncStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc(&self, counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, counter: &AtomicU64, value: u64) {
        counter.fetch_add(value, Ordering::Relaxed);
    }

    /// 读取快照,只应在所有工作任务汇合之后调用
    pub fn snapshot(&self) -> StatsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        StatsSnapshot {
            files_new: load(&self.files_new),
            files_updated: load(&self.files_updated),
            files_skipped: load(&self.files_skipped),
            files_failed: load(&self.files_failed),
            files_deleted: load(&self.files_deleted),
            delete_failed: load(&self.delete_failed),
            deletions_previewed: load(&self.deletions_previewed),
            hash_backfilled: load(&self.hash_backfilled),
            backfill_failed: load(&self.backfill_failed),
            compared_by_hash: load(&self.compared_by_hash),
            compared_by_size: load(&self.compared_by_size),
            bytes_uploaded: load(&self.bytes_uploaded),
            bytes_skipped: load(&self.bytes_skipped),
            cache_hits: load(&self.cache_hits),
            cache_misses: load(&self.cache_misses),
            remote_lookups: load(&self.remote_lookups),
            fingerprint_writes: load(&self.fingerprint_writes),
            fingerprint_write_failed: load(&self.fingerprint_write_failed),
            rendered: load(&self.rendered),
            render_fallbacks: load(&self.render_fallbacks),
            render_skipped: load(&self.render_skipped),
        }
    }
}

/// 结构化的结束报告字段
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StatsSnapshot {
    pub files_new: u64,
    pub files_updated: u64,
    pub files_skipped: u64,
    pub files_failed: u64,
    pub files_deleted: u64,
    pub delete_failed: u64,
    pub deletions_previewed: u64,
    pub hash_backfilled: u64,
    pub backfill_failed: u64,
    pub compared_by_hash: u64,
    pub compared_by_size: u64,
    pub bytes_uploaded: u64,
    pub bytes_skipped: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub remote_lookups: u64,
    pub fingerprint_writes: u64,
    pub fingerprint_write_failed: u64,
    pub rendered: u64,
    pub render_fallbacks: u64,
    pub render_skipped: u64,
}

/// 字节数的可读格式
pub fn format_bytes(bytes: u64) -> String {
    let mut value = bytes as f64;
    for unit in ["B", "KB", "MB", "GB"] {
        if value < 1024.0 {
            return format!("{:.1} {}", value, unit);
        }
        value /= 1024.0;
    }
    format!("{:.1} TB", value)
}
