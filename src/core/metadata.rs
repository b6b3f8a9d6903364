//! 指纹元数据批量写入
//!
//! 把零散的字段更新合并为固定大小的批请求;批失败退化为逐条重放,
//! 一条坏数据不能抹掉同批其他条目的更新

use crate::core::stats::SyncStats;
use crate::remote::{FingerprintUpdate, RemoteStore, BATCH_LIMIT};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// 待写入的指纹记录
#[derive(Debug, Clone)]
struct PendingWrite {
    update: FingerprintUpdate,
    path: String,
    /// 回填写入（没有伴随内容传输）
    backfill: bool,
}

pub struct MetadataBatcher {
    store: Arc<dyn RemoteStore>,
    stats: Arc<SyncStats>,
    pending: Mutex<Vec<PendingWrite>>,
}

impl MetadataBatcher {
    pub fn new(store: Arc<dyn RemoteStore>, stats: Arc<SyncStats>) -> Self {
        Self {
            store,
            stats,
            pending: Mutex::new(Vec::new()),
        }
    }

    /// 入队一条写入,攒满一批立即冲刷
    pub async fn enqueue(&self, list_item_id: String, hash: String, path: String, backfill: bool) {
        let full_batch = {
            let mut pending = self.pending.lock().await;
            pending.push(PendingWrite {
                update: FingerprintUpdate { list_item_id, hash },
                path,
                backfill,
            });
            if pending.len() >= BATCH_LIMIT {
                Some(pending.drain(..).collect::<Vec<_>>())
            } else {
                None
            }
        };

        if let Some(batch) = full_batch {
            self.flush_batch(batch).await;
        }
    }

    /// 运行结束时的显式冲刷,排队中的写入不会被悄悄丢弃
    pub async fn flush(&self) {
        let remaining: Vec<PendingWrite> = {
            let mut pending = self.pending.lock().await;
            pending.drain(..).collect()
        };
        for chunk in remaining.chunks(BATCH_LIMIT) {
            self.flush_batch(chunk.to_vec()).await;
        }
    }

    async fn flush_batch(&self, batch: Vec<PendingWrite>) {
        if batch.is_empty() {
            return;
        }
        debug!("批量写入 {} 条指纹", batch.len());

        let updates: Vec<FingerprintUpdate> = batch.iter().map(|w| w.update.clone()).collect();
        match self.store.write_fingerprint_batch(&updates).await {
            Ok(results) => {
                for (write, ok) in batch.iter().zip(results) {
                    if ok {
                        self.record_success(write);
                    } else {
                        // 单项失败逐条重放一次
                        self.write_single(write).await;
                    }
                }
            }
            Err(e) => {
                warn!("批量写入失败,逐条重放: {}", e);
                for write in &batch {
                    self.write_single(write).await;
                }
            }
        }
    }

    async fn write_single(&self, write: &PendingWrite) {
        match self
            .store
            .write_fingerprint(&write.update.list_item_id, &write.update.hash)
            .await
        {
            Ok(()) => self.record_success(write),
            Err(e) => {
                warn!("指纹写入失败: {} - {}", write.path, e);
                self.record_failure(write);
            }
        }
    }

    fn record_success(&self, write: &PendingWrite) {
        if write.backfill {
            self.stats.inc(&self.stats.hash_backfilled);
        }
        self.stats.inc(&self.stats.fingerprint_writes);
    }

    fn record_failure(&self, write: &PendingWrite) {
        if write.backfill {
            self.stats.inc(&self.stats.backfill_failed);
        }
        self.stats.inc(&self.stats.fingerprint_write_failed);
    }
}
