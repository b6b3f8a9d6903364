//! 同步引擎 - 按阶段编排整个镜像过程
//!
//! 阶段严格串行: 能力探测与缓存构建 -> 差异判定 -> 渲染与上传 ->
//! 回填与批量冲刷 -> 删除对账 -> 汇总报告;阶段内部按文件并发

use crate::config::SyncSettings;
use crate::core::cache::{FolderTree, RemoteCache};
use crate::core::comparator::{self, Comparator, SyncAction, SyncDecision};
use crate::core::paths;
use crate::core::scanner::{FileKind, LocalEntry};
use crate::core::stats::{format_bytes, StatsSnapshot, SyncStats};
use crate::core::metadata::MetadataBatcher;
use crate::remote::{RemoteEntry, RemoteError, RemoteStore, UploadReceipt};
use crate::render::{render_with_recovery, DocumentRenderer, RenderOutcome};
use anyhow::{anyhow, Result};
use bytes::Bytes;
use futures::StreamExt;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

/// 差异判定阶段的哈希并发度
const DIFF_CONCURRENCY: usize = 8;

/// 引擎配置
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// 上传工作池大小
    pub upload_workers: usize,
    /// 渲染池固定大小,让渲染延迟与上传延迟重叠
    pub render_workers: usize,
    /// 大文件阈值（字节）,达到后改用会话分块上传
    pub large_file_threshold: u64,
    /// 每个文件的最大尝试次数
    pub max_retries: u32,
    /// 重试基础延迟（毫秒）,逐次翻倍
    pub retry_base_delay_ms: u64,
    pub force_upload: bool,
    pub force_rerender: bool,
    pub sync_delete: bool,
    pub sync_delete_preview: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            upload_workers: 4,
            render_workers: 4,
            large_file_threshold: 250 * 1024 * 1024,
            max_retries: 3,
            retry_base_delay_ms: 2000,
            force_upload: false,
            force_rerender: false,
            sync_delete: false,
            sync_delete_preview: true,
        }
    }
}

impl SyncConfig {
    pub fn from_settings(settings: &SyncSettings) -> Self {
        Self {
            upload_workers: settings.upload_workers,
            max_retries: settings.max_retries,
            force_upload: settings.force_upload,
            force_rerender: settings.force_rerender,
            sync_delete: settings.sync_delete,
            sync_delete_preview: settings.sync_delete_preview,
            ..Default::default()
        }
    }
}

/// 运行结束状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Completed,
    Failed,
}

/// 结构化的结束报告
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncReport {
    pub run_id: String,
    pub start_time: i64,
    pub end_time: i64,
    pub duration: u64,
    pub status: RunStatus,
    pub files_scanned: u32,
    pub stats: StatsSnapshot,
    /// 永久失败的文件路径
    pub failed_paths: Vec<String>,
    pub errors: Vec<String>,
}

/// 单个文件的上传结果
#[derive(Debug, Clone)]
pub struct UploadOutcome {
    pub relative_path: String,
    pub succeeded: bool,
    pub attempts: u32,
    pub bytes_transferred: u64,
    pub final_hash: Option<String>,
    pub error: Option<String>,
}

/// 上传任务共享的上下文
struct UploadContext {
    store: Arc<dyn RemoteStore>,
    renderer: Option<Arc<dyn DocumentRenderer>>,
    cache: Option<Arc<RemoteCache>>,
    folders: Arc<FolderTree>,
    batcher: Arc<MetadataBatcher>,
    stats: Arc<SyncStats>,
    config: SyncConfig,
    fingerprint_support: bool,
}

/// 同步引擎
pub struct SyncEngine {
    store: Arc<dyn RemoteStore>,
    renderer: Option<Arc<dyn DocumentRenderer>>,
    config: SyncConfig,
    stats: Arc<SyncStats>,
}

impl SyncEngine {
    pub fn new(
        store: Arc<dyn RemoteStore>,
        renderer: Option<Arc<dyn DocumentRenderer>>,
        config: SyncConfig,
    ) -> Self {
        Self {
            store,
            renderer,
            config,
            stats: Arc::new(SyncStats::new()),
        }
    }

    pub fn stats(&self) -> &SyncStats {
        &self.stats
    }

    /// 运行一次完整同步
    pub async fn run(&self, entries: Vec<Arc<LocalEntry>>) -> Result<SyncReport> {
        let run_id = uuid::Uuid::new_v4().to_string();
        let start_time = chrono::Utc::now().timestamp();
        let started = Instant::now();

        info!(
            "开始同步: {} 个候选文件 -> {}",
            entries.len(),
            self.store.name()
        );

        // 能力探测,探测失败按不支持处理,只提示一次
        let fingerprint_support = match self.store.probe_fingerprint_support().await {
            Ok(supported) => supported,
            Err(e) => {
                warn!("指纹能力探测失败: {}", e);
                false
            }
        };
        if !fingerprint_support {
            info!("指纹字段不可用,本次运行全程使用大小比较");
        }

        // 同步根解析失败属于致命错误,在派发任何工作之前中止
        let root_id = self
            .store
            .resolve_root()
            .await
            .map_err(|e| anyhow!("解析同步根目录失败: {}", e))?;

        // 缓存构建失败不致命,整个运行降级为逐文件查询
        let cache = match RemoteCache::build(self.store.as_ref(), &root_id, fingerprint_support).await
        {
            Ok(c) => Some(Arc::new(c)),
            Err(e) => {
                warn!("构建远端缓存失败,本次运行降级为逐文件查询: {}", e);
                None
            }
        };

        let folders = Arc::new(FolderTree::new(root_id.clone()));
        if let Some(cache) = &cache {
            folders.seed(cache.folder_ids().await).await;
        }

        let mut errors: Vec<String> = Vec::new();
        let mut failed_paths: Vec<String> = Vec::new();

        // 差异判定,哈希按需计算,受限并发
        let comparator = Comparator::new(
            fingerprint_support,
            self.config.force_upload,
            self.config.force_rerender,
        );
        let decision_results: Vec<_> = futures::stream::iter(entries.iter().cloned())
            .map(|entry| {
                let cache = cache.clone();
                let store = self.store.clone();
                let stats = self.stats.clone();
                let comparator = &comparator;
                let root_id = root_id.as_str();
                async move {
                    let remote = match &cache {
                        Some(cache) => {
                            let found = cache.get(&entry.relative_path).await;
                            if found.is_some() {
                                stats.inc(&stats.cache_hits);
                            } else {
                                stats.inc(&stats.cache_misses);
                            }
                            found
                        }
                        None => {
                            stats.inc(&stats.remote_lookups);
                            match store.stat_file(root_id, &entry.relative_path).await {
                                Ok(found) => found,
                                Err(e) => {
                                    warn!(
                                        "逐文件查询失败,按新文件处理: {} - {}",
                                        entry.relative_path, e
                                    );
                                    None
                                }
                            }
                        }
                    };
                    let decision = comparator.decide(&entry, remote.as_ref()).await;
                    (entry, remote, decision)
                }
            })
            .buffered(DIFF_CONCURRENCY)
            .collect()
            .await;

        let mut work: Vec<(Arc<LocalEntry>, SyncDecision, Option<RemoteEntry>)> = Vec::new();
        for (entry, remote, decision) in decision_results {
            match decision {
                Ok(d) => {
                    if d.reason.compared_by_hash() {
                        self.stats.inc(&self.stats.compared_by_hash);
                    } else if d.reason.compared_by_size() {
                        self.stats.inc(&self.stats.compared_by_size);
                    }
                    work.push((entry, d, remote));
                }
                Err(e) => {
                    self.stats.inc(&self.stats.files_failed);
                    errors.push(format!("{}: {}", entry.relative_path, e));
                    failed_paths.push(entry.relative_path.clone());
                }
            }
        }

        // 稳定次序: 动作优先级在前,路径次序在后
        work.sort_by(|a, b| {
            a.1.action
                .execution_order()
                .cmp(&b.1.action.execution_order())
                .then_with(|| a.1.relative_path.cmp(&b.1.relative_path))
        });

        let summary = comparator::summarize(work.iter().map(|(_, d, _)| d));
        info!(
            "差异判定完成: 新建 {},更新 {},回填 {},跳过 {}",
            summary.create_count, summary.update_count, summary.backfill_count, summary.skip_count
        );

        // 跳过与回填都不传内容,渲染也一并省掉
        for (entry, decision, _) in &work {
            match decision.action {
                SyncAction::Skip => {
                    self.stats.inc(&self.stats.files_skipped);
                    self.stats.add(&self.stats.bytes_skipped, decision.size);
                    if entry.kind == FileKind::Document {
                        self.stats.inc(&self.stats.render_skipped);
                    }
                }
                SyncAction::Backfill => {
                    self.stats.add(&self.stats.bytes_skipped, decision.size);
                    if entry.kind == FileKind::Document {
                        self.stats.inc(&self.stats.render_skipped);
                    }
                }
                _ => {}
            }
        }

        let batcher = Arc::new(MetadataBatcher::new(self.store.clone(), self.stats.clone()));

        // 渲染与上传,两个独立的有界工作池
        let upload_sem = Arc::new(Semaphore::new(self.config.upload_workers));
        let render_sem = Arc::new(Semaphore::new(self.config.render_workers));
        let mut handles = Vec::new();

        for (entry, decision, _) in &work {
            if !matches!(decision.action, SyncAction::Create | SyncAction::Update) {
                continue;
            }
            let ctx = UploadContext {
                store: self.store.clone(),
                renderer: self.renderer.clone(),
                cache: cache.clone(),
                folders: folders.clone(),
                batcher: batcher.clone(),
                stats: self.stats.clone(),
                config: self.config.clone(),
                fingerprint_support,
            };
            let entry = entry.clone();
            let is_update = decision.action == SyncAction::Update;
            let upload_sem = upload_sem.clone();
            let render_sem = render_sem.clone();

            handles.push(tokio::spawn(async move {
                Self::process_file(ctx, entry, is_update, upload_sem, render_sem).await
            }));
        }

        // 等待上传阶段全部汇合;单个文件失败不会波及其他文件
        for handle in handles {
            match handle.await {
                Ok(outcome) => {
                    if !outcome.succeeded {
                        if let Some(e) = &outcome.error {
                            errors.push(format!("{}: {}", outcome.relative_path, e));
                        }
                        failed_paths.push(outcome.relative_path.clone());
                    }
                }
                Err(e) => {
                    self.stats.inc(&self.stats.files_failed);
                    errors.push(format!("上传任务异常退出: {}", e));
                }
            }
        }

        // 回填: 只写指纹,不传内容
        if fingerprint_support {
            let backfill_results: Vec<_> = futures::stream::iter(
                work.iter()
                    .filter(|(_, d, _)| d.action == SyncAction::Backfill),
            )
            .map(|(entry, _, remote)| async move {
                let hash = entry.content_hash().await.map(str::to_string);
                (entry, remote, hash)
            })
            .buffered(DIFF_CONCURRENCY)
            .collect()
            .await;

            for (entry, remote, hash) in backfill_results {
                let list_item_id = remote.as_ref().and_then(|r| r.list_item_id.clone());
                match (hash, list_item_id) {
                    (Ok(hash), Some(id)) => {
                        debug!("回填缺失指纹: {}", entry.relative_path);
                        batcher
                            .enqueue(id, hash, entry.relative_path.clone(), true)
                            .await;
                    }
                    (Err(e), _) => {
                        warn!("回填哈希计算失败: {} - {}", entry.relative_path, e);
                        self.stats.inc(&self.stats.backfill_failed);
                    }
                    (_, None) => {
                        debug!("缺少列表项 ID,无法回填: {}", entry.relative_path);
                        self.stats.inc(&self.stats.backfill_failed);
                    }
                }
            }
        }

        // 运行结束的显式冲刷,排队的指纹写入都落盘
        batcher.flush().await;

        // 删除对账
        if self.config.sync_delete {
            self.reconcile_deletions(cache.as_deref(), &entries, &mut errors)
                .await;
        }

        // 所有工作汇合之后才取快照
        let stats = self.stats.snapshot();
        let end_time = chrono::Utc::now().timestamp();
        let status = if stats.files_failed > 0 || stats.delete_failed > 0 {
            RunStatus::Failed
        } else {
            RunStatus::Completed
        };

        failed_paths.sort();
        info!(
            "同步完成: 新建 {},更新 {},跳过 {},回填 {},删除 {},失败 {},上传 {},省去 {}",
            stats.files_new,
            stats.files_updated,
            stats.files_skipped,
            stats.hash_backfilled,
            stats.files_deleted,
            stats.files_failed,
            format_bytes(stats.bytes_uploaded),
            format_bytes(stats.bytes_skipped)
        );

        Ok(SyncReport {
            run_id,
            start_time,
            end_time,
            duration: started.elapsed().as_secs(),
            status,
            files_scanned: entries.len() as u32,
            stats,
            failed_paths,
            errors,
        })
    }

    /// 处理单个新建/更新文件: 渲染(如需)、上传、就地更新缓存、入队指纹
    async fn process_file(
        ctx: UploadContext,
        entry: Arc<LocalEntry>,
        is_update: bool,
        upload_sem: Arc<Semaphore>,
        render_sem: Arc<Semaphore>,
    ) -> UploadOutcome {
        let mut outcome = UploadOutcome {
            relative_path: entry.relative_path.clone(),
            succeeded: false,
            attempts: 0,
            bytes_transferred: 0,
            final_hash: None,
            error: None,
        };

        // 本地读取失败不重试
        let source = match tokio::fs::read(&entry.source_path).await {
            Ok(data) => Bytes::from(data),
            Err(e) => {
                error!("读取本地文件失败: {} - {}", entry.relative_path, e);
                outcome.error = Some(format!("读取本地文件失败: {}", e));
                ctx.stats.inc(&ctx.stats.files_failed);
                return outcome;
            }
        };

        // 指纹取转换前的源内容,渲染输出对相同输入不保证字节稳定
        let source_hash = match entry.content_hash().await {
            Ok(h) => h.to_string(),
            Err(e) => {
                outcome.error = Some(format!("哈希计算失败: {}", e));
                ctx.stats.inc(&ctx.stats.files_failed);
                return outcome;
            }
        };

        // 文档类先过渲染池;两次失败永久回退为原始内容与原始名称
        let (payload, target_path) = if entry.kind == FileKind::Document {
            match &ctx.renderer {
                Some(renderer) => {
                    let _permit = match render_sem.acquire().await {
                        Ok(p) => p,
                        Err(_) => {
                            outcome.error = Some("渲染池已关闭".to_string());
                            ctx.stats.inc(&ctx.stats.files_failed);
                            return outcome;
                        }
                    };
                    match render_with_recovery(renderer.as_ref(), &source, &entry.source_relative)
                        .await
                    {
                        RenderOutcome::Rendered(output) => {
                            ctx.stats.inc(&ctx.stats.rendered);
                            (Bytes::from(output), entry.relative_path.clone())
                        }
                        RenderOutcome::Fallback => {
                            ctx.stats.inc(&ctx.stats.render_fallbacks);
                            (source.clone(), entry.source_relative.clone())
                        }
                    }
                }
                None => (source.clone(), entry.source_relative.clone()),
            }
        } else {
            (source.clone(), entry.relative_path.clone())
        };

        let _permit = match upload_sem.acquire().await {
            Ok(p) => p,
            Err(_) => {
                outcome.error = Some("上传池已关闭".to_string());
                ctx.stats.inc(&ctx.stats.files_failed);
                return outcome;
            }
        };

        let dir = paths::parent_dir(&target_path).to_string();
        let name = paths::file_name(&target_path).to_string();
        let max_attempts = ctx.config.max_retries.max(1);

        for attempt in 1..=max_attempts {
            outcome.attempts = attempt;

            match Self::attempt_upload(&ctx, &dir, &name, payload.clone()).await {
                Ok((receipt, parent_id)) => {
                    Self::finish_upload(
                        &ctx,
                        &target_path,
                        &name,
                        &parent_id,
                        receipt,
                        &source_hash,
                        payload.len() as u64,
                        is_update,
                    )
                    .await;
                    outcome.succeeded = true;
                    outcome.bytes_transferred = payload.len() as u64;
                    outcome.final_hash = Some(source_hash.clone());
                    break;
                }
                Err(e) if e.is_retryable() && attempt < max_attempts => {
                    // 服务端的等待提示优先于本地计算的退避
                    let delay = e.retry_after().unwrap_or_else(|| {
                        Duration::from_millis(
                            ctx.config.retry_base_delay_ms << (attempt - 1).min(16),
                        )
                    });
                    warn!(
                        "上传失败,{:?} 后重试 ({}/{}): {} - {}",
                        delay, attempt, max_attempts, target_path, e
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    // 不可重试或预算用尽;失败只影响这个文件
                    error!("上传最终失败: {} - {}", target_path, e);
                    outcome.error = Some(e.to_string());
                    break;
                }
            }
        }

        if !outcome.succeeded {
            ctx.stats.inc(&ctx.stats.files_failed);
        }
        outcome
    }

    /// 单次上传尝试: 确保目录链存在,按大小选择传输策略
    async fn attempt_upload(
        ctx: &UploadContext,
        dir: &str,
        name: &str,
        payload: Bytes,
    ) -> Result<(UploadReceipt, String), RemoteError> {
        let parent_id = ctx.folders.ensure(ctx.store.as_ref(), dir).await?;
        let receipt = if (payload.len() as u64) < ctx.config.large_file_threshold {
            ctx.store.upload_small(&parent_id, name, payload).await?
        } else {
            ctx.store.upload_chunked(&parent_id, name, payload).await?
        };
        Ok((receipt, parent_id))
    }

    /// 上传成功后的收尾: 读己之写的缓存更新与指纹入队
    #[allow(clippy::too_many_arguments)]
    async fn finish_upload(
        ctx: &UploadContext,
        target_path: &str,
        name: &str,
        parent_id: &str,
        receipt: UploadReceipt,
        source_hash: &str,
        payload_len: u64,
        is_update: bool,
    ) {
        let mut list_item_id = receipt.list_item_id.clone();
        if list_item_id.is_none() && ctx.fingerprint_support {
            list_item_id = match ctx.store.lookup_list_item_id(parent_id, name).await {
                Ok(id) => id,
                Err(e) => {
                    debug!("补查列表项 ID 失败: {} - {}", target_path, e);
                    None
                }
            };
        }

        if let Some(cache) = &ctx.cache {
            cache
                .update_after_write(RemoteEntry {
                    path: target_path.to_string(),
                    item_id: receipt.item_id.clone(),
                    list_item_id: list_item_id.clone(),
                    content_hash: ctx
                        .fingerprint_support
                        .then(|| source_hash.to_string()),
                    size: payload_len,
                    is_folder: false,
                })
                .await;
        }

        if ctx.fingerprint_support {
            match list_item_id {
                Some(id) => {
                    ctx.batcher
                        .enqueue(id, source_hash.to_string(), target_path.to_string(), false)
                        .await;
                }
                None => {
                    warn!("拿不到列表项 ID,跳过指纹写入: {}", target_path);
                    ctx.stats.inc(&ctx.stats.fingerprint_write_failed);
                }
            }
        }

        if is_update {
            ctx.stats.inc(&ctx.stats.files_updated);
            info!("文件已更新: {}", target_path);
        } else {
            ctx.stats.inc(&ctx.stats.files_new);
            info!("文件已上传: {}", target_path);
        }
        ctx.stats.add(&ctx.stats.bytes_uploaded, payload_len);
    }

    /// 删除对账: 缓存中没有本地对应的条目即候选
    async fn reconcile_deletions(
        &self,
        cache: Option<&RemoteCache>,
        entries: &[Arc<LocalEntry>],
        errors: &mut Vec<String>,
    ) {
        // 候选只来自缓存;缓存不可用时无法区分"未命中"与"已删除"
        let Some(cache) = cache else {
            warn!("远端缓存不可用,跳过删除对账");
            return;
        };

        // 两侧路径经过同一净化流程;文档类把渲染目标与源名都视为存在
        let mut keep: HashSet<String> = HashSet::new();
        for entry in entries {
            keep.insert(entry.relative_path.clone());
            keep.insert(entry.source_relative.clone());
        }

        let candidates = cache.files_not_in(&keep).await;
        if candidates.is_empty() {
            info!("没有需要删除的远端条目");
            return;
        }

        if self.config.sync_delete_preview {
            for candidate in &candidates {
                info!("预览删除: {}", candidate.path);
                self.stats.inc(&self.stats.deletions_previewed);
            }
            info!(
                "预览模式: {} 个条目将被删除,未发出删除请求",
                candidates.len()
            );
            return;
        }

        for candidate in candidates {
            match self.store.delete_item(&candidate.item_id).await {
                Ok(()) => {
                    info!("已删除: {}", candidate.path);
                    self.stats.inc(&self.stats.files_deleted);
                    cache.remove(&candidate.path).await;
                }
                Err(e) => {
                    warn!("删除失败: {} - {}", candidate.path, e);
                    self.stats.inc(&self.stats.delete_failed);
                    errors.push(format!("{}: {}", candidate.path, e));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::hasher;
    use crate::core::scanner::{LocalScanner, ScanConfig};
    use crate::remote::{FingerprintUpdate, RemoteChild};
    use crate::render::RenderError;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::path::Path;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::sync::Mutex;

    #[derive(Debug, Clone)]
    struct MockFile {
        size: u64,
        hash: Option<String>,
        content: Vec<u8>,
    }

    #[derive(Default)]
    struct MockState {
        files: HashMap<String, MockFile>,
        folders: HashSet<String>,
    }

    /// 上传失败注入方式
    #[derive(Clone, Copy, PartialEq)]
    enum FailMode {
        None,
        /// 每次都返回服务端错误（可重试）
        AlwaysServer,
        /// 每次都返回权限错误（不可重试）
        AlwaysPermission,
        /// 列表调用失败,用于触发缓存降级
        Listing,
        /// 根目录解析失败,用于触发致命中止
        Resolve,
    }

    struct MockRemote {
        state: Mutex<MockState>,
        fingerprint_support: bool,
        fail_mode: FailMode,
        small_uploads: AtomicU32,
        chunked_uploads: AtomicU32,
        delete_calls: AtomicU32,
        single_writes: AtomicU32,
        batch_items: AtomicU32,
        stat_calls: AtomicU32,
    }

    impl MockRemote {
        fn new(fingerprint_support: bool) -> Self {
            Self {
                state: Mutex::new(MockState::default()),
                fingerprint_support,
                fail_mode: FailMode::None,
                small_uploads: AtomicU32::new(0),
                chunked_uploads: AtomicU32::new(0),
                delete_calls: AtomicU32::new(0),
                single_writes: AtomicU32::new(0),
                batch_items: AtomicU32::new(0),
                stat_calls: AtomicU32::new(0),
            }
        }

        fn with_fail_mode(mut self, mode: FailMode) -> Self {
            self.fail_mode = mode;
            self
        }

        async fn seed_file(&self, path: &str, size: u64, hash: Option<&str>) {
            let mut state = self.state.lock().await;
            // 预置文件顺带补齐目录链
            let mut dir = paths::parent_dir(path);
            while !dir.is_empty() {
                state.folders.insert(dir.to_string());
                dir = paths::parent_dir(dir);
            }
            state.files.insert(
                path.to_string(),
                MockFile {
                    size,
                    hash: hash.map(str::to_string),
                    content: Vec::new(),
                },
            );
        }

        async fn file(&self, path: &str) -> Option<MockFile> {
            self.state.lock().await.files.get(path).cloned()
        }

        async fn file_count(&self) -> usize {
            self.state.lock().await.files.len()
        }

        fn uploads(&self) -> u32 {
            self.small_uploads.load(Ordering::SeqCst) + self.chunked_uploads.load(Ordering::SeqCst)
        }

        fn fingerprint_requests(&self) -> u32 {
            self.single_writes.load(Ordering::SeqCst) + self.batch_items.load(Ordering::SeqCst)
        }

        fn folder_id(path: &str) -> String {
            if path.is_empty() {
                "root".to_string()
            } else {
                format!("dir:{}", path)
            }
        }

        fn folder_path(id: &str) -> String {
            if id == "root" {
                String::new()
            } else {
                id.strip_prefix("dir:").unwrap_or(id).to_string()
            }
        }

        fn join(dir: &str, name: &str) -> String {
            if dir.is_empty() {
                name.to_string()
            } else {
                format!("{}/{}", dir, name)
            }
        }

        async fn do_upload(
            &self,
            parent_id: &str,
            name: &str,
            data: Bytes,
        ) -> Result<UploadReceipt, RemoteError> {
            match self.fail_mode {
                FailMode::AlwaysServer => return Err(RemoteError::Server { status: 503 }),
                FailMode::AlwaysPermission => {
                    return Err(RemoteError::Permission { status: 403 })
                }
                _ => {}
            }
            let path = Self::join(&Self::folder_path(parent_id), name);
            let mut state = self.state.lock().await;
            state.files.insert(
                path.clone(),
                MockFile {
                    size: data.len() as u64,
                    hash: None,
                    content: data.to_vec(),
                },
            );
            // 上传响应不带列表项 ID,引擎需要补查
            Ok(UploadReceipt {
                item_id: format!("it:{}", path),
                list_item_id: None,
            })
        }
    }

    #[async_trait]
    impl RemoteStore for MockRemote {
        async fn probe_fingerprint_support(&self) -> Result<bool, RemoteError> {
            Ok(self.fingerprint_support)
        }

        async fn resolve_root(&self) -> Result<String, RemoteError> {
            if self.fail_mode == FailMode::Resolve {
                return Err(RemoteError::Permission { status: 403 });
            }
            Ok("root".to_string())
        }

        async fn list_children(
            &self,
            folder_id: &str,
            with_fingerprint: bool,
        ) -> Result<Vec<RemoteChild>, RemoteError> {
            if self.fail_mode == FailMode::Listing {
                return Err(RemoteError::Server { status: 503 });
            }
            let parent = Self::folder_path(folder_id);
            let state = self.state.lock().await;
            let mut children = Vec::new();

            for (path, file) in &state.files {
                if paths::parent_dir(path) == parent {
                    children.push(RemoteChild {
                        name: paths::file_name(path).to_string(),
                        item_id: format!("it:{}", path),
                        list_item_id: Some(format!("li:{}", path)),
                        content_hash: if with_fingerprint { file.hash.clone() } else { None },
                        size: file.size,
                        is_folder: false,
                    });
                }
            }
            for folder in &state.folders {
                if paths::parent_dir(folder) == parent && !folder.is_empty() {
                    children.push(RemoteChild {
                        name: paths::file_name(folder).to_string(),
                        item_id: Self::folder_id(folder),
                        list_item_id: None,
                        content_hash: None,
                        size: 0,
                        is_folder: true,
                    });
                }
            }
            Ok(children)
        }

        async fn stat_file(
            &self,
            _root_id: &str,
            rel_path: &str,
        ) -> Result<Option<RemoteEntry>, RemoteError> {
            self.stat_calls.fetch_add(1, Ordering::SeqCst);
            let state = self.state.lock().await;
            Ok(state.files.get(rel_path).map(|f| RemoteEntry {
                path: rel_path.to_string(),
                item_id: format!("it:{}", rel_path),
                list_item_id: Some(format!("li:{}", rel_path)),
                content_hash: f.hash.clone(),
                size: f.size,
                is_folder: false,
            }))
        }

        async fn upload_small(
            &self,
            parent_id: &str,
            name: &str,
            data: Bytes,
        ) -> Result<UploadReceipt, RemoteError> {
            self.small_uploads.fetch_add(1, Ordering::SeqCst);
            self.do_upload(parent_id, name, data).await
        }

        async fn upload_chunked(
            &self,
            parent_id: &str,
            name: &str,
            data: Bytes,
        ) -> Result<UploadReceipt, RemoteError> {
            self.chunked_uploads.fetch_add(1, Ordering::SeqCst);
            self.do_upload(parent_id, name, data).await
        }

        async fn lookup_list_item_id(
            &self,
            parent_id: &str,
            name: &str,
        ) -> Result<Option<String>, RemoteError> {
            let path = Self::join(&Self::folder_path(parent_id), name);
            let state = self.state.lock().await;
            Ok(state.files.contains_key(&path).then(|| format!("li:{}", path)))
        }

        async fn write_fingerprint(
            &self,
            list_item_id: &str,
            hash: &str,
        ) -> Result<(), RemoteError> {
            self.single_writes.fetch_add(1, Ordering::SeqCst);
            let path = list_item_id.strip_prefix("li:").unwrap_or(list_item_id);
            let mut state = self.state.lock().await;
            if let Some(file) = state.files.get_mut(path) {
                file.hash = Some(hash.to_string());
            }
            Ok(())
        }

        async fn write_fingerprint_batch(
            &self,
            updates: &[FingerprintUpdate],
        ) -> Result<Vec<bool>, RemoteError> {
            self.batch_items
                .fetch_add(updates.len() as u32, Ordering::SeqCst);
            let mut state = self.state.lock().await;
            for update in updates {
                let path = update
                    .list_item_id
                    .strip_prefix("li:")
                    .unwrap_or(&update.list_item_id);
                if let Some(file) = state.files.get_mut(path) {
                    file.hash = Some(update.hash.clone());
                }
            }
            Ok(vec![true; updates.len()])
        }

        async fn ensure_folder(&self, parent_id: &str, name: &str) -> Result<String, RemoteError> {
            let path = Self::join(&Self::folder_path(parent_id), name);
            self.state.lock().await.folders.insert(path.clone());
            Ok(Self::folder_id(&path))
        }

        async fn delete_item(&self, item_id: &str) -> Result<(), RemoteError> {
            self.delete_calls.fetch_add(1, Ordering::SeqCst);
            let path = item_id.strip_prefix("it:").unwrap_or(item_id).to_string();
            self.state.lock().await.files.remove(&path);
            Ok(())
        }

        fn name(&self) -> &str {
            "mock"
        }
    }

    /// 渲染输出可预测的测试渲染器
    struct WrapRenderer;

    #[async_trait]
    impl DocumentRenderer for WrapRenderer {
        async fn render(&self, source: &[u8], _name: &str) -> Result<Vec<u8>, RenderError> {
            Ok([b"<html>".as_slice(), source, b"</html>".as_slice()].concat())
        }
    }

    struct BrokenRenderer;

    #[async_trait]
    impl DocumentRenderer for BrokenRenderer {
        async fn render(&self, _source: &[u8], _name: &str) -> Result<Vec<u8>, RenderError> {
            Err(RenderError::Failed("渲染崩溃".to_string()))
        }
    }

    fn write(dir: &Path, rel: &str, content: &[u8]) {
        let path = dir.join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, content).unwrap();
    }

    fn scan(dir: &Path, render: bool) -> Vec<Arc<LocalEntry>> {
        LocalScanner::new(ScanConfig {
            pattern: dir.join("**/*").to_string_lossy().to_string(),
            recursive: true,
            exclude_patterns: vec![],
            render_documents: render,
        })
        .scan()
        .unwrap()
    }

    fn fast_config() -> SyncConfig {
        SyncConfig {
            retry_base_delay_ms: 1,
            ..Default::default()
        }
    }

    fn engine(store: Arc<MockRemote>, config: SyncConfig) -> SyncEngine {
        SyncEngine::new(store, None, config)
    }

    #[tokio::test]
    async fn test_unchanged_tree_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "a.txt", b"hello");
        write(dir.path(), "sub/b.bin", b"0123456789");

        let store = Arc::new(MockRemote::new(true));
        store
            .seed_file("a.txt", 5, Some(&hasher::hash_bytes(b"hello")))
            .await;
        store
            .seed_file("sub/b.bin", 10, Some(&hasher::hash_bytes(b"0123456789")))
            .await;

        let engine = engine(store.clone(), fast_config());
        let report = engine.run(scan(dir.path(), false)).await.unwrap();

        assert_eq!(report.status, RunStatus::Completed);
        assert_eq!(report.stats.files_skipped, 2);
        assert_eq!(report.stats.files_new, 0);
        assert_eq!(report.stats.files_updated, 0);
        assert_eq!(report.stats.bytes_uploaded, 0);
        assert_eq!(report.stats.bytes_skipped, 15);
        assert_eq!(store.uploads(), 0);
    }

    #[tokio::test]
    async fn test_skip_and_update_scenario() {
        // a.txt 指纹一致 -> 跳过;b.bin 指纹不一致 -> 更新;c.txt 远端没有 -> 新建
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "a.txt", b"hello");
        write(dir.path(), "b.bin", b"0123456789");
        write(dir.path(), "c.txt", b"new");

        let store = Arc::new(MockRemote::new(true));
        store
            .seed_file("a.txt", 5, Some(&hasher::hash_bytes(b"hello")))
            .await;
        store.seed_file("b.bin", 10, Some("stale-hash")).await;

        let engine = engine(store.clone(), fast_config());
        let report = engine.run(scan(dir.path(), false)).await.unwrap();

        assert_eq!(report.stats.files_skipped, 1);
        assert_eq!(report.stats.files_updated, 1);
        assert_eq!(report.stats.files_new, 1);
        assert_eq!(store.uploads(), 2);

        // 写成功后指纹经批量端点落盘
        let b = store.file("b.bin").await.unwrap();
        assert_eq!(b.hash.as_deref(), Some(hasher::hash_bytes(b"0123456789").as_str()));
        assert_eq!(b.content, b"0123456789");
        assert!(store.file("c.txt").await.is_some());
    }

    #[tokio::test]
    async fn test_no_fingerprint_support_uses_size_only() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "same.txt", b"12345");
        write(dir.path(), "changed.txt", b"1234567");

        let store = Arc::new(MockRemote::new(false));
        // 远端即使带着指纹值也不参与比较
        store.seed_file("same.txt", 5, Some("whatever")).await;
        store.seed_file("changed.txt", 3, Some("whatever")).await;

        let engine = engine(store.clone(), fast_config());
        let report = engine.run(scan(dir.path(), false)).await.unwrap();

        assert_eq!(report.stats.files_skipped, 1);
        assert_eq!(report.stats.files_updated, 1);
        assert_eq!(report.stats.compared_by_size, 2);
        assert_eq!(report.stats.compared_by_hash, 0);
        // 能力缺失时不发出任何指纹写入请求
        assert_eq!(store.fingerprint_requests(), 0);
    }

    #[tokio::test]
    async fn test_backfill_writes_metadata_without_transfer() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "quiet.txt", b"12345");
        write(dir.path(), "grown.txt", b"123456");

        let store = Arc::new(MockRemote::new(true));
        // 大小一致但指纹缺失 -> 回填;大小不一致 -> 上传
        store.seed_file("quiet.txt", 5, None).await;
        store.seed_file("grown.txt", 3, None).await;

        let engine = engine(store.clone(), fast_config());
        let report = engine.run(scan(dir.path(), false)).await.unwrap();

        assert_eq!(report.stats.hash_backfilled, 1);
        assert_eq!(report.stats.files_updated, 1);
        assert_eq!(store.uploads(), 1);

        // 回填只有一次元数据写入,没有内容传输
        let quiet = store.file("quiet.txt").await.unwrap();
        assert_eq!(quiet.hash.as_deref(), Some(hasher::hash_bytes(b"12345").as_str()));
        assert!(quiet.content.is_empty());
    }

    #[tokio::test]
    async fn test_deletion_preview_is_side_effect_free() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "kept.txt", b"k");

        let store = Arc::new(MockRemote::new(true));
        store
            .seed_file("kept.txt", 1, Some(&hasher::hash_bytes(b"k")))
            .await;
        store.seed_file("old.md", 9, Some("h")).await;

        let config = SyncConfig {
            sync_delete: true,
            sync_delete_preview: true,
            ..fast_config()
        };

        // 本地文件消失后反复预览,远端条目数不减少
        for _ in 0..2 {
            let engine = engine(store.clone(), config.clone());
            let report = engine.run(scan(dir.path(), false)).await.unwrap();
            assert_eq!(report.stats.deletions_previewed, 1);
            assert_eq!(report.stats.files_deleted, 0);
            assert_eq!(store.delete_calls.load(Ordering::SeqCst), 0);
            assert_eq!(store.file_count().await, 2);
        }
    }

    #[tokio::test]
    async fn test_deletion_executes_when_preview_off() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "kept.txt", b"k");

        let store = Arc::new(MockRemote::new(true));
        store
            .seed_file("kept.txt", 1, Some(&hasher::hash_bytes(b"k")))
            .await;
        store.seed_file("old.md", 9, Some("h")).await;

        let config = SyncConfig {
            sync_delete: true,
            sync_delete_preview: false,
            ..fast_config()
        };
        let engine = engine(store.clone(), config);
        let report = engine.run(scan(dir.path(), false)).await.unwrap();

        assert_eq!(report.stats.files_deleted, 1);
        assert!(store.file("old.md").await.is_none());
        assert!(store.file("kept.txt").await.is_some());
        assert_eq!(report.status, RunStatus::Completed);
    }

    #[tokio::test]
    async fn test_retryable_failure_uses_every_attempt() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "doomed.txt", b"x");

        let store = Arc::new(MockRemote::new(true).with_fail_mode(FailMode::AlwaysServer));
        let config = SyncConfig {
            max_retries: 3,
            ..fast_config()
        };
        let engine = engine(store.clone(), config);
        let report = engine.run(scan(dir.path(), false)).await.unwrap();

        // 可重试错误打满预算: 恰好 3 次尝试,记一次永久失败
        assert_eq!(store.small_uploads.load(Ordering::SeqCst), 3);
        assert_eq!(report.stats.files_failed, 1);
        assert_eq!(report.status, RunStatus::Failed);
        assert_eq!(report.failed_paths, vec!["doomed.txt".to_string()]);
    }

    #[tokio::test]
    async fn test_permanent_error_fails_immediately() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "forbidden.txt", b"x");
        write(dir.path(), "fine-too.txt", b"y");

        let store = Arc::new(MockRemote::new(true).with_fail_mode(FailMode::AlwaysPermission));
        let engine = engine(store.clone(), fast_config());
        let report = engine.run(scan(dir.path(), false)).await.unwrap();

        // 权限类错误不重试,两个文件各一次尝试,互不影响
        assert_eq!(store.small_uploads.load(Ordering::SeqCst), 2);
        assert_eq!(report.stats.files_failed, 2);
        assert_eq!(report.status, RunStatus::Failed);
    }

    #[tokio::test]
    async fn test_large_file_uses_chunked_strategy() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "big.bin", b"0123456789");
        write(dir.path(), "small.bin", b"01");

        let store = Arc::new(MockRemote::new(true));
        let config = SyncConfig {
            large_file_threshold: 8,
            ..fast_config()
        };
        let engine = engine(store.clone(), config);
        engine.run(scan(dir.path(), false)).await.unwrap();

        assert_eq!(store.chunked_uploads.load(Ordering::SeqCst), 1);
        assert_eq!(store.small_uploads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_document_rendered_with_source_hash() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "note.md", b"# title");

        let store = Arc::new(MockRemote::new(true));
        let engine = SyncEngine::new(store.clone(), Some(Arc::new(WrapRenderer)), fast_config());
        let report = engine.run(scan(dir.path(), true)).await.unwrap();

        assert_eq!(report.stats.rendered, 1);

        // 上传的是渲染目标名与渲染输出
        let html = store.file("note.html").await.unwrap();
        assert_eq!(html.content, b"<html># title</html>");
        // 指纹是转换前源内容的指纹,渲染输出不保证字节稳定
        assert_eq!(html.hash.as_deref(), Some(hasher::hash_bytes(b"# title").as_str()));
        assert!(store.file("note.md").await.is_none());
    }

    #[tokio::test]
    async fn test_render_failure_falls_back_to_original() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "note.md", b"# title");

        let store = Arc::new(MockRemote::new(true));
        let engine = SyncEngine::new(store.clone(), Some(Arc::new(BrokenRenderer)), fast_config());
        let report = engine.run(scan(dir.path(), true)).await.unwrap();

        assert_eq!(report.stats.render_fallbacks, 1);
        assert_eq!(report.status, RunStatus::Completed);

        // 回退上传原始内容与原始名称
        let md = store.file("note.md").await.unwrap();
        assert_eq!(md.content, b"# title");
        assert!(store.file("note.html").await.is_none());
    }

    #[tokio::test]
    async fn test_unchanged_document_skips_renderer() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "note.md", b"# title");

        let store = Arc::new(MockRemote::new(true));
        store
            .seed_file("note.html", 7, Some(&hasher::hash_bytes(b"# title")))
            .await;

        // 故意挂一个必失败的渲染器,验证跳过路径根本不会触碰它
        let engine = SyncEngine::new(store.clone(), Some(Arc::new(BrokenRenderer)), fast_config());
        let report = engine.run(scan(dir.path(), true)).await.unwrap();

        assert_eq!(report.stats.files_skipped, 1);
        assert_eq!(report.stats.render_skipped, 1);
        assert_eq!(report.stats.render_fallbacks, 0);
        assert_eq!(store.uploads(), 0);
    }

    #[tokio::test]
    async fn test_cache_failure_degrades_to_per_file_lookups() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "a.txt", b"hello");

        let store = Arc::new(MockRemote::new(true).with_fail_mode(FailMode::Listing));
        store
            .seed_file("a.txt", 5, Some(&hasher::hash_bytes(b"hello")))
            .await;

        let config = SyncConfig {
            sync_delete: true,
            sync_delete_preview: false,
            ..fast_config()
        };
        let engine = engine(store.clone(), config);
        let report = engine.run(scan(dir.path(), false)).await.unwrap();

        // 逐文件查询仍然得出正确决定
        assert!(report.stats.remote_lookups >= 1);
        assert_eq!(report.stats.files_skipped, 1);
        // 缓存缺席时删除对账被跳过,而不是误删
        assert_eq!(store.delete_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_fatal_setup_error_aborts_before_dispatch() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "a.txt", b"hello");

        let store = Arc::new(MockRemote::new(true).with_fail_mode(FailMode::Resolve));
        let engine = engine(store.clone(), fast_config());

        assert!(engine.run(scan(dir.path(), false)).await.is_err());
        assert_eq!(store.uploads(), 0);
    }

    #[tokio::test]
    async fn test_force_upload_overwrites_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "a.txt", b"hello");

        let store = Arc::new(MockRemote::new(true));
        store
            .seed_file("a.txt", 5, Some(&hasher::hash_bytes(b"hello")))
            .await;

        let config = SyncConfig {
            force_upload: true,
            ..fast_config()
        };
        let engine = engine(store.clone(), config);
        let report = engine.run(scan(dir.path(), false)).await.unwrap();

        assert_eq!(report.stats.files_skipped, 0);
        assert_eq!(report.stats.files_updated, 1);
        assert_eq!(store.uploads(), 1);
    }
}
