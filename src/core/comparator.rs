//! 差异判定 - 为每个本地条目决定唯一的同步动作
//!
//! 判定只取决于 (本地条目, 对应远端条目或缺失, 指纹支持标志),
//! 指纹在更廉价的测试无法排除时才计算

use crate::core::scanner::{FileKind, LocalEntry};
use crate::remote::RemoteEntry;
use anyhow::Result;
use serde::Serialize;

/// 同步动作
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncAction {
    /// 内容未变化,跳过
    Skip,
    /// 远端不存在,新建
    Create,
    /// 内容有差异,覆盖
    Update,
    /// 内容按大小判断未变化,仅补写缺失的指纹
    Backfill,
}

impl SyncAction {
    /// 执行排序权重,保证动作顺序稳定
    pub fn execution_order(&self) -> u8 {
        match self {
            SyncAction::Create => 0,
            SyncAction::Update => 1,
            SyncAction::Backfill => 2,
            SyncAction::Skip => 3,
        }
    }
}

/// 判定依据
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecisionReason {
    NotInRemote,
    HashMatch,
    HashMismatch,
    /// 远端无指纹,大小一致;内容未变化是推定而非证明
    SizeMatch,
    SizeMismatch,
    Forced,
}

impl DecisionReason {
    pub fn compared_by_hash(&self) -> bool {
        matches!(self, DecisionReason::HashMatch | DecisionReason::HashMismatch)
    }

    pub fn compared_by_size(&self) -> bool {
        matches!(self, DecisionReason::SizeMatch | DecisionReason::SizeMismatch)
    }
}

/// 单个条目的判定结果,每个本地条目恰好一条
#[derive(Debug, Clone)]
pub struct SyncDecision {
    pub relative_path: String,
    pub action: SyncAction,
    pub reason: DecisionReason,
    pub size: u64,
}

/// 判定统计
#[derive(Debug, Clone, Default)]
pub struct DecisionSummary {
    pub create_count: usize,
    pub update_count: usize,
    pub skip_count: usize,
    pub backfill_count: usize,
    pub transfer_bytes: u64,
    pub skipped_bytes: u64,
}

pub fn summarize<'a>(decisions: impl IntoIterator<Item = &'a SyncDecision>) -> DecisionSummary {
    let mut summary = DecisionSummary::default();
    for d in decisions {
        match d.action {
            SyncAction::Create => {
                summary.create_count += 1;
                summary.transfer_bytes += d.size;
            }
            SyncAction::Update => {
                summary.update_count += 1;
                summary.transfer_bytes += d.size;
            }
            SyncAction::Skip => {
                summary.skip_count += 1;
                summary.skipped_bytes += d.size;
            }
            SyncAction::Backfill => {
                summary.backfill_count += 1;
                summary.skipped_bytes += d.size;
            }
        }
    }
    summary
}

/// 差异判定器
pub struct Comparator {
    fingerprint_support: bool,
    force_upload: bool,
    /// 源指纹察觉不到渲染配置的变化,这个开关强制文档重走渲染与上传
    force_rerender: bool,
}

impl Comparator {
    pub fn new(fingerprint_support: bool, force_upload: bool, force_rerender: bool) -> Self {
        Self {
            fingerprint_support,
            force_upload,
            force_rerender,
        }
    }

    pub async fn decide(
        &self,
        local: &LocalEntry,
        remote: Option<&RemoteEntry>,
    ) -> Result<SyncDecision> {
        let make = |action, reason| SyncDecision {
            relative_path: local.relative_path.clone(),
            action,
            reason,
            size: local.size,
        };

        if self.force_upload || (self.force_rerender && local.kind == FileKind::Document) {
            return Ok(match remote {
                Some(_) => make(SyncAction::Update, DecisionReason::Forced),
                None => make(SyncAction::Create, DecisionReason::Forced),
            });
        }

        let Some(remote) = remote else {
            return Ok(make(SyncAction::Create, DecisionReason::NotInRemote));
        };

        if self.fingerprint_support {
            if let Some(remote_hash) = remote.content_hash.as_deref() {
                // 指纹可比,此时才计算本地指纹
                let local_hash = local.content_hash().await?;
                return Ok(if local_hash == remote_hash {
                    make(SyncAction::Skip, DecisionReason::HashMatch)
                } else {
                    make(SyncAction::Update, DecisionReason::HashMismatch)
                });
            }
        }

        // 远端指纹缺失,退化为大小比较
        if local.size == remote.size {
            if self.fingerprint_support {
                Ok(make(SyncAction::Backfill, DecisionReason::SizeMatch))
            } else {
                Ok(make(SyncAction::Skip, DecisionReason::SizeMatch))
            }
        } else {
            Ok(make(SyncAction::Update, DecisionReason::SizeMismatch))
        }
    }
}
