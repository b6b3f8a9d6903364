pub mod auth;
pub mod graph;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub use graph::GraphStore;

// ============ 公共常量 ============

/// 非传输类请求超时（秒）- 列表、字段更新、删除等
pub const OP_TIMEOUT_SECS: u64 = 60;
/// 传输类请求超时（秒）- 上传内容、分块
pub const IO_TIMEOUT_SECS: u64 = 300;
/// 批量端点单次请求的子请求上限
pub const BATCH_LIMIT: usize = 20;

/// 远端条目,缓存键为同步根下的相对路径
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteEntry {
    pub path: String,
    /// 驱动器条目 ID（内容操作用）
    pub item_id: String,
    /// 列表项 ID（字段更新用）,可能缺失
    pub list_item_id: Option<String>,
    /// 指纹值,None 表示未知
    pub content_hash: Option<String>,
    pub size: u64,
    pub is_folder: bool,
}

/// 目录列表返回的单个子项（相对路径由缓存构建方拼接）
#[derive(Debug, Clone)]
pub struct RemoteChild {
    pub name: String,
    pub item_id: String,
    pub list_item_id: Option<String>,
    pub content_hash: Option<String>,
    pub size: u64,
    pub is_folder: bool,
}

/// 上传成功后的回执
#[derive(Debug, Clone)]
pub struct UploadReceipt {
    pub item_id: String,
    /// 上传响应中通常不带列表项 ID,需要补查
    pub list_item_id: Option<String>,
}

/// 单条指纹字段写入请求
#[derive(Debug, Clone)]
pub struct FingerprintUpdate {
    pub list_item_id: String,
    pub hash: String,
}

/// 远端 API 错误分类,决定重试策略
#[derive(Debug, thiserror::Error)]
pub enum RemoteError {
    /// 429,携带服务端指示的等待时间
    #[error("请求被限流 (429)")]
    RateLimited { retry_after: Option<Duration> },
    #[error("服务端错误 ({status})")]
    Server { status: u16 },
    #[error("请求超时")]
    Timeout,
    /// 409,文件可能被锁定或正在处理,短暂重试通常可恢复
    #[error("资源冲突 (409)")]
    Conflict,
    #[error("认证失败或权限不足 ({status})")]
    Permission { status: u16 },
    #[error("名称或路径不合法: {message}")]
    InvalidName { message: String },
    #[error("存储配额不足")]
    Quota,
    #[error("条目不存在")]
    NotFound,
    #[error("网络错误: {0}")]
    Network(String),
    #[error("接口返回异常 ({status}): {message}")]
    Api { status: u16, message: String },
}

impl RemoteError {
    /// 是否属于可重试的瞬时错误
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RemoteError::RateLimited { .. }
                | RemoteError::Server { .. }
                | RemoteError::Timeout
                | RemoteError::Conflict
                | RemoteError::Network(_)
        )
    }

    /// 服务端给出的等待提示,优先于本地计算的退避
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            RemoteError::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }

    /// 按状态码归类响应错误
    pub fn from_status(status: u16, message: String, retry_after: Option<Duration>) -> Self {
        match status {
            429 => RemoteError::RateLimited { retry_after },
            409 => RemoteError::Conflict,
            401 | 403 => RemoteError::Permission { status },
            404 => RemoteError::NotFound,
            507 => RemoteError::Quota,
            400 if message.contains("invalid") || message.contains("name") => {
                RemoteError::InvalidName { message }
            }
            s if (500..600).contains(&s) => RemoteError::Server { status },
            _ => RemoteError::Api { status, message },
        }
    }
}

impl From<reqwest::Error> for RemoteError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            RemoteError::Timeout
        } else {
            RemoteError::Network(e.to_string())
        }
    }
}

/// 远端文档库抽象接口
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// 探测指纹字段是否可用,每次运行只调用一次
    async fn probe_fingerprint_support(&self) -> Result<bool, RemoteError>;

    /// 解析同步根目录（必要时逐级创建）,返回其条目 ID
    async fn resolve_root(&self) -> Result<String, RemoteError>;

    /// 分页列出目录下所有子项,展开指纹与标识字段
    async fn list_children(
        &self,
        folder_id: &str,
        with_fingerprint: bool,
    ) -> Result<Vec<RemoteChild>, RemoteError>;

    /// 按相对路径查询单个文件,缓存降级时使用
    async fn stat_file(
        &self,
        root_id: &str,
        rel_path: &str,
    ) -> Result<Option<RemoteEntry>, RemoteError>;

    /// 单请求上传小文件
    async fn upload_small(
        &self,
        parent_id: &str,
        name: &str,
        data: Bytes,
    ) -> Result<UploadReceipt, RemoteError>;

    /// 会话分块上传大文件,同一文件的块严格按序发送
    async fn upload_chunked(
        &self,
        parent_id: &str,
        name: &str,
        data: Bytes,
    ) -> Result<UploadReceipt, RemoteError>;

    /// 上传响应缺少列表项 ID 时按路径补查
    async fn lookup_list_item_id(
        &self,
        parent_id: &str,
        name: &str,
    ) -> Result<Option<String>, RemoteError>;

    /// 写入单条指纹字段（不传输内容）
    async fn write_fingerprint(&self, list_item_id: &str, hash: &str) -> Result<(), RemoteError>;

    /// 批量写入指纹字段,按入参顺序返回每项是否成功
    async fn write_fingerprint_batch(
        &self,
        updates: &[FingerprintUpdate],
    ) -> Result<Vec<bool>, RemoteError>;

    /// 幂等创建子目录,返回目录条目 ID
    async fn ensure_folder(&self, parent_id: &str, name: &str) -> Result<String, RemoteError>;

    /// 删除条目,条目不存在视为成功
    async fn delete_item(&self, item_id: &str) -> Result<(), RemoteError>;

    /// 存储名称（用于日志）
    fn name(&self) -> &str;
}
