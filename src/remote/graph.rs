//! Microsoft Graph 文档库实现

use super::auth::TokenSource;
use super::{
    FingerprintUpdate, RemoteChild, RemoteEntry, RemoteError, RemoteStore, UploadReceipt,
    BATCH_LIMIT, IO_TIMEOUT_SECS, OP_TIMEOUT_SECS,
};
use crate::config::SyncSettings;
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::{ACCEPT, CONTENT_LENGTH, CONTENT_RANGE, CONTENT_TYPE};
use reqwest::StatusCode;
use serde_json::{json, Value};
use std::cmp::min;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace, warn};

/// 指纹字段的列名
const FINGERPRINT_COLUMN: &str = "FileHash";
/// 分块上传的块对齐单位（320 KiB,会话协议要求）
const CHUNK_ALIGNMENT: usize = 327_680;
/// 默认块大小（4 MiB,按对齐单位向上取整后使用）
const DEFAULT_CHUNK_SIZE: usize = 4 * 1024 * 1024;
/// 单块上限（60 MiB）
const MAX_CHUNK_SIZE: usize = 60 * 1024 * 1024;
/// 幂等读取请求的内部重试次数
const GET_RETRIES: u32 = 3;

/// 把相对路径逐段 URL 编码,保留分隔符
fn encode_path(path: &str) -> String {
    path.split('/')
        .filter(|s| !s.is_empty())
        .map(|s| urlencoding::encode(s).into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

pub struct GraphStore {
    http: reqwest::Client,
    tokens: Arc<dyn TokenSource>,
    base: String,
    site_id: String,
    drive_id: String,
    list_id: String,
    upload_path: String,
    name: String,
}

impl GraphStore {
    /// 解析站点、驱动器与列表标识并建立连接,失败属于致命配置错误
    pub async fn connect(
        settings: &SyncSettings,
        tokens: Arc<dyn TokenSource>,
    ) -> Result<Self, RemoteError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(OP_TIMEOUT_SECS))
            .build()?;

        let mut store = Self {
            http,
            tokens,
            base: format!("https://{}/v1.0", settings.graph_endpoint),
            site_id: String::new(),
            drive_id: String::new(),
            list_id: String::new(),
            upload_path: settings.upload_path.trim_matches('/').to_string(),
            name: format!(
                "graph://{}/sites/{}/{}",
                settings.host_name,
                settings.site_name,
                settings.upload_path.trim_matches('/')
            ),
        };

        // 站点 ID
        let site_url = format!(
            "{}/sites/{}:/sites/{}",
            store.base, settings.host_name, settings.site_name
        );
        let site = store.get_json(&site_url).await?;
        store.site_id = required_str(&site, "id")?;
        debug!("站点已解析: {}", store.site_id);

        // 默认驱动器 ID
        let drive_url = format!("{}/sites/{}/drive", store.base, store.site_id);
        let drive = store.get_json(&drive_url).await?;
        store.drive_id = required_str(&drive, "id")?;

        // 文档库对应的列表 ID（字段更新走列表端点）
        let library = settings.library_name();
        let lists_url = format!("{}/sites/{}/lists", store.base, store.site_id);
        let lists = store.get_json(&lists_url).await?;
        store.list_id = find_list_id(&lists, library)
            .or_else(|| find_list_id(&lists, "Shared Documents"))
            .ok_or_else(|| RemoteError::Api {
                status: 404,
                message: format!("找不到文档库 '{}'", library),
            })?;
        debug!("文档库已解析: {} ({})", library, store.list_id);

        Ok(store)
    }

    async fn bearer(&self) -> Result<String, RemoteError> {
        self.tokens.access_token().await
    }

    /// 从响应提取错误分类,429 读取 Retry-After 提示
    async fn classify(resp: reqwest::Response) -> RemoteError {
        let status = resp.status().as_u16();
        let retry_after = resp
            .headers()
            .get("Retry-After")
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse::<u64>().ok())
            .map(Duration::from_secs)
            // 头缺失或畸形时按 60 秒处理
            .or_else(|| (status == 429).then(|| Duration::from_secs(60)));
        let body = resp.text().await.unwrap_or_default();
        let message: String = body.chars().take(300).collect();
        trace!("请求失败 ({}): {}", status, message);
        RemoteError::from_status(status, message, retry_after)
    }

    async fn expect_json(resp: reqwest::Response) -> Result<Value, RemoteError> {
        if resp.status().is_success() {
            resp.json().await.map_err(RemoteError::from)
        } else {
            Err(Self::classify(resp).await)
        }
    }

    /// 幂等读取,限流与服务端错误在此内部重试
    async fn get_json(&self, url: &str) -> Result<Value, RemoteError> {
        let mut attempt = 0u32;
        loop {
            let token = self.bearer().await?;
            let result = self
                .http
                .get(url)
                .bearer_auth(token)
                .header(ACCEPT, "application/json")
                .send()
                .await;

            let err = match result {
                Ok(resp) if resp.status().is_success() => {
                    return resp.json().await.map_err(RemoteError::from);
                }
                Ok(resp) => Self::classify(resp).await,
                Err(e) => RemoteError::from(e),
            };

            if attempt < GET_RETRIES && err.is_retryable() {
                let delay = err
                    .retry_after()
                    .unwrap_or_else(|| Duration::from_secs((1 << attempt) + 1));
                attempt += 1;
                debug!(
                    "读取请求失败,{:?} 后重试 ({}/{}): {}",
                    delay, attempt, GET_RETRIES, err
                );
                tokio::time::sleep(delay).await;
                continue;
            }
            return Err(err);
        }
    }

    async fn post_json(&self, url: &str, body: &Value) -> Result<Value, RemoteError> {
        let token = self.bearer().await?;
        let resp = self.http.post(url).bearer_auth(token).json(body).send().await?;
        Self::expect_json(resp).await
    }
}

fn required_str(value: &Value, key: &str) -> Result<String, RemoteError> {
    value[key]
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| RemoteError::Api {
            status: 0,
            message: format!("响应缺少字段 '{}'", key),
        })
}

fn find_list_id(lists: &Value, library: &str) -> Option<String> {
    lists["value"].as_array()?.iter().find_map(|l| {
        let matched = l["displayName"].as_str() == Some(library) || l["name"].as_str() == Some(library);
        if matched {
            l["id"].as_str().map(str::to_string)
        } else {
            None
        }
    })
}

fn parse_child(item: &Value) -> RemoteChild {
    RemoteChild {
        name: item["name"].as_str().unwrap_or_default().to_string(),
        item_id: item["id"].as_str().unwrap_or_default().to_string(),
        list_item_id: item["listItem"]["id"].as_str().map(str::to_string),
        content_hash: item["listItem"]["fields"][FINGERPRINT_COLUMN]
            .as_str()
            .map(str::to_string),
        size: item["size"].as_u64().unwrap_or(0),
        is_folder: item.get("folder").is_some(),
    }
}

#[async_trait]
impl RemoteStore for GraphStore {
    async fn probe_fingerprint_support(&self) -> Result<bool, RemoteError> {
        let columns_url = format!("{}/sites/{}/lists/{}/columns", self.base, self.site_id, self.list_id);
        let columns = self.get_json(&columns_url).await?;

        let exists = columns["value"].as_array().is_some_and(|cols| {
            cols.iter().any(|c| {
                c["name"].as_str() == Some(FINGERPRINT_COLUMN)
                    || c["displayName"].as_str() == Some(FINGERPRINT_COLUMN)
            })
        });
        if exists {
            debug!("指纹列已存在");
            return Ok(true);
        }

        // 列不存在则尝试创建,失败回退为大小比较而不是中断运行
        debug!("指纹列不存在,尝试创建...");
        let definition = json!({
            "displayName": FINGERPRINT_COLUMN,
            "name": FINGERPRINT_COLUMN,
            "description": "内容指纹,用于跳过未变化文件",
            "enforceUniqueValues": false,
            "hidden": false,
            "indexed": false,
            "readOnly": false,
            "required": false,
            "text": {
                "allowMultipleLines": false,
                "appendChangesToExistingText": false,
                "linesForEditing": 0,
                "maxLength": 255
            }
        });

        match self.post_json(&columns_url, &definition).await {
            Ok(_) => {
                // 新列在最终一致的元数据层生效需要片刻
                tokio::time::sleep(Duration::from_secs(2)).await;
                Ok(true)
            }
            Err(e) => {
                warn!("无法创建指纹列: {}", e);
                Ok(false)
            }
        }
    }

    async fn resolve_root(&self) -> Result<String, RemoteError> {
        let url = format!(
            "{}/sites/{}/drives/{}/root:/{}",
            self.base,
            self.site_id,
            self.drive_id,
            encode_path(&self.upload_path)
        );
        match self.get_json(&url).await {
            Ok(v) => required_str(&v, "id"),
            Err(RemoteError::NotFound) => {
                // 根目录不存在,从驱动器根逐级创建
                debug!("同步根目录不存在,自动创建: {}", self.upload_path);
                let drive_root_url =
                    format!("{}/sites/{}/drives/{}/root", self.base, self.site_id, self.drive_id);
                let root = self.get_json(&drive_root_url).await?;
                let mut current = required_str(&root, "id")?;
                for segment in self.upload_path.split('/').filter(|s| !s.is_empty()) {
                    current = self.ensure_folder(&current, segment).await?;
                }
                Ok(current)
            }
            Err(e) => Err(e),
        }
    }

    async fn list_children(
        &self,
        folder_id: &str,
        with_fingerprint: bool,
    ) -> Result<Vec<RemoteChild>, RemoteError> {
        // 一次调用同时取回驱动器条目、列表项 ID 与指纹字段
        let expand = if with_fingerprint {
            format!("listItem($expand=fields($select={FINGERPRINT_COLUMN},FileSizeDisplay,FileLeafRef))")
        } else {
            "listItem($expand=fields($select=FileSizeDisplay,FileLeafRef))".to_string()
        };
        let mut url = format!(
            "{}/sites/{}/drives/{}/items/{}/children?$expand={}",
            self.base, self.site_id, self.drive_id, folder_id, expand
        );

        let mut children = Vec::new();
        loop {
            let page = self.get_json(&url).await?;
            if let Some(items) = page["value"].as_array() {
                children.extend(items.iter().map(parse_child));
            }
            match page["@odata.nextLink"].as_str() {
                Some(next) => url = next.to_string(),
                None => break,
            }
        }
        Ok(children)
    }

    async fn stat_file(
        &self,
        root_id: &str,
        rel_path: &str,
    ) -> Result<Option<RemoteEntry>, RemoteError> {
        let url = format!(
            "{}/sites/{}/drives/{}/items/{}:/{}?$expand=listItem($expand=fields($select={}))",
            self.base,
            self.site_id,
            self.drive_id,
            root_id,
            encode_path(rel_path),
            FINGERPRINT_COLUMN
        );
        match self.get_json(&url).await {
            Ok(v) => Ok(Some(RemoteEntry {
                path: rel_path.to_string(),
                item_id: required_str(&v, "id")?,
                list_item_id: v["listItem"]["id"].as_str().map(str::to_string),
                content_hash: v["listItem"]["fields"][FINGERPRINT_COLUMN]
                    .as_str()
                    .map(str::to_string),
                size: v["size"].as_u64().unwrap_or(0),
                is_folder: v.get("folder").is_some(),
            })),
            Err(RemoteError::NotFound) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn upload_small(
        &self,
        parent_id: &str,
        name: &str,
        data: Bytes,
    ) -> Result<UploadReceipt, RemoteError> {
        let token = self.bearer().await?;
        let url = format!(
            "{}/sites/{}/drives/{}/items/{}:/{}:/content",
            self.base,
            self.site_id,
            self.drive_id,
            parent_id,
            urlencoding::encode(name)
        );
        trace!("单请求上传: {} ({} 字节)", name, data.len());

        let resp = self
            .http
            .put(&url)
            .bearer_auth(token)
            .header(CONTENT_TYPE, "application/octet-stream")
            .timeout(Duration::from_secs(IO_TIMEOUT_SECS))
            .body(data)
            .send()
            .await?;
        let v = Self::expect_json(resp).await?;
        Ok(UploadReceipt {
            item_id: required_str(&v, "id")?,
            list_item_id: v["listItem"]["id"].as_str().map(str::to_string),
        })
    }

    async fn upload_chunked(
        &self,
        parent_id: &str,
        name: &str,
        data: Bytes,
    ) -> Result<UploadReceipt, RemoteError> {
        // 创建上传会话,同名冲突直接覆盖
        let session_url = format!(
            "{}/sites/{}/drives/{}/items/{}:/{}:/createUploadSession",
            self.base,
            self.site_id,
            self.drive_id,
            parent_id,
            urlencoding::encode(name)
        );
        let session = self
            .post_json(
                &session_url,
                &json!({"item": {"@microsoft.graph.conflictBehavior": "replace"}}),
            )
            .await?;
        let upload_url = required_str(&session, "uploadUrl")?;

        // 块大小按 320 KiB 对齐并限制上限
        let mut chunk_size = DEFAULT_CHUNK_SIZE;
        if chunk_size % CHUNK_ALIGNMENT != 0 {
            chunk_size = (chunk_size / CHUNK_ALIGNMENT + 1) * CHUNK_ALIGNMENT;
        }
        chunk_size = min(chunk_size, MAX_CHUNK_SIZE);

        let total = data.len();
        let mut offset = 0usize;
        let mut completed: Option<Value> = None;

        // 同一文件的块严格按序发送,上传地址已预授权
        while offset < total {
            let end = min(offset + chunk_size, total);
            let part = data.slice(offset..end);
            trace!("上传分块: bytes {}-{}/{}", offset, end - 1, total);

            let resp = self
                .http
                .put(&upload_url)
                .header(CONTENT_LENGTH, part.len())
                .header(CONTENT_RANGE, format!("bytes {}-{}/{}", offset, end - 1, total))
                .timeout(Duration::from_secs(IO_TIMEOUT_SECS))
                .body(part)
                .send()
                .await?;

            let status = resp.status();
            if status == StatusCode::ACCEPTED {
                // 块已接收,继续下一块
                offset = end;
                continue;
            }
            if status.is_success() {
                completed = Some(resp.json().await.map_err(RemoteError::from)?);
                offset = end;
                continue;
            }
            return Err(Self::classify(resp).await);
        }

        let v = completed.ok_or_else(|| RemoteError::Api {
            status: 0,
            message: "上传会话未返回最终条目".to_string(),
        })?;
        Ok(UploadReceipt {
            item_id: required_str(&v, "id")?,
            list_item_id: v["listItem"]["id"].as_str().map(str::to_string),
        })
    }

    async fn lookup_list_item_id(
        &self,
        parent_id: &str,
        name: &str,
    ) -> Result<Option<String>, RemoteError> {
        let url = format!(
            "{}/sites/{}/drives/{}/items/{}:/{}?$expand=listItem",
            self.base,
            self.site_id,
            self.drive_id,
            parent_id,
            urlencoding::encode(name)
        );
        match self.get_json(&url).await {
            Ok(v) => Ok(v["listItem"]["id"].as_str().map(str::to_string)),
            Err(RemoteError::NotFound) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn write_fingerprint(&self, list_item_id: &str, hash: &str) -> Result<(), RemoteError> {
        let token = self.bearer().await?;
        let url = format!(
            "{}/sites/{}/lists/{}/items/{}/fields",
            self.base, self.site_id, self.list_id, list_item_id
        );
        let resp = self
            .http
            .patch(&url)
            .bearer_auth(token)
            .json(&json!({FINGERPRINT_COLUMN: hash}))
            .send()
            .await?;
        if resp.status().is_success() {
            Ok(())
        } else {
            Err(Self::classify(resp).await)
        }
    }

    async fn write_fingerprint_batch(
        &self,
        updates: &[FingerprintUpdate],
    ) -> Result<Vec<bool>, RemoteError> {
        debug_assert!(updates.len() <= BATCH_LIMIT);

        let requests: Vec<Value> = updates
            .iter()
            .enumerate()
            .map(|(i, u)| {
                json!({
                    "id": i.to_string(),
                    "method": "PATCH",
                    "url": format!(
                        "/sites/{}/lists/{}/items/{}/fields",
                        self.site_id, self.list_id, u.list_item_id
                    ),
                    "body": {FINGERPRINT_COLUMN: u.hash},
                    "headers": {"Content-Type": "application/json"},
                })
            })
            .collect();

        let batch_url = format!("{}/$batch", self.base);
        let v = self.post_json(&batch_url, &json!({"requests": requests})).await?;

        // 按子请求 ID 回填每项状态,缺失的按失败处理
        let mut results = vec![false; updates.len()];
        if let Some(responses) = v["responses"].as_array() {
            for r in responses {
                let idx = r["id"].as_str().and_then(|s| s.parse::<usize>().ok());
                let status = r["status"].as_u64().unwrap_or(0);
                if let Some(idx) = idx {
                    if idx < results.len() {
                        results[idx] = (200..300).contains(&status);
                    }
                }
            }
        }
        Ok(results)
    }

    async fn ensure_folder(&self, parent_id: &str, name: &str) -> Result<String, RemoteError> {
        let url = format!(
            "{}/sites/{}/drives/{}/items/{}/children",
            self.base, self.site_id, self.drive_id, parent_id
        );
        let body = json!({
            "name": name,
            "folder": {},
            "@microsoft.graph.conflictBehavior": "fail"
        });

        match self.post_json(&url, &body).await {
            Ok(v) => required_str(&v, "id"),
            // 已存在（可能是并发创建）,重新列出取现有目录的 ID
            Err(RemoteError::Conflict) => {
                let children = self.list_children(parent_id, false).await?;
                children
                    .into_iter()
                    .find(|c| c.is_folder && c.name == name)
                    .map(|c| c.item_id)
                    .ok_or_else(|| RemoteError::Api {
                        status: 409,
                        message: format!("目录 '{}' 冲突但无法定位", name),
                    })
            }
            Err(e) => Err(e),
        }
    }

    async fn delete_item(&self, item_id: &str) -> Result<(), RemoteError> {
        let token = self.bearer().await?;
        let url = format!(
            "{}/sites/{}/drives/{}/items/{}",
            self.base, self.site_id, self.drive_id, item_id
        );
        let resp = self.http.delete(&url).bearer_auth(token).send().await?;
        if resp.status().is_success() || resp.status() == StatusCode::NOT_FOUND {
            Ok(())
        } else {
            Err(Self::classify(resp).await)
        }
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_path() {
        assert_eq!(encode_path("docs/设计 文档.html"), "docs/%E8%AE%BE%E8%AE%A1%20%E6%96%87%E6%A1%A3.html");
        assert_eq!(encode_path("/a//b/"), "a/b");
    }

    #[test]
    fn test_parse_child() {
        let item = json!({
            "id": "item1",
            "name": "a.txt",
            "size": 42,
            "file": {},
            "listItem": {"id": "7", "fields": {"FileHash": "abcd"}}
        });
        let child = parse_child(&item);
        assert_eq!(child.item_id, "item1");
        assert_eq!(child.list_item_id.as_deref(), Some("7"));
        assert_eq!(child.content_hash.as_deref(), Some("abcd"));
        assert_eq!(child.size, 42);
        assert!(!child.is_folder);

        let folder = json!({"id": "f1", "name": "docs", "folder": {"childCount": 2}});
        assert!(parse_child(&folder).is_folder);
    }

    #[test]
    fn test_find_list_id() {
        let lists = json!({"value": [
            {"id": "l1", "displayName": "Documents", "name": "Shared Documents"},
            {"id": "l2", "displayName": "Site Pages", "name": "SitePages"},
        ]});
        assert_eq!(find_list_id(&lists, "Documents").as_deref(), Some("l1"));
        assert_eq!(find_list_id(&lists, "Shared Documents").as_deref(), Some("l1"));
        assert!(find_list_id(&lists, "Missing").is_none());
    }
}
