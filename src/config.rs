//! 运行配置 - 扁平命名选项,运行开始前统一校验

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

/// 并发上传硬上限,对应远端按身份的并发请求限制
pub const MAX_UPLOAD_WORKERS: usize = 10;

fn default_max_retries() -> u32 {
    3
}

fn default_login_endpoint() -> String {
    "login.microsoftonline.com".to_string()
}

fn default_graph_endpoint() -> String {
    "graph.microsoft.com".to_string()
}

fn default_true() -> bool {
    true
}

fn default_upload_workers() -> usize {
    4
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncSettings {
    pub site_name: String,
    pub host_name: String,
    pub tenant_id: String,
    pub client_id: String,
    pub client_secret: String,
    /// 远端同步根,同时限定上传目标与删除对账范围
    pub upload_path: String,
    /// 本地选择模式
    pub source_pattern: String,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_login_endpoint")]
    pub login_endpoint: String,
    #[serde(default = "default_graph_endpoint")]
    pub graph_endpoint: String,
    #[serde(default)]
    pub recursive: bool,
    #[serde(default)]
    pub force_upload: bool,
    #[serde(default = "default_true")]
    pub render_documents: bool,
    /// 源指纹对渲染配置的变化不敏感,这里是显式的重渲染出口
    #[serde(default)]
    pub force_rerender: bool,
    #[serde(default)]
    pub exclude_patterns: Vec<String>,
    #[serde(default)]
    pub sync_delete: bool,
    #[serde(default = "default_true")]
    pub sync_delete_preview: bool,
    #[serde(default = "default_upload_workers")]
    pub upload_workers: usize,
    #[serde(default)]
    pub debug: bool,
    #[serde(default)]
    pub debug_metadata: bool,
}

impl SyncSettings {
    /// 按约定的位置参数次序解析,与流水线调用方的传参方式一致
    pub fn from_args(args: &[String]) -> Result<Self> {
        if args.len() < 7 {
            bail!(
                "参数不足: 需要 site_name host_name tenant_id client_id client_secret \
                 upload_path source_pattern"
            );
        }

        let arg = |i: usize| args.get(i).map(String::as_str).unwrap_or("");
        let flag = |i: usize, default: bool| {
            let v = arg(i);
            if v.is_empty() {
                default
            } else {
                v.eq_ignore_ascii_case("true")
            }
        };

        let max_retries = if arg(7).is_empty() {
            default_max_retries()
        } else {
            arg(7).parse::<u32>().context("max_retries 必须是数字")?
        };

        let upload_workers = if arg(17).is_empty() {
            default_upload_workers()
        } else {
            arg(17)
                .parse::<usize>()
                .context("upload_workers 必须是数字")?
                .min(MAX_UPLOAD_WORKERS)
        };

        let settings = Self {
            site_name: args[0].clone(),
            host_name: args[1].clone(),
            tenant_id: args[2].clone(),
            client_id: args[3].clone(),
            client_secret: args[4].clone(),
            upload_path: args[5].trim_matches('/').to_string(),
            source_pattern: args[6].clone(),
            max_retries,
            login_endpoint: if arg(8).is_empty() {
                default_login_endpoint()
            } else {
                arg(8).to_string()
            },
            graph_endpoint: if arg(9).is_empty() {
                default_graph_endpoint()
            } else {
                arg(9).to_string()
            },
            recursive: flag(10, false),
            force_upload: flag(11, false),
            render_documents: flag(12, true),
            force_rerender: flag(13, false),
            exclude_patterns: arg(14)
                .split(',')
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(str::to_string)
                .collect(),
            sync_delete: flag(15, false),
            sync_delete_preview: flag(16, true),
            upload_workers,
            debug: flag(18, false),
            debug_metadata: flag(19, false),
        };

        settings.validate()?;
        Ok(settings)
    }

    /// 运行前校验,不通过属于致命配置错误
    pub fn validate(&self) -> Result<()> {
        let required = [
            ("site_name", &self.site_name),
            ("host_name", &self.host_name),
            ("tenant_id", &self.tenant_id),
            ("client_id", &self.client_id),
            ("client_secret", &self.client_secret),
            ("upload_path", &self.upload_path),
            ("source_pattern", &self.source_pattern),
        ];
        for (name, value) in required {
            if value.is_empty() {
                bail!("{} 不能为空", name);
            }
        }
        if !(1..=10).contains(&self.max_retries) {
            bail!("max_retries 必须在 1 到 10 之间");
        }
        if !(1..=MAX_UPLOAD_WORKERS).contains(&self.upload_workers) {
            bail!("upload_workers 必须在 1 到 {} 之间", MAX_UPLOAD_WORKERS);
        }
        Ok(())
    }

    pub fn site_url(&self) -> String {
        format!("https://{}/sites/{}", self.host_name, self.site_name)
    }

    /// 上传路径带子目录时首段视为文档库名,否则用默认库
    pub fn library_name(&self) -> &str {
        if self.upload_path.contains('/') {
            self.upload_path
                .split('/')
                .next()
                .filter(|s| !s.is_empty())
                .unwrap_or("Documents")
        } else {
            "Documents"
        }
    }
}
