//! 文档渲染边界
//!
//! 渲染器是外部协作方,引擎只关心"输出字节或结构化失败";
//! 失败用净化过的源变体恰好重试一次,再失败永久回退为原始内容

use async_trait::async_trait;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

#[derive(Debug, thiserror::Error)]
pub enum RenderError {
    #[error("渲染器退出异常: {0}")]
    Failed(String),
    #[error("渲染器不可用: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait DocumentRenderer: Send + Sync {
    /// 把源字节转换为渲染输出
    async fn render(&self, source: &[u8], source_name: &str) -> Result<Vec<u8>, RenderError>;
}

/// 渲染尝试的最终结果
#[derive(Debug)]
pub enum RenderOutcome {
    Rendered(Vec<u8>),
    /// 两次失败,调用方改为上传未转换的原始内容
    Fallback,
}

/// 净化源变体: 宽松解码、统一行尾、去掉控制字符
pub fn sanitized_variant(source: &[u8]) -> Vec<u8> {
    let text = String::from_utf8_lossy(source).replace("\r\n", "\n");
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        if c == '\n' || c == '\t' || !c.is_control() {
            out.push(c);
        }
    }
    out.into_bytes()
}

/// 渲染一个文档,失败重试一次净化变体
pub async fn render_with_recovery(
    renderer: &dyn DocumentRenderer,
    source: &[u8],
    name: &str,
) -> RenderOutcome {
    match renderer.render(source, name).await {
        Ok(output) => return RenderOutcome::Rendered(output),
        Err(e) => debug!("渲染失败,尝试净化变体: {} - {}", name, e),
    }

    match renderer.render(&sanitized_variant(source), name).await {
        Ok(output) => RenderOutcome::Rendered(output),
        Err(e) => {
            warn!("渲染两次失败,回退为上传原始内容: {} - {}", name, e);
            RenderOutcome::Fallback
        }
    }
}

/// 外部命令渲染器,源走标准输入,输出走标准输出
pub struct CommandRenderer {
    program: String,
    args: Vec<String>,
}

impl CommandRenderer {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// 从 MIRRORSYNC_RENDERER 环境变量读取命令行,未设置时用默认命令名
    pub fn from_env() -> Self {
        let command = std::env::var("MIRRORSYNC_RENDERER")
            .unwrap_or_else(|_| "mirrorsync-render".to_string());
        let mut parts = command.split_whitespace().map(str::to_string);
        let program = parts.next().unwrap_or_else(|| "mirrorsync-render".to_string());
        Self {
            program,
            args: parts.collect(),
        }
    }
}

#[async_trait]
impl DocumentRenderer for CommandRenderer {
    async fn render(&self, source: &[u8], source_name: &str) -> Result<Vec<u8>, RenderError> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| RenderError::Unavailable(e.to_string()))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(source)
                .await
                .map_err(|e| RenderError::Unavailable(e.to_string()))?;
            // 关闭标准输入,渲染器才会开始产出
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| RenderError::Unavailable(e.to_string()))?;

        if output.status.success() {
            Ok(output.stdout)
        } else {
            let stderr: String = String::from_utf8_lossy(&output.stderr).chars().take(200).collect();
            Err(RenderError::Failed(format!("{} ({})", stderr, source_name)))
        }
    }
}
