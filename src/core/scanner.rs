//! 本地文件扫描器 - 把选择模式解析为有序候选条目

use crate::core::{hasher, paths};
use anyhow::{bail, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// 发现阶段确定的文件类别,决定是否经过渲染管线
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    /// 可渲染文档,上传前转换为样式化标记
    Document,
    /// 普通文件,原样上传
    Regular,
}

/// 本地候选条目,单次运行内不可变
#[derive(Debug)]
pub struct LocalEntry {
    /// 净化后的远端相对路径（文档类条目已替换为渲染目标名）
    pub relative_path: String,
    /// 净化后的源相对路径,渲染回退时作为上传目标
    pub source_relative: String,
    pub source_path: PathBuf,
    pub size: u64,
    pub kind: FileKind,
    hash: OnceCell<String>,
}

impl LocalEntry {
    pub fn new(
        relative_path: String,
        source_relative: String,
        source_path: PathBuf,
        size: u64,
        kind: FileKind,
    ) -> Self {
        Self {
            relative_path,
            source_relative,
            source_path,
            size,
            kind,
            hash: OnceCell::new(),
        }
    }

    /// 惰性计算并缓存内容指纹,文档类取转换前源文件的指纹
    pub async fn content_hash(&self) -> Result<&str> {
        self.hash
            .get_or_try_init(|| hasher::hash_file(&self.source_path))
            .await
            .map(String::as_str)
    }

    /// 预置指纹,跳过文件读取（测试用）
    #[cfg(test)]
    pub fn with_hash(mut self, hash: &str) -> Self {
        self.hash = OnceCell::new_with(Some(hash.to_string()));
        self
    }
}

/// 扫描配置
#[derive(Debug, Clone)]
pub struct ScanConfig {
    /// 选择模式,支持 * 与 **（后者需开启 recursive）
    pub pattern: String,
    pub recursive: bool,
    /// 排除规则,匹配文件名、路径段或整条路径
    pub exclude_patterns: Vec<String>,
    /// 开启后 .md 文件按文档类处理
    pub render_documents: bool,
}

/// 把 glob 模式编译为正则;** 跨目录,* 与 ? 不跨目录
fn glob_to_regex(pattern: &str) -> Option<regex::Regex> {
    let mut re = String::from("^");
    let mut chars = pattern.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '*' => {
                if chars.peek() == Some(&'*') {
                    chars.next();
                    if chars.peek() == Some(&'/') {
                        chars.next();
                        // **/ 同时匹配零层目录
                        re.push_str("(?:.*/)?");
                    } else {
                        re.push_str(".*");
                    }
                } else {
                    re.push_str("[^/]*");
                }
            }
            '?' => re.push_str("[^/]"),
            c if "\\.+()[]{}^$|".contains(c) => {
                re.push('\\');
                re.push(c);
            }
            c => re.push(c),
        }
    }
    re.push('$');
    regex::Regex::new(&re).ok()
}

/// 大小写不敏感的 glob 匹配
fn matches_glob(path: &str, pattern: &str) -> bool {
    match glob_to_regex(&pattern.to_lowercase()) {
        Some(re) => re.is_match(&path.to_lowercase()),
        None => path.eq_ignore_ascii_case(pattern),
    }
}

/// 把模式拆成固定前缀目录与通配尾部
fn split_pattern(pattern: &str) -> (PathBuf, Option<String>) {
    let normalized = pattern.replace('\\', "/");
    let mut base = if normalized.starts_with('/') {
        PathBuf::from("/")
    } else {
        PathBuf::new()
    };
    let mut tail: Vec<&str> = Vec::new();

    for component in normalized.split('/').filter(|c| !c.is_empty()) {
        if !tail.is_empty() || component.contains(['*', '?']) {
            tail.push(component);
        } else {
            base.push(component);
        }
    }

    if tail.is_empty() {
        (base, None)
    } else {
        (base, Some(tail.join("/")))
    }
}

pub struct LocalScanner {
    config: ScanConfig,
}

impl LocalScanner {
    pub fn new(config: ScanConfig) -> Self {
        Self { config }
    }

    /// 检查相对路径是否命中排除规则
    fn should_exclude(&self, rel_path: &str) -> bool {
        let basename = paths::file_name(rel_path);

        for pattern in &self.config.exclude_patterns {
            // 文件名匹配,最常见
            if matches_glob(basename, pattern) {
                return true;
            }

            let has_wildcard = pattern.contains(['*', '?']);

            // 无通配的规则可命中路径中任意一段目录,如 node_modules
            if !has_wildcard && rel_path.split('/').any(|c| c.eq_ignore_ascii_case(pattern)) {
                return true;
            }

            // 整条路径匹配
            if matches_glob(rel_path, pattern) {
                return true;
            }

            // 纯扩展名简写: "tmp" 等价于 "*.tmp"
            if !has_wildcard
                && !pattern.starts_with('.')
                && matches_glob(basename, &format!("*.{}", pattern))
            {
                return true;
            }
        }
        false
    }

    fn build_entry(&self, source_path: PathBuf, rel: &str, size: u64) -> LocalEntry {
        let source_relative = paths::sanitize_path(rel);

        let is_document = self.config.render_documents
            && Path::new(rel)
                .extension()
                .and_then(|e| e.to_str())
                .is_some_and(|e| e.eq_ignore_ascii_case("md"));

        if is_document {
            // 渲染目标与源文件同名,仅扩展名不同
            let target = match source_relative.rsplit_once('.') {
                Some((stem, _)) => format!("{}.html", stem),
                None => format!("{}.html", source_relative),
            };
            LocalEntry::new(target, source_relative, source_path, size, FileKind::Document)
        } else {
            LocalEntry::new(
                source_relative.clone(),
                source_relative,
                source_path,
                size,
                FileKind::Regular,
            )
        }
    }

    /// 解析选择模式,返回按相对路径排序的候选条目
    pub fn scan(&self) -> Result<Vec<Arc<LocalEntry>>> {
        let (base, tail) = split_pattern(&self.config.pattern);
        let base = if base.as_os_str().is_empty() {
            PathBuf::from(".")
        } else {
            base
        };

        info!(
            "开始扫描: {} (recursive={})",
            self.config.pattern, self.config.recursive
        );

        // 无通配且指向单个文件
        if tail.is_none() && base.is_file() {
            let size = std::fs::metadata(&base)?.len();
            let rel = base
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default();
            return Ok(vec![Arc::new(self.build_entry(base.clone(), &rel, size))]);
        }

        if !base.is_dir() {
            bail!("扫描路径不存在: {}", base.display());
        }

        // 非递归模式下深度由模式尾部的层数决定
        let max_depth = match (&tail, self.config.recursive) {
            (Some(t), false) => t.split('/').count(),
            _ => usize::MAX,
        };

        let mut entries = Vec::new();
        let mut excluded = 0usize;

        for item in WalkDir::new(&base).max_depth(max_depth).follow_links(false) {
            let item = match item {
                Ok(i) => i,
                Err(e) => {
                    warn!("扫描条目失败: {}", e);
                    continue;
                }
            };
            if !item.file_type().is_file() {
                continue;
            }

            let rel = match item.path().strip_prefix(&base) {
                Ok(p) => p.to_string_lossy().replace('\\', "/"),
                Err(_) => continue,
            };

            if let Some(t) = &tail {
                if !matches_glob(&rel, t) {
                    continue;
                }
            }

            if self.should_exclude(&rel) {
                debug!("排除文件: {}", rel);
                excluded += 1;
                continue;
            }

            let size = match item.metadata() {
                Ok(m) => m.len(),
                Err(e) => {
                    warn!("读取元数据失败: {} - {}", rel, e);
                    continue;
                }
            };

            entries.push(self.build_entry(item.path().to_path_buf(), &rel, size));
        }

        entries.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));

        info!("扫描完成: {} 个文件,{} 个被排除", entries.len(), excluded);
        Ok(entries.into_iter().map(Arc::new).collect())
    }
}
