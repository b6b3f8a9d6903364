//! 内容指纹 - 基于 BLAKE3 的快速非加密哈希

use anyhow::{Context, Result};
use std::fs::File;
use std::io::Read;
use std::path::Path;

/// 指纹取哈希前 16 字节（32 个十六进制字符）,足够检测变化
const HEX_LEN: usize = 32;

/// 按文件大小选择读取块,大文件用大块减少 I/O 次数
fn optimal_chunk_size(file_size: u64) -> usize {
    match file_size {
        s if s < 1024 * 1024 => 64 * 1024,
        s if s < 10 * 1024 * 1024 => 256 * 1024,
        s if s < 100 * 1024 * 1024 => 1024 * 1024,
        s if s < 1024 * 1024 * 1024 => 4 * 1024 * 1024,
        _ => 8 * 1024 * 1024,
    }
}

/// 计算一段字节的指纹
pub fn hash_bytes(data: &[u8]) -> String {
    let hash = blake3::hash(data);
    hash.to_hex()[..HEX_LEN].to_string()
}

/// 流式计算文件指纹（阻塞,调用方放进 spawn_blocking）
pub fn hash_file_blocking(path: &Path) -> Result<String> {
    let file_size = std::fs::metadata(path)
        .with_context(|| format!("无法读取文件元数据: {}", path.display()))?
        .len();
    let mut file =
        File::open(path).with_context(|| format!("无法打开文件: {}", path.display()))?;

    let mut hasher = blake3::Hasher::new();
    let mut buf = vec![0u8; optimal_chunk_size(file_size)];
    loop {
        let n = file
            .read(&mut buf)
            .with_context(|| format!("读取文件失败: {}", path.display()))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher.finalize().to_hex()[..HEX_LEN].to_string())
}

/// 异步计算文件指纹
pub async fn hash_file(path: impl AsRef<Path>) -> Result<String> {
    let path = path.as_ref().to_path_buf();
    tokio::task::spawn_blocking(move || hash_file_blocking(&path))
        .await
        .context("哈希任务被中断")?
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_hash_deterministic() {
        assert_eq!(hash_bytes(b"hello"), hash_bytes(b"hello"));
        assert_ne!(hash_bytes(b"hello"), hash_bytes(b"hello!"));
        assert_eq!(hash_bytes(b"hello").len(), HEX_LEN);
    }

    #[test]
    fn test_streaming_matches_whole() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.bin");
        let data: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        let mut f = File::create(&path).unwrap();
        f.write_all(&data).unwrap();
        drop(f);

        assert_eq!(hash_file_blocking(&path).unwrap(), hash_bytes(&data));
    }

    #[tokio::test]
    async fn test_hash_file_async() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.txt");
        std::fs::write(&path, b"content").unwrap();
        assert_eq!(hash_file(&path).await.unwrap(), hash_bytes(b"content"));
    }

    #[test]
    fn test_missing_file_errors() {
        assert!(hash_file_blocking(Path::new("/does/not/exist")).is_err());
    }
}
