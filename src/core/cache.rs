//! 远端元数据缓存
//!
//! 每次运行用最少的批量列表调用构建一次,写成功后就地更新,
//! 不跨运行持久化;远端存储才是唯一的持久状态

use crate::remote::{RemoteEntry, RemoteError, RemoteStore};
use std::collections::{HashMap, HashSet};
use std::hash::{Hash, Hasher};
use tokio::sync::{Mutex, RwLock};
use tracing::info;

/// 固定分片数,按路径哈希选片,无关文件不互相争用
const SHARD_COUNT: usize = 16;

fn shard_index(path: &str) -> usize {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    path.hash(&mut hasher);
    (hasher.finish() as usize) % SHARD_COUNT
}

pub struct RemoteCache {
    /// 相对路径 -> 文件条目
    shards: Vec<RwLock<HashMap<String, RemoteEntry>>>,
    /// 相对路径 -> 目录条目 ID
    folders: Mutex<HashMap<String, String>>,
}

impl Default for RemoteCache {
    fn default() -> Self {
        Self::new()
    }
}

impl RemoteCache {
    pub fn new() -> Self {
        Self {
            shards: (0..SHARD_COUNT).map(|_| RwLock::new(HashMap::new())).collect(),
            folders: Mutex::new(HashMap::new()),
        }
    }

    /// 递归列出同步根构建完整缓存;任一层失败即整体失败,
    /// 由调用方降级为逐文件查询（残缺缓存无法区分"未命中"与"已删除"）
    pub async fn build(
        store: &dyn RemoteStore,
        root_id: &str,
        with_fingerprint: bool,
    ) -> Result<Self, RemoteError> {
        let cache = Self::new();
        let mut pending: Vec<(String, String)> = vec![(String::new(), root_id.to_string())];
        let mut file_count = 0usize;
        let mut with_hash = 0usize;
        let mut folder_count = 0usize;

        while let Some((prefix, folder_id)) = pending.pop() {
            let children = store.list_children(&folder_id, with_fingerprint).await?;
            for child in children {
                let path = if prefix.is_empty() {
                    child.name.clone()
                } else {
                    format!("{}/{}", prefix, child.name)
                };

                if child.is_folder {
                    folder_count += 1;
                    cache.folders.lock().await.insert(path.clone(), child.item_id.clone());
                    pending.push((path, child.item_id));
                } else {
                    file_count += 1;
                    if child.content_hash.is_some() {
                        with_hash += 1;
                    }
                    cache
                        .insert(RemoteEntry {
                            path,
                            item_id: child.item_id,
                            list_item_id: child.list_item_id,
                            content_hash: child.content_hash,
                            size: child.size,
                            is_folder: false,
                        })
                        .await;
                }
            }
        }

        info!(
            "远端缓存构建完成: {} 个文件,{} 个目录,{}/{} 带指纹",
            file_count, folder_count, with_hash, file_count
        );
        Ok(cache)
    }

    pub async fn get(&self, path: &str) -> Option<RemoteEntry> {
        self.shards[shard_index(path)].read().await.get(path).cloned()
    }

    pub async fn insert(&self, entry: RemoteEntry) {
        self.shards[shard_index(&entry.path)]
            .write()
            .await
            .insert(entry.path.clone(), entry);
    }

    /// 写成功后立即更新,让后续阶段读到自己的写入
    pub async fn update_after_write(&self, entry: RemoteEntry) {
        self.insert(entry).await;
    }

    pub async fn remove(&self, path: &str) {
        self.shards[shard_index(path)].write().await.remove(path);
    }

    pub async fn file_count(&self) -> usize {
        let mut total = 0;
        for shard in &self.shards {
            total += shard.read().await.len();
        }
        total
    }

    /// 没有本地对应路径的缓存文件,即删除候选;
    /// 缓存只含同步根之下的条目,范围天然受限
    pub async fn files_not_in(&self, keep: &HashSet<String>) -> Vec<RemoteEntry> {
        let mut candidates = Vec::new();
        for shard in &self.shards {
            for (path, entry) in shard.read().await.iter() {
                if !keep.contains(path) {
                    candidates.push(entry.clone());
                }
            }
        }
        candidates.sort_by(|a, b| a.path.cmp(&b.path));
        candidates
    }

    pub async fn folder_ids(&self) -> HashMap<String, String> {
        self.folders.lock().await.clone()
    }
}

/// 远端目录树 - 按需逐级创建,已知目录不再发请求
pub struct FolderTree {
    root_id: String,
    known: Mutex<HashMap<String, String>>,
}

impl FolderTree {
    pub fn new(root_id: String) -> Self {
        Self {
            root_id,
            known: Mutex::new(HashMap::new()),
        }
    }

    /// 用缓存中已发现的目录预热
    pub async fn seed(&self, folders: HashMap<String, String>) {
        self.known.lock().await.extend(folders);
    }

    /// 确保目录链存在并返回末级目录 ID,空路径即同步根
    pub async fn ensure(
        &self,
        store: &dyn RemoteStore,
        dir_path: &str,
    ) -> Result<String, RemoteError> {
        if dir_path.is_empty() {
            return Ok(self.root_id.clone());
        }

        let mut current = self.root_id.clone();
        let mut current_path = String::new();

        for segment in dir_path.split('/').filter(|s| !s.is_empty()) {
            if current_path.is_empty() {
                current_path.push_str(segment);
            } else {
                current_path = format!("{}/{}", current_path, segment);
            }

            if let Some(id) = self.known.lock().await.get(&current_path) {
                current = id.clone();
                continue;
            }

            // 并发任务可能同时创建同一目录,远端创建是幂等的
            let id = store.ensure_folder(&current, segment).await?;
            self.known.lock().await.insert(current_path.clone(), id.clone());
            current = id;
        }
        Ok(current)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::{FingerprintUpdate, RemoteChild, UploadReceipt};
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// 仅实现列表与目录创建的测试存储
    struct ListingStore {
        tree: HashMap<String, Vec<RemoteChild>>,
        ensure_calls: AtomicUsize,
    }

    impl ListingStore {
        fn child(name: &str, folder: bool, size: u64, hash: Option<&str>) -> RemoteChild {
            RemoteChild {
                name: name.to_string(),
                item_id: format!("id-{}", name),
                list_item_id: Some(format!("li-{}", name)),
                content_hash: hash.map(str::to_string),
                size,
                is_folder: folder,
            }
        }
    }

    #[async_trait]
    impl RemoteStore for ListingStore {
        async fn probe_fingerprint_support(&self) -> Result<bool, RemoteError> {
            Ok(true)
        }
        async fn resolve_root(&self) -> Result<String, RemoteError> {
            Ok("root".to_string())
        }
        async fn list_children(
            &self,
            folder_id: &str,
            _with_fingerprint: bool,
        ) -> Result<Vec<RemoteChild>, RemoteError> {
            self.tree
                .get(folder_id)
                .cloned()
                .ok_or(RemoteError::NotFound)
        }
        async fn stat_file(
            &self,
            _root_id: &str,
            _rel_path: &str,
        ) -> Result<Option<RemoteEntry>, RemoteError> {
            Ok(None)
        }
        async fn upload_small(
            &self,
            _parent_id: &str,
            _name: &str,
            _data: Bytes,
        ) -> Result<UploadReceipt, RemoteError> {
            Err(RemoteError::NotFound)
        }
        async fn upload_chunked(
            &self,
            _parent_id: &str,
            _name: &str,
            _data: Bytes,
        ) -> Result<UploadReceipt, RemoteError> {
            Err(RemoteError::NotFound)
        }
        async fn lookup_list_item_id(
            &self,
            _parent_id: &str,
            _name: &str,
        ) -> Result<Option<String>, RemoteError> {
            Ok(None)
        }
        async fn write_fingerprint(
            &self,
            _list_item_id: &str,
            _hash: &str,
        ) -> Result<(), RemoteError> {
            Ok(())
        }
        async fn write_fingerprint_batch(
            &self,
            updates: &[FingerprintUpdate],
        ) -> Result<Vec<bool>, RemoteError> {
            Ok(vec![true; updates.len()])
        }
        async fn ensure_folder(
            &self,
            _parent_id: &str,
            name: &str,
        ) -> Result<String, RemoteError> {
            self.ensure_calls.fetch_add(1, Ordering::SeqCst);
            Ok(format!("created-{}", name))
        }
        async fn delete_item(&self, _item_id: &str) -> Result<(), RemoteError> {
            Ok(())
        }
        fn name(&self) -> &str {
            "test"
        }
    }

    fn nested_store() -> ListingStore {
        let mut tree = HashMap::new();
        tree.insert(
            "root".to_string(),
            vec![
                ListingStore::child("a.txt", false, 5, Some("ha")),
                ListingStore::child("docs", true, 0, None),
            ],
        );
        tree.insert(
            "id-docs".to_string(),
            vec![
                ListingStore::child("b.md", false, 10, None),
                ListingStore::child("deep", true, 0, None),
            ],
        );
        tree.insert(
            "id-deep".to_string(),
            vec![ListingStore::child("c.bin", false, 3, Some("hc"))],
        );
        ListingStore {
            tree,
            ensure_calls: AtomicUsize::new(0),
        }
    }

    #[tokio::test]
    async fn test_build_walks_whole_tree() {
        let store = nested_store();
        let cache = RemoteCache::build(&store, "root", true).await.unwrap();

        assert_eq!(cache.file_count().await, 3);
        let b = cache.get("docs/b.md").await.unwrap();
        assert_eq!(b.size, 10);
        assert!(b.content_hash.is_none());
        assert!(cache.get("docs/deep/c.bin").await.is_some());

        let folders = cache.folder_ids().await;
        assert_eq!(folders.get("docs").map(String::as_str), Some("id-docs"));
        assert_eq!(folders.get("docs/deep").map(String::as_str), Some("id-deep"));
    }

    #[tokio::test]
    async fn test_build_fails_whole_on_partial_error() {
        let mut store = nested_store();
        // 缺一层目录的列表,构建必须整体失败而不是返回残缺缓存
        store.tree.remove("id-deep");
        assert!(RemoteCache::build(&store, "root", true).await.is_err());
    }

    #[tokio::test]
    async fn test_read_your_writes() {
        let store = nested_store();
        let cache = RemoteCache::build(&store, "root", true).await.unwrap();

        let mut updated = cache.get("docs/b.md").await.unwrap();
        updated.content_hash = Some("fresh".to_string());
        updated.size = 11;
        cache.update_after_write(updated).await;

        let seen = cache.get("docs/b.md").await.unwrap();
        assert_eq!(seen.content_hash.as_deref(), Some("fresh"));
        assert_eq!(seen.size, 11);
    }

    #[tokio::test]
    async fn test_deletion_candidates_scoped_to_cache() {
        let store = nested_store();
        let cache = RemoteCache::build(&store, "root", true).await.unwrap();

        let keep: HashSet<String> = ["a.txt".to_string(), "docs/b.md".to_string()].into();
        let candidates = cache.files_not_in(&keep).await;
        let paths: Vec<&str> = candidates.iter().map(|c| c.path.as_str()).collect();
        // 只有缓存里（即同步根之下）的条目会成为候选
        assert_eq!(paths, vec!["docs/deep/c.bin"]);

        cache.remove("docs/deep/c.bin").await;
        assert!(cache.files_not_in(&keep).await.is_empty());
    }

    #[tokio::test]
    async fn test_folder_tree_caches_created_dirs() {
        let store = nested_store();
        let tree = FolderTree::new("root".to_string());

        let id1 = tree.ensure(&store, "x/y").await.unwrap();
        assert_eq!(id1, "created-y");
        assert_eq!(store.ensure_calls.load(Ordering::SeqCst), 2);

        // 第二次完全走缓存
        let id2 = tree.ensure(&store, "x/y").await.unwrap();
        assert_eq!(id2, id1);
        assert_eq!(store.ensure_calls.load(Ordering::SeqCst), 2);

        // 空路径即同步根
        assert_eq!(tree.ensure(&store, "").await.unwrap(), "root");
    }

    #[tokio::test]
    async fn test_folder_tree_seed() {
        let store = nested_store();
        let tree = FolderTree::new("root".to_string());
        tree.seed(HashMap::from([("docs".to_string(), "id-docs".to_string())]))
            .await;

        let id = tree.ensure(&store, "docs").await.unwrap();
        assert_eq!(id, "id-docs");
        assert_eq!(store.ensure_calls.load(Ordering::SeqCst), 0);
    }
}
