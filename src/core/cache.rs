//! 校验和缓存
//!
//! 按键分片加锁，同一键只计算一次：并发请求同一键时，后到者等待先到者的结果。
//! 长期未使用的条目由后台清理任务定期移除，多节点部署时由集群锁保证只有一个节点清理。

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::future::Future;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::models::is_ancestor;

const SHARD_COUNT: usize = 16;

/// 缓存键
///
/// 存储层的目录与文件 ID 只在根目录内唯一，因此两种键都带根目录标识。
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CacheKey {
    /// 文件内容校验和，由文件版本唯一确定
    File {
        root: String,
        folder: String,
        file: String,
        version: String,
    },
    /// 目录校验和，依赖目录序列号和过滤规则
    Directory {
        root: String,
        folder: String,
        path: String,
        sequence: u64,
        view: String,
    },
}

struct CacheSlot {
    value: OnceCell<String>,
    last_used: AtomicI64,
}

impl CacheSlot {
    fn empty() -> Self {
        Self {
            value: OnceCell::new(),
            last_used: AtomicI64::new(now_millis()),
        }
    }

    fn filled(value: String) -> Self {
        Self {
            value: OnceCell::from(value),
            last_used: AtomicI64::new(now_millis()),
        }
    }

    fn touch(&self) {
        self.last_used.store(now_millis(), Ordering::Relaxed);
    }
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// 进程内校验和缓存
pub struct ChecksumCache {
    shards: Vec<Mutex<HashMap<CacheKey, Arc<CacheSlot>>>>,
}

impl Default for ChecksumCache {
    fn default() -> Self {
        Self::new()
    }
}

impl ChecksumCache {
    pub fn new() -> Self {
        Self {
            shards: (0..SHARD_COUNT).map(|_| Mutex::new(HashMap::new())).collect(),
        }
    }

    fn shard(&self, key: &CacheKey) -> &Mutex<HashMap<CacheKey, Arc<CacheSlot>>> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        &self.shards[(hasher.finish() as usize) % SHARD_COUNT]
    }

    fn slot(&self, key: &CacheKey) -> Arc<CacheSlot> {
        let mut shard = self.shard(key).lock();
        let slot = shard
            .entry(key.clone())
            .or_insert_with(|| Arc::new(CacheSlot::empty()))
            .clone();
        slot.touch();
        slot
    }

    /// 取缓存值，不存在时调用 `compute` 计算并写入
    ///
    /// 计算失败不写入缓存，空槽位随即移除，下一次调用会重新计算。
    pub async fn get_or_compute<F, Fut, E>(&self, key: CacheKey, compute: F) -> Result<String, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<String, E>>,
    {
        let slot = self.slot(&key);
        match slot.value.get_or_try_init(compute).await {
            Ok(value) => Ok(value.clone()),
            Err(e) => {
                self.remove_empty(&key, &slot);
                Err(e)
            }
        }
    }

    /// 移除仍未填充的槽位；期间被替换或已被其他调用填充的槽位保留
    fn remove_empty(&self, key: &CacheKey, slot: &Arc<CacheSlot>) {
        let mut shard = self.shard(key).lock();
        let stale = shard
            .get(key)
            .is_some_and(|current| Arc::ptr_eq(current, slot) && !current.value.initialized());
        if stale {
            shard.remove(key);
        }
    }

    pub fn get(&self, key: &CacheKey) -> Option<String> {
        let shard = self.shard(key).lock();
        let slot = shard.get(key)?;
        slot.touch();
        slot.value.get().cloned()
    }

    /// 写入已知的校验和（例如上传完成时由传输层算出）
    pub fn insert(&self, key: CacheKey, value: String) {
        self.shard(&key)
            .lock()
            .insert(key, Arc::new(CacheSlot::filled(value)));
    }

    fn remove_where<P>(&self, predicate: P) -> usize
    where
        P: Fn(&CacheKey, &CacheSlot) -> bool,
    {
        let mut removed = 0;
        for shard in &self.shards {
            let mut shard = shard.lock();
            let before = shard.len();
            shard.retain(|key, slot| !predicate(key, slot));
            removed += before - shard.len();
        }
        removed
    }

    /// 移除某个文件所有版本的校验和
    pub fn invalidate_file(&self, root_id: &str, folder_id: &str, file_id: &str) -> usize {
        self.remove_where(|key, _| {
            matches!(key, CacheKey::File { root, folder, file, .. }
                if root == root_id && folder == folder_id && file == file_id)
        })
    }

    /// 移除目录及其所有祖先目录的校验和
    pub fn invalidate_directory(&self, root_id: &str, directory: &str) -> usize {
        self.remove_where(|key, _| {
            matches!(key, CacheKey::Directory { root, path, .. }
                if root == root_id && (path == directory || is_ancestor(path, directory)))
        })
    }

    /// 移除超过 `max_age` 未被访问的条目
    pub fn cleanup_older_than(&self, max_age: Duration) -> usize {
        let threshold = now_millis() - max_age.as_millis() as i64;
        self.remove_where(|_, slot| slot.last_used.load(Ordering::Relaxed) < threshold)
    }

    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.lock().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 启动后台清理任务
    pub fn spawn_cleaner(
        self: &Arc<Self>,
        interval: Duration,
        max_age: Duration,
        lock: Arc<dyn ClusterLock>,
    ) -> JoinHandle<()> {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // 第一次 tick 立即返回，跳过
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match lock.try_acquire(CLEANER_LOCK, interval).await {
                    Ok(true) => {
                        let removed = cache.cleanup_older_than(max_age);
                        info!("校验和缓存清理完成，移除 {} 个条目", removed);
                    }
                    Ok(false) => debug!("其他节点正在清理校验和缓存，跳过"),
                    Err(e) => warn!("获取清理锁失败: {:#}", e),
                }
            }
        })
    }
}

pub const CLEANER_LOCK: &str = "drive.checksum-cleaner";

/// 集群互斥锁，由部署环境提供
#[async_trait]
pub trait ClusterLock: Send + Sync {
    /// 尝试获取租约，成功返回 true
    async fn try_acquire(&self, name: &str, lease: Duration) -> anyhow::Result<bool>;
}

/// 单节点部署使用的锁，总是成功
pub struct LocalClusterLock;

#[async_trait]
impl ClusterLock for LocalClusterLock {
    async fn try_acquire(&self, _name: &str, _lease: Duration) -> anyhow::Result<bool> {
        Ok(true)
    }
}
