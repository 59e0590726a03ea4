pub mod local;
pub mod memory;

use crate::error::DriveError;
use crate::models::{parent_path, SyncSession};
use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;

pub use local::LocalStorage;
pub use memory::MemoryStorage;

/// 服务端目录
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerFolder {
    pub id: String,
    pub path: String,
    /// 目录内容序列号，目录下任一文件变化时递增或改变
    pub sequence: u64,
}

/// 服务端文件
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerFile {
    pub id: String,
    pub name: String,
    /// 存储层的文件版本，内容变化时改变
    pub version: String,
    pub size: u64,
    /// 毫秒时间戳
    pub modified: i64,
    pub created: i64,
    #[serde(default)]
    pub content_type: Option<String>,
}

/// 当前用户在某目录上的权限
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Permissions {
    pub create: bool,
    pub modify: bool,
    pub delete: bool,
}

impl Permissions {
    pub fn full() -> Self {
        Self {
            create: true,
            modify: true,
            delete: true,
        }
    }

    pub fn read_only() -> Self {
        Self {
            create: false,
            modify: false,
            delete: false,
        }
    }
}

impl Default for Permissions {
    fn default() -> Self {
        Self::full()
    }
}

/// 存储抽象接口，根目录由 `root` 标识，路径均相对根目录并以 `/` 开头
#[async_trait]
pub trait DriveStorage: Send + Sync {
    /// 列出根目录下的所有目录（含根目录本身 `/`）
    async fn list_folders(&self, root: &str) -> Result<Vec<ServerFolder>>;

    /// 列出目录下的直接文件
    async fn list_files(&self, root: &str, path: &str) -> Result<Vec<ServerFile>>;

    /// 读取文件内容
    async fn read_file(&self, root: &str, path: &str, file: &ServerFile) -> Result<Vec<u8>>;

    async fn permissions(&self, _root: &str, _path: &str) -> Result<Permissions> {
        Ok(Permissions::full())
    }

    /// 按路径查找目录
    async fn folder(&self, root: &str, path: &str) -> Result<Option<ServerFolder>> {
        Ok(self
            .list_folders(root)
            .await?
            .into_iter()
            .find(|f| f.path == path))
    }

    /// 目录下直接子目录的名称
    async fn list_subfolder_names(&self, root: &str, path: &str) -> Result<Vec<String>> {
        Ok(self
            .list_folders(root)
            .await?
            .into_iter()
            .filter(|f| parent_path(&f.path) == Some(path))
            .filter_map(|f| f.path.rsplit('/').next().map(str::to_string))
            .collect())
    }

    /// 获取存储名称（用于日志）
    fn name(&self) -> &str;
}

/// 单项配额使用情况，`limit` 为负表示不限制
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuotaUsage {
    pub used: u64,
    pub limit: i64,
}

impl QuotaUsage {
    pub fn unlimited(used: u64) -> Self {
        Self { used, limit: -1 }
    }

    pub fn limit(&self) -> Option<u64> {
        crate::config::limit(self.limit)
    }

    pub fn is_reached(&self) -> bool {
        self.limit().is_some_and(|limit| self.used >= limit)
    }

    pub fn would_exceed(&self, additional: u64) -> bool {
        self.limit()
            .is_some_and(|limit| self.used.saturating_add(additional) > limit)
    }
}

/// 文件数与存储空间配额
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Quota {
    pub file: QuotaUsage,
    pub storage: QuotaUsage,
}

#[async_trait]
pub trait QuotaService: Send + Sync {
    async fn quota(&self, session: &SyncSession) -> Result<Quota>;
}

/// 不限制配额
pub struct UnlimitedQuota;

#[async_trait]
impl QuotaService for UnlimitedQuota {
    async fn quota(&self, _session: &SyncSession) -> Result<Quota> {
        Ok(Quota {
            file: QuotaUsage::unlimited(0),
            storage: QuotaUsage::unlimited(0),
        })
    }
}

/// 固定配额，主要用于嵌入方和测试
pub struct FixedQuota(pub Quota);

#[async_trait]
impl QuotaService for FixedQuota {
    async fn quota(&self, _session: &SyncSession) -> Result<Quota> {
        Ok(self.0)
    }
}

/// 带超时执行一次存储调用，失败映射为可重试错误
pub async fn call<T, F>(operation: &str, timeout: Duration, fut: F) -> Result<T, DriveError>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(DriveError::storage(operation, e)),
        Err(_) => Err(DriveError::StorageTimeout {
            operation: operation.to_string(),
            seconds: timeout.as_secs(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quota_usage() {
        let usage = QuotaUsage { used: 9, limit: 10 };
        assert!(!usage.is_reached());
        assert!(!usage.would_exceed(1));
        assert!(usage.would_exceed(2));
        assert!(!QuotaUsage::unlimited(u64::MAX).would_exceed(1));
        assert!(QuotaUsage { used: 10, limit: 10 }.is_reached());
    }

    #[tokio::test]
    async fn test_call_maps_failures() {
        let err = call("list_files", Duration::from_secs(1), async {
            Err::<(), _>(anyhow::anyhow!("disk gone"))
        })
        .await
        .unwrap_err();
        assert!(matches!(err, DriveError::Storage { .. }));
        assert!(err.is_retryable());

        let err = call("list_files", Duration::from_millis(10), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await
        .unwrap_err();
        assert!(matches!(err, DriveError::StorageTimeout { .. }));
        assert!(err.is_retryable());
    }
}
