//! 校验和服务：文件内容校验和、目录校验和以及服务端版本列表
//!
//! 文件校验和由文件版本唯一确定；目录校验和覆盖目录下未被排除的直接文件，
//! 由 (目录 ID, 序列号, 过滤规则指纹) 确定。两者都缓存在 [`ChecksumCache`] 中。

use crate::core::cache::{CacheKey, ChecksumCache};
use crate::core::filter::PatternFilter;
use crate::error::{DriveError, ErrorCode, ErrorInfo};
use crate::models::{DirectoryVersion, FileVersion};
use crate::storage::{self, DriveStorage, ServerFile, ServerFolder};
use futures::stream::{self, StreamExt, TryStreamExt};
use std::collections::HashMap;
use std::sync::{Arc, LazyLock};
use std::time::Duration;
use tracing::{debug, warn};

/// 并发计算校验和的数量
const CHECKSUM_CONCURRENCY: usize = 8;

/// 计算内容校验和（blake3，取前 32 位十六进制）
pub fn content_checksum(data: &[u8]) -> String {
    let hash = blake3::hash(data);
    hash.to_hex()[..32].to_string()
}

static EMPTY_CHECKSUM: LazyLock<String> = LazyLock::new(|| content_checksum(&[]));

/// 空文件与空目录共有的校验和，不参与重命名配对
pub fn empty_checksum() -> &'static str {
    &EMPTY_CHECKSUM
}

/// 目录校验和：按文件名排序后依次摘要 (文件名, 校验和)
pub fn directory_checksum<'a, I>(files: I) -> String
where
    I: IntoIterator<Item = &'a FileVersion>,
{
    let mut entries: Vec<&FileVersion> = files.into_iter().collect();
    entries.sort_by(|a, b| a.name.cmp(&b.name));

    let mut hasher = blake3::Hasher::new();
    for file in entries {
        hasher.update(file.name.as_bytes());
        hasher.update(&[0]);
        hasher.update(file.checksum.as_bytes());
        hasher.update(b"\n");
    }
    hasher.finalize().to_hex()[..32].to_string()
}

/// 服务端文件版本列表
#[derive(Debug, Default)]
pub struct ServerFiles {
    pub versions: Vec<FileVersion>,
    /// 文件名 -> 存储元数据，用于填充下载参数
    pub metadata: HashMap<String, ServerFile>,
    pub warnings: Vec<ErrorInfo>,
}

/// 服务端目录版本列表
#[derive(Debug, Default)]
pub struct ServerDirectories {
    pub versions: Vec<DirectoryVersion>,
    pub folders: HashMap<String, ServerFolder>,
    pub warnings: Vec<ErrorInfo>,
}

/// 需要失效的缓存实体
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntityRef {
    File {
        root: String,
        folder_id: String,
        file_id: String,
    },
    Directory {
        root: String,
        path: String,
    },
}

/// 校验和服务
pub struct ChecksumService {
    cache: Arc<ChecksumCache>,
}

impl ChecksumService {
    pub fn new(cache: Arc<ChecksumCache>) -> Self {
        Self { cache }
    }

    pub fn cache(&self) -> &Arc<ChecksumCache> {
        &self.cache
    }

    /// 文件内容校验和，缓存未命中时读取文件计算
    pub async fn file_checksum(
        &self,
        storage: &dyn DriveStorage,
        root: &str,
        folder: &ServerFolder,
        file: &ServerFile,
        timeout: Duration,
    ) -> Result<String, DriveError> {
        let key = CacheKey::File {
            root: root.to_string(),
            folder: folder.id.clone(),
            file: file.id.clone(),
            version: file.version.clone(),
        };
        self.cache
            .get_or_compute(key, || async {
                let data = storage::call(
                    "read_file",
                    timeout,
                    storage.read_file(root, &folder.path, file),
                )
                .await?;
                debug!("计算文件校验和: {}/{} ({} 字节)", folder.path, file.name, data.len());
                tokio::task::spawn_blocking(move || content_checksum(&data))
                    .await
                    .map_err(|e| DriveError::Internal(e.to_string()))
            })
            .await
    }

    /// 列出目录下未被排除文件的版本；单个文件计算失败时跳过并记入警告
    pub async fn list_server_file_versions(
        &self,
        storage: &dyn DriveStorage,
        root: &str,
        folder: &ServerFolder,
        filter: &PatternFilter,
        timeout: Duration,
    ) -> Result<ServerFiles, DriveError> {
        let files = storage::call(
            "list_files",
            timeout,
            storage.list_files(root, &folder.path),
        )
        .await?;
        let files = filter.retain_files(&folder.path, files, |f| f.name.as_str());

        let results: Vec<(ServerFile, Result<String, DriveError>)> = stream::iter(files)
            .map(|file| async move {
                let checksum = self.file_checksum(storage, root, folder, &file, timeout).await;
                (file, checksum)
            })
            .buffer_unordered(CHECKSUM_CONCURRENCY)
            .collect()
            .await;

        let mut listing = ServerFiles::default();
        for (file, checksum) in results {
            match checksum {
                Ok(checksum) => {
                    listing
                        .versions
                        .push(FileVersion::new(file.name.clone(), checksum));
                    listing.metadata.insert(file.name.clone(), file);
                }
                Err(e) => {
                    warn!("计算校验和失败，跳过 {}/{}: {}", folder.path, file.name, e);
                    listing.warnings.push(
                        ErrorInfo::new(ErrorCode::ChecksumFailed, e.to_string())
                            .with_identity(file.name.clone()),
                    );
                }
            }
        }
        listing.versions.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(listing)
    }

    /// 目录校验和；存在跳过的文件时结果不缓存
    pub async fn directory_checksum(
        &self,
        storage: &dyn DriveStorage,
        root: &str,
        folder: &ServerFolder,
        filter: &PatternFilter,
        timeout: Duration,
    ) -> Result<(String, Vec<ErrorInfo>), DriveError> {
        let key = CacheKey::Directory {
            root: root.to_string(),
            folder: folder.id.clone(),
            path: folder.path.clone(),
            sequence: folder.sequence,
            view: filter.fingerprint().to_string(),
        };
        if let Some(checksum) = self.cache.get(&key) {
            return Ok((checksum, Vec::new()));
        }

        let listing = self
            .list_server_file_versions(storage, root, folder, filter, timeout)
            .await?;
        let checksum = directory_checksum(&listing.versions);
        if listing.warnings.is_empty() {
            self.cache.insert(key, checksum.clone());
        }
        Ok((checksum, listing.warnings))
    }

    /// 列出根目录下所有未被排除目录的版本
    pub async fn list_server_directory_versions(
        &self,
        storage: &dyn DriveStorage,
        root: &str,
        filter: &PatternFilter,
        timeout: Duration,
    ) -> Result<ServerDirectories, DriveError> {
        let folders = storage::call("list_folders", timeout, storage.list_folders(root)).await?;
        let folders = filter.retain_directories(folders, |f| f.path.as_str());

        let results: Vec<(ServerFolder, String, Vec<ErrorInfo>)> = stream::iter(folders)
            .map(|folder| async move {
                let (checksum, warnings) = self
                    .directory_checksum(storage, root, &folder, filter, timeout)
                    .await?;
                Ok::<_, DriveError>((folder, checksum, warnings))
            })
            .buffer_unordered(CHECKSUM_CONCURRENCY)
            .try_collect()
            .await?;

        let mut listing = ServerDirectories::default();
        for (folder, checksum, warnings) in results {
            listing
                .versions
                .push(DirectoryVersion::new(folder.path.clone(), checksum));
            listing.warnings.extend(warnings);
            listing.folders.insert(folder.path.clone(), folder);
        }
        listing.versions.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(listing)
    }

    /// 使缓存失效；目录失效会连带其所有祖先目录
    pub fn invalidate(&self, entity: &EntityRef) -> usize {
        match entity {
            EntityRef::File {
                root,
                folder_id,
                file_id,
            } => self.cache.invalidate_file(root, folder_id, file_id),
            EntityRef::Directory { root, path } => self.cache.invalidate_directory(root, path),
        }
    }

    pub fn cleanup_older_than(&self, max_age: Duration) -> usize {
        self.cache.cleanup_older_than(max_age)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineSettings;
    use crate::models::SyncSession;
    use crate::storage::MemoryStorage;

    const TIMEOUT: Duration = Duration::from_secs(5);

    fn filter() -> PatternFilter {
        let settings = EngineSettings::from_config(Default::default()).unwrap();
        PatternFilter::new(settings.static_patterns.clone(), &SyncSession::new("r")).unwrap()
    }

    #[test]
    fn test_checksum_format() {
        let checksum = content_checksum(b"hello");
        assert_eq!(checksum.len(), 32);
        assert!(checksum.bytes().all(|b| b.is_ascii_hexdigit()));
        assert_eq!(checksum, content_checksum(b"hello"));
        assert_ne!(checksum, content_checksum(b"hello!"));
        assert_eq!(directory_checksum(&Vec::<FileVersion>::new()), empty_checksum());
    }

    #[test]
    fn test_directory_checksum_is_order_independent() {
        let a = FileVersion::new("a", content_checksum(b"1"));
        let b = FileVersion::new("b", content_checksum(b"2"));
        assert_eq!(
            directory_checksum([&a, &b]),
            directory_checksum([&b, &a])
        );
        let renamed = FileVersion::new("c", content_checksum(b"1"));
        assert_ne!(directory_checksum([&a, &b]), directory_checksum([&renamed, &b]));
    }

    #[tokio::test]
    async fn test_file_checksum_is_cached_per_version() {
        let storage = MemoryStorage::new();
        storage.put_file("r", "/docs", "a.txt", "hello");
        let service = ChecksumService::new(Arc::new(ChecksumCache::new()));
        let folder = storage.folder("r", "/docs").await.unwrap().unwrap();

        let first = service
            .list_server_file_versions(&storage, "r", &folder, &filter(), TIMEOUT)
            .await
            .unwrap();
        let second = service
            .list_server_file_versions(&storage, "r", &folder, &filter(), TIMEOUT)
            .await
            .unwrap();
        assert_eq!(first.versions, second.versions);
        assert_eq!(first.versions[0].checksum, content_checksum(b"hello"));
        assert_eq!(storage.read_count(), 1);
        assert_eq!(first.metadata["a.txt"].size, 5);
    }

    #[tokio::test]
    async fn test_failed_file_is_skipped_with_warning() {
        let storage = MemoryStorage::new();
        storage.put_file("r", "/", "good.txt", "ok");
        storage.put_file("r", "/", "bad.txt", "broken");
        storage.fail_reads_of("bad.txt");
        let service = ChecksumService::new(Arc::new(ChecksumCache::new()));

        let listing = service
            .list_server_directory_versions(&storage, "r", &filter(), TIMEOUT)
            .await
            .unwrap();
        assert_eq!(listing.versions.len(), 1);
        assert_eq!(listing.warnings.len(), 1);
        assert!(listing.warnings[0].is(ErrorCode::ChecksumFailed));
        assert_eq!(listing.warnings[0].identity.as_deref(), Some("bad.txt"));

        // 有警告的目录校验和不缓存，失败的文件下次重新读取
        let reads = storage.read_count();
        service
            .list_server_directory_versions(&storage, "r", &filter(), TIMEOUT)
            .await
            .unwrap();
        assert_eq!(storage.read_count(), reads + 1);
    }

    #[tokio::test]
    async fn test_directory_versions_exclude_static_entries() {
        let storage = MemoryStorage::new();
        storage.put_file("r", "/docs", "a.txt", "1");
        storage.put_file("r", "/docs", "Thumbs.db", "junk");
        storage.create_folder("r", "/.drive");
        let service = ChecksumService::new(Arc::new(ChecksumCache::new()));

        let listing = service
            .list_server_directory_versions(&storage, "r", &filter(), TIMEOUT)
            .await
            .unwrap();
        let paths: Vec<_> = listing.versions.iter().map(|v| v.path.as_str()).collect();
        assert_eq!(paths, vec!["/", "/docs"]);

        let expected = directory_checksum([&FileVersion::new("a.txt", content_checksum(b"1"))]);
        assert_eq!(listing.versions[1].checksum, expected);
        assert_eq!(listing.versions[0].checksum, empty_checksum());
    }

    #[tokio::test]
    async fn test_invalidation_forces_recomputation() {
        let storage = MemoryStorage::new();
        let file = storage.put_file("r", "/docs", "a.txt", "1");
        let service = ChecksumService::new(Arc::new(ChecksumCache::new()));
        let filter = filter();

        service
            .list_server_directory_versions(&storage, "r", &filter, TIMEOUT)
            .await
            .unwrap();
        let reads = storage.read_count();

        let folder = storage.folder("r", "/docs").await.unwrap().unwrap();
        assert!(
            service.invalidate(&EntityRef::File {
                root: "r".into(),
                folder_id: folder.id.clone(),
                file_id: file.id.clone(),
            }) > 0
        );
        assert!(
            service.invalidate(&EntityRef::Directory {
                root: "r".into(),
                path: "/docs".into()
            }) >= 2
        );
        service
            .list_server_directory_versions(&storage, "r", &filter, TIMEOUT)
            .await
            .unwrap();
        assert_eq!(storage.read_count(), reads + 1);
    }
}
