//! 同步引擎入口：`sync_folders` 与 `sync_files`
//!
//! 每次调用互相独立，服务端不保留会话。调用之间共享的只有校验和缓存与并发许可。

use crate::config::{limit, ConfigHandle, EngineSettings};
use crate::core::cache::{ChecksumCache, ClusterLock};
use crate::core::checksum::{ChecksumService, EntityRef, ServerFiles};
use crate::core::comparator::{Change, DiffContext, VersionDiffer};
use crate::core::conflict::ConflictResolver;
use crate::core::events::{ChangeNotifier, StorageEvent};
use crate::core::filter::{normalize_checksum, validate_file_name, validate_path, PatternFilter};
use crate::core::governor::SyncSessionGovernor;
use crate::core::planner::{ActionPlanner, PermissionMap, PlanContext};
use crate::core::throttle::{BandwidthLimiter, SessionThrottle};
use crate::error::DriveError;
use crate::models::{
    join_path, parent_path, ActionKind, DirectoryVersion, EntityKind, FileVersion, SyncPlan,
    SyncSession, Version,
};
use crate::storage::{self, DriveStorage, QuotaService, UnlimitedQuota};
use futures::stream::{self, StreamExt, TryStreamExt};
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

/// 并发查询权限的数量
const PERMISSION_CONCURRENCY: usize = 8;

/// 同步引擎
pub struct DriveSyncEngine {
    config: Arc<ConfigHandle>,
    storage: Arc<dyn DriveStorage>,
    quota: Arc<dyn QuotaService>,
    checksums: ChecksumService,
    governor: SyncSessionGovernor,
    notifier: ChangeNotifier,
    bandwidth: BandwidthLimiter,
}

impl DriveSyncEngine {
    pub fn new(config: Arc<ConfigHandle>, storage: Arc<dyn DriveStorage>) -> Self {
        let settings = config.snapshot();
        Self {
            governor: SyncSessionGovernor::from_settings(&settings),
            bandwidth: BandwidthLimiter::from_config(&settings.config),
            config,
            storage,
            quota: Arc::new(UnlimitedQuota),
            checksums: ChecksumService::new(Arc::new(ChecksumCache::new())),
            notifier: ChangeNotifier::new(),
        }
    }

    pub fn with_quota(mut self, quota: Arc<dyn QuotaService>) -> Self {
        self.quota = quota;
        self
    }

    pub fn config(&self) -> &Arc<ConfigHandle> {
        &self.config
    }

    pub fn checksums(&self) -> &ChecksumService {
        &self.checksums
    }

    pub fn governor(&self) -> &SyncSessionGovernor {
        &self.governor
    }

    /// 同步目录树
    pub async fn sync_folders(
        &self,
        session: &SyncSession,
        original: Vec<DirectoryVersion>,
        client: Vec<DirectoryVersion>,
    ) -> Result<SyncPlan<DirectoryVersion>, DriveError> {
        let settings = self.config.snapshot();
        let mut ticket = self.governor.admit(session, &settings).await?;
        ticket.start();

        let started = Instant::now();
        scopeguard::defer! {
            debug!("目录同步 {} 耗时 {:?}", session.session_id, started.elapsed());
        }

        match self.plan_folders(session, &settings, original, client).await {
            Ok(mut plan) => {
                plan.warnings.extend(ticket.take_warnings());
                ticket.complete();
                info!(
                    "目录同步 {} [{} {}]: 服务端动作 {}，客户端动作 {}，警告 {}",
                    session.root_folder_id,
                    session.client_type,
                    session.session_id,
                    plan.server_actions.len(),
                    plan.client_actions.len(),
                    plan.warnings.len()
                );
                Ok(plan)
            }
            Err(e) => {
                ticket.complete();
                error!("目录同步失败 {} [{}]: {}", session.root_folder_id, e.code(), e);
                Err(e)
            }
        }
    }

    /// 同步单个目录下的文件
    pub async fn sync_files(
        &self,
        session: &SyncSession,
        path: &str,
        original: Vec<FileVersion>,
        client: Vec<FileVersion>,
    ) -> Result<SyncPlan<FileVersion>, DriveError> {
        let settings = self.config.snapshot();
        let mut ticket = self.governor.admit(session, &settings).await?;
        ticket.start();

        let started = Instant::now();
        scopeguard::defer! {
            debug!("文件同步 {}:{} 耗时 {:?}", session.session_id, path, started.elapsed());
        }

        match self.plan_files(session, &settings, path, original, client).await {
            Ok(mut plan) => {
                plan.warnings.extend(ticket.take_warnings());
                ticket.complete();
                info!(
                    "文件同步 {}:{} [{} {}]: 服务端动作 {}，客户端动作 {}，警告 {}",
                    session.root_folder_id,
                    path,
                    session.client_type,
                    session.session_id,
                    plan.server_actions.len(),
                    plan.client_actions.len(),
                    plan.warnings.len()
                );
                Ok(plan)
            }
            Err(e) => {
                ticket.complete();
                error!("文件同步失败 {}:{} [{}]: {}", session.root_folder_id, path, e.code(), e);
                Err(e)
            }
        }
    }

    async fn plan_folders(
        &self,
        session: &SyncSession,
        settings: &EngineSettings,
        original: Vec<DirectoryVersion>,
        client: Vec<DirectoryVersion>,
    ) -> Result<SyncPlan<DirectoryVersion>, DriveError> {
        let root = session.root_folder_id.as_str();
        let timeout = settings.config.storage_timeout();

        let original = normalize_versions(original, validate_path, |v, checksum| {
            DirectoryVersion::new(v.path.clone(), checksum)
        })?;
        let client = normalize_versions(client, validate_path, |v, checksum| {
            DirectoryVersion::new(v.path.clone(), checksum)
        })?;

        let filter = PatternFilter::new(Arc::clone(&settings.static_patterns), session)?;
        let server = self
            .checksums
            .list_server_directory_versions(self.storage.as_ref(), root, &filter, timeout)
            .await?;
        let original = filter.retain_directories(original, |v| v.path.as_str());
        let client = filter.retain_directories(client, |v| v.path.as_str());

        if let Some(max) = limit(settings.config.max_directories) {
            let count = merged_count(&client, &server.versions);
            if count as u64 > max {
                return Err(DriveError::TooManyDirectories {
                    count,
                    limit: max as usize,
                });
            }
        }

        // 客户端新增目录的父目录下已有同名文件
        let original_paths: HashSet<&str> = original.iter().map(|v| v.path.as_str()).collect();
        let parents: BTreeSet<&str> = client
            .iter()
            .filter(|v| !original_paths.contains(v.path.as_str()) && !server.folders.contains_key(&v.path))
            .filter_map(|v| parent_path(&v.path))
            .filter(|p| server.folders.contains_key(*p))
            .collect();
        let mut occupied = Vec::new();
        for parent in parents {
            let files = storage::call("list_files", timeout, self.storage.list_files(root, parent)).await?;
            occupied.extend(files.into_iter().map(|f| join_path(parent, &f.name)));
        }

        let diff = VersionDiffer::diff(
            &original,
            &client,
            &server.versions,
            &DiffContext::with_occupied(occupied),
        );
        debug!(
            "目录比较: {} 项变化，{} 项未变化",
            diff.changes.len(),
            diff.unchanged
        );

        // 客户端发起修改的目录需要检查权限，新目录继承最近的已存在祖先
        let mut scopes = BTreeSet::new();
        for change in &diff.changes {
            let (path, creating) = match change {
                Change::ClientChanged { client, server: None, .. } => (client.path.as_str(), true),
                Change::ClientRemoved { original, .. } => (original.path.as_str(), false),
                Change::Conflict(conflict) => match &conflict.client {
                    Some(client) => (client.path.as_str(), true),
                    None => continue,
                },
                _ => continue,
            };
            let mut scope = if creating { parent_path(path) } else { Some(path) };
            while let Some(p) = scope {
                if server.folders.contains_key(p) {
                    scopes.insert(p.to_string());
                    break;
                }
                scope = parent_path(p);
            }
        }
        let permissions = self.load_permissions(root, scopes, timeout).await?;

        let context = PlanContext {
            directory: None,
            permissions,
            metadata: Default::default(),
            max_actions: settings.config.max_directory_actions,
        };
        let mut plan = self.planner(session, settings).plan(diff, &context);
        plan.warnings.extend(server.warnings);
        Ok(plan)
    }

    async fn plan_files(
        &self,
        session: &SyncSession,
        settings: &EngineSettings,
        path: &str,
        original: Vec<FileVersion>,
        client: Vec<FileVersion>,
    ) -> Result<SyncPlan<FileVersion>, DriveError> {
        let root = session.root_folder_id.as_str();
        let timeout = settings.config.storage_timeout();

        validate_path(path)?;
        let original = normalize_versions(original, validate_file_name, |v, checksum| {
            FileVersion::new(v.name.clone(), checksum)
        })?;
        let client = normalize_versions(client, validate_file_name, |v, checksum| {
            FileVersion::new(v.name.clone(), checksum)
        })?;

        let filter = PatternFilter::new(Arc::clone(&settings.static_patterns), session)?;
        if filter.is_directory_excluded(path) {
            debug!("目录 {} 已被排除，跳过文件同步", path);
            return Ok(SyncPlan::default());
        }

        let folder = storage::call("folder", timeout, self.storage.folder(root, path)).await?;
        let (server, occupied, permissions) = match &folder {
            Some(folder) => {
                let server = self
                    .checksums
                    .list_server_file_versions(self.storage.as_ref(), root, folder, &filter, timeout)
                    .await?;
                let occupied = storage::call(
                    "list_subfolder_names",
                    timeout,
                    self.storage.list_subfolder_names(root, path),
                )
                .await?;
                let permissions =
                    storage::call("permissions", timeout, self.storage.permissions(root, path)).await?;
                (server, occupied, PermissionMap::uniform(permissions))
            }
            None => {
                debug!("服务端不存在目录 {}", path);
                (ServerFiles::default(), Vec::new(), PermissionMap::default())
            }
        };
        let original = filter.retain_files(path, original, |v| v.name.as_str());
        let client = filter.retain_files(path, client, |v| v.name.as_str());

        if let Some(max) = limit(settings.config.max_files_per_directory) {
            let count = merged_count(&client, &server.versions);
            if count as u64 > max {
                return Err(DriveError::TooManyFiles {
                    path: path.to_string(),
                    count,
                    limit: max as usize,
                });
            }
        }

        let diff = VersionDiffer::diff(
            &original,
            &client,
            &server.versions,
            &DiffContext::with_occupied(occupied),
        );
        debug!(
            "文件比较 {}: {} 项变化，{} 项未变化",
            path,
            diff.changes.len(),
            diff.unchanged
        );

        let context = PlanContext {
            directory: Some(path.to_string()),
            permissions,
            metadata: server.metadata,
            max_actions: settings.config.max_file_actions,
        };
        let mut plan = self.planner(session, settings).plan(diff, &context);
        self.check_quota(session, &plan, timeout).await?;
        plan.warnings.extend(server.warnings);
        Ok(plan)
    }

    fn planner(&self, session: &SyncSession, settings: &EngineSettings) -> ActionPlanner {
        ActionPlanner::new(ConflictResolver::new(
            settings.config.max_conflict_rounds,
            session.conflict_rounds.clone(),
        ))
    }

    async fn load_permissions(
        &self,
        root: &str,
        scopes: BTreeSet<String>,
        timeout: Duration,
    ) -> Result<PermissionMap, DriveError> {
        let backend = self.storage.as_ref();
        let loaded: Vec<_> = stream::iter(scopes)
            .map(|path| async move {
                let permissions = storage::call("permissions", timeout, backend.permissions(root, &path)).await?;
                Ok::<_, DriveError>((path, permissions))
            })
            .buffer_unordered(PERMISSION_CONCURRENCY)
            .try_collect()
            .await?;

        let mut map = PermissionMap::default();
        for (path, permissions) in loaded {
            map.insert(path, permissions);
        }
        Ok(map)
    }

    /// 新上传的文件受文件数配额限制；存储空间已满时拒绝任何上传
    async fn check_quota(
        &self,
        session: &SyncSession,
        plan: &SyncPlan<FileVersion>,
        timeout: Duration,
    ) -> Result<(), DriveError> {
        let uploads: Vec<_> = plan.client_actions_of(ActionKind::Upload).collect();
        if uploads.is_empty() {
            return Ok(());
        }
        let new_files = uploads.iter().filter(|a| a.version.is_none()).count() as u64;

        let quota = storage::call("quota", timeout, self.quota.quota(session)).await?;
        if new_files > 0 && quota.file.would_exceed(new_files) {
            return Err(DriveError::QuotaReached {
                unit: "files",
                used: quota.file.used,
                limit: quota.file.limit().unwrap_or(u64::MAX),
                requested: new_files,
            });
        }
        if quota.storage.is_reached() {
            return Err(DriveError::QuotaReached {
                unit: "bytes",
                used: quota.storage.used,
                limit: quota.storage.limit().unwrap_or(u64::MAX),
                requested: 0,
            });
        }
        Ok(())
    }

    /// 处理存储层变更：使相关缓存失效并通知等待中的客户端
    pub fn handle_storage_event(&self, event: StorageEvent) -> usize {
        let removed = match &event {
            StorageEvent::FileChanged {
                root,
                folder_id,
                file_id,
                path,
            } => {
                self.checksums.invalidate(&EntityRef::File {
                    root: root.clone(),
                    folder_id: folder_id.clone(),
                    file_id: file_id.clone(),
                }) + self.checksums.invalidate(&EntityRef::Directory {
                    root: root.clone(),
                    path: path.clone(),
                })
            }
            StorageEvent::FolderChanged { root, path, .. } => {
                self.checksums.invalidate(&EntityRef::Directory {
                    root: root.clone(),
                    path: path.clone(),
                })
            }
        };
        debug!("存储变更 {}:{}，失效 {} 个缓存条目", event.root(), event.path(), removed);
        self.notifier.publish(event);
        removed
    }

    /// 长轮询：等待根目录下的下一次变更，`timeout` 缺省时使用配置值
    pub async fn wait_for_change(&self, root: &str, timeout: Option<Duration>) -> Option<StorageEvent> {
        let timeout = timeout.unwrap_or_else(|| self.config.snapshot().config.long_polling_timeout());
        self.notifier.wait_for_change(root, timeout).await
    }

    /// 为传输层创建会话限速器
    pub fn session_throttle(&self) -> SessionThrottle {
        self.bandwidth.session()
    }

    /// 启动校验和缓存的定期清理
    pub fn spawn_cleaner(&self, lock: Arc<dyn ClusterLock>) -> JoinHandle<()> {
        let settings = self.config.snapshot();
        let config = &settings.config;
        self.checksums.cache().spawn_cleaner(
            Duration::from_secs(config.checksum_cleaner_interval_secs),
            Duration::from_secs(config.checksum_max_age_secs),
            lock,
        )
    }
}

/// 校验客户端提交的版本列表：标识合法、不重复，校验和统一为小写
fn normalize_versions<T: Version>(
    versions: Vec<T>,
    validate: fn(&str) -> Result<(), DriveError>,
    rebuild: fn(&T, String) -> T,
) -> Result<Vec<T>, DriveError> {
    let mut seen = HashSet::with_capacity(versions.len());
    let mut normalized = Vec::with_capacity(versions.len());
    for version in versions {
        let identity = version.identity();
        validate(identity)?;
        if !seen.insert(identity.to_string()) {
            let message = format!("duplicate entry {}", identity);
            return Err(match T::KIND {
                EntityKind::Directory => DriveError::InvalidPath(message),
                EntityKind::File => DriveError::InvalidFilename(message),
            });
        }
        let checksum = normalize_checksum(identity, version.checksum())?;
        normalized.push(rebuild(&version, checksum));
    }
    Ok(normalized)
}

/// 合并后的条目数（客户端与服务端的并集）
fn merged_count<T: Version>(client: &[T], server: &[T]) -> usize {
    client
        .iter()
        .chain(server.iter())
        .map(|v| v.identity())
        .collect::<HashSet<_>>()
        .len()
}
