use super::{DriveStorage, Permissions, ServerFile, ServerFolder};
use crate::models::parent_path;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

struct MemoryFile {
    meta: ServerFile,
    content: Vec<u8>,
}

struct MemoryFolder {
    id: String,
    sequence: u64,
    permissions: Permissions,
    files: BTreeMap<String, MemoryFile>,
}

#[derive(Default)]
struct MemoryState {
    /// root -> path -> folder
    roots: HashMap<String, BTreeMap<String, MemoryFolder>>,
    failing_reads: HashSet<String>,
}

/// 进程内存储，供嵌入方与测试使用
pub struct MemoryStorage {
    name: String,
    state: RwLock<MemoryState>,
    counter: AtomicU64,
    reads: AtomicUsize,
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self {
            name: "memory".to_string(),
            state: RwLock::new(MemoryState::default()),
            counter: AtomicU64::new(1),
            reads: AtomicUsize::new(0),
        }
    }

    fn next(&self) -> u64 {
        self.counter.fetch_add(1, Ordering::Relaxed)
    }

    fn ensure_folder<'a>(
        &self,
        folders: &'a mut BTreeMap<String, MemoryFolder>,
        path: &str,
    ) -> &'a mut MemoryFolder {
        if let Some(parent) = parent_path(path) {
            if !folders.contains_key(parent) {
                self.ensure_folder(folders, parent);
            }
        }
        folders
            .entry(path.to_string())
            .or_insert_with(|| MemoryFolder {
                id: format!("f{}", self.next()),
                sequence: self.next(),
                permissions: Permissions::full(),
                files: BTreeMap::new(),
            })
    }

    /// 创建目录（连同缺失的祖先目录）
    pub fn create_folder(&self, root: &str, path: &str) {
        let mut state = self.state.write();
        let folders = state.roots.entry(root.to_string()).or_default();
        self.ensure_folder(folders, path);
    }

    /// 写入文件，返回新的文件元数据
    pub fn put_file(&self, root: &str, path: &str, name: &str, content: impl Into<Vec<u8>>) -> ServerFile {
        let content = content.into();
        let now = chrono::Utc::now().timestamp_millis();
        let version = self.next();
        let sequence = self.next();

        let mut state = self.state.write();
        let folders = state.roots.entry(root.to_string()).or_default();
        let folder = self.ensure_folder(folders, path);
        let folder_id = folder.id.clone();
        let created = folder
            .files
            .get(name)
            .map(|f| f.meta.created)
            .unwrap_or(now);
        let meta = ServerFile {
            id: format!("{}:{}", folder_id, name),
            name: name.to_string(),
            version: version.to_string(),
            size: content.len() as u64,
            modified: now,
            created,
            content_type: None,
        };
        folder.sequence = sequence;
        folder.files.insert(
            name.to_string(),
            MemoryFile {
                meta: meta.clone(),
                content,
            },
        );
        meta
    }

    pub fn remove_file(&self, root: &str, path: &str, name: &str) -> Option<ServerFile> {
        let sequence = self.next();
        let mut state = self.state.write();
        let folder = state.roots.get_mut(root)?.get_mut(path)?;
        let removed = folder.files.remove(name)?;
        folder.sequence = sequence;
        Some(removed.meta)
    }

    /// 删除目录及其所有子目录
    pub fn remove_folder(&self, root: &str, path: &str) -> usize {
        let mut state = self.state.write();
        let Some(folders) = state.roots.get_mut(root) else {
            return 0;
        };
        let before = folders.len();
        folders.retain(|p, _| p != path && !crate::models::is_ancestor(path, p));
        before - folders.len()
    }

    pub fn set_permissions(&self, root: &str, path: &str, permissions: Permissions) {
        let mut state = self.state.write();
        let folders = state.roots.entry(root.to_string()).or_default();
        self.ensure_folder(folders, path).permissions = permissions;
    }

    /// 之后读取该文件名时返回错误
    pub fn fail_reads_of(&self, name: &str) {
        self.state.write().failing_reads.insert(name.to_string());
    }

    /// 累计读取文件内容的次数
    pub fn read_count(&self) -> usize {
        self.reads.load(Ordering::Relaxed)
    }

    pub fn content(&self, root: &str, path: &str, name: &str) -> Option<Vec<u8>> {
        let state = self.state.read();
        let file = state.roots.get(root)?.get(path)?.files.get(name)?;
        Some(file.content.clone())
    }
}

#[async_trait]
impl DriveStorage for MemoryStorage {
    async fn list_folders(&self, root: &str) -> Result<Vec<ServerFolder>> {
        let state = self.state.read();
        let Some(folders) = state.roots.get(root) else {
            return Ok(Vec::new());
        };
        Ok(folders
            .iter()
            .map(|(path, folder)| ServerFolder {
                id: folder.id.clone(),
                path: path.clone(),
                sequence: folder.sequence,
            })
            .collect())
    }

    async fn list_files(&self, root: &str, path: &str) -> Result<Vec<ServerFile>> {
        let state = self.state.read();
        Ok(state
            .roots
            .get(root)
            .and_then(|folders| folders.get(path))
            .map(|folder| folder.files.values().map(|f| f.meta.clone()).collect())
            .unwrap_or_default())
    }

    async fn read_file(&self, root: &str, path: &str, file: &ServerFile) -> Result<Vec<u8>> {
        self.reads.fetch_add(1, Ordering::Relaxed);
        let state = self.state.read();
        if state.failing_reads.contains(&file.name) {
            return Err(anyhow!("simulated read failure for {}/{}", path, file.name));
        }
        state
            .roots
            .get(root)
            .and_then(|folders| folders.get(path))
            .and_then(|folder| folder.files.get(&file.name))
            .map(|f| f.content.clone())
            .ok_or_else(|| anyhow!("file not found: {}/{}", path, file.name))
    }

    async fn permissions(&self, root: &str, path: &str) -> Result<Permissions> {
        let state = self.state.read();
        Ok(state
            .roots
            .get(root)
            .and_then(|folders| folders.get(path))
            .map(|folder| folder.permissions)
            .unwrap_or_default())
    }

    async fn folder(&self, root: &str, path: &str) -> Result<Option<ServerFolder>> {
        let state = self.state.read();
        Ok(state
            .roots
            .get(root)
            .and_then(|folders| folders.get(path))
            .map(|folder| ServerFolder {
                id: folder.id.clone(),
                path: path.to_string(),
                sequence: folder.sequence,
            }))
    }

    fn name(&self) -> &str {
        &self.name
    }
}
