use super::{DriveStorage, Permissions, ServerFile, ServerFolder};
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};
use std::time::UNIX_EPOCH;
use tokio::fs;
use walkdir::WalkDir;

/// 以本地目录作为存储，根目录标识为空或 `/` 时指向基础目录，否则指向其下的子目录
pub struct LocalStorage {
    base_path: PathBuf,
    name: String,
}

impl LocalStorage {
    pub fn new(path: &str) -> Result<Self> {
        let base_path = PathBuf::from(path);
        if !base_path.exists() {
            std::fs::create_dir_all(&base_path)?;
        }
        let name = format!("local:{}", path);
        Ok(Self { base_path, name })
    }

    /// 拼接相对路径，只允许普通路径段，不能越出 `base`
    fn checked_join(base: &Path, relative: &str) -> Result<PathBuf> {
        let relative = relative.trim_start_matches(['/', '\\']);
        let mut joined = base.to_path_buf();
        for component in Path::new(relative).components() {
            match component {
                Component::Normal(part) => joined.push(part),
                Component::CurDir => {}
                _ => bail!("非法路径: {}", relative),
            }
        }
        Ok(joined)
    }

    fn root_path(&self, root: &str) -> Result<PathBuf> {
        Self::checked_join(&self.base_path, root)
    }

    fn resolve_path(&self, root: &str, path: &str) -> Result<PathBuf> {
        Self::checked_join(&self.root_path(root)?, path)
    }

    /// 规范化路径分隔符（统一使用 /），并加上前导 /
    fn normalize_path(path: &str) -> String {
        let path = path.replace('\\', "/");
        if path.is_empty() {
            "/".to_string()
        } else {
            format!("/{}", path)
        }
    }

    fn millis(time: std::io::Result<std::time::SystemTime>) -> i64 {
        time.ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0)
    }

    fn to_server_file(relative_dir: &str, name: &str, metadata: &std::fs::Metadata) -> ServerFile {
        let modified = Self::millis(metadata.modified());
        let id = if relative_dir == "/" {
            format!("/{}", name)
        } else {
            format!("{}/{}", relative_dir, name)
        };
        ServerFile {
            id,
            name: name.to_string(),
            version: format!("{}-{}", modified, metadata.len()),
            size: metadata.len(),
            modified,
            created: Self::millis(metadata.created()),
            content_type: None,
        }
    }

    fn relative(base: &Path, path: &Path) -> Option<String> {
        let relative = path.strip_prefix(base).ok()?.to_str()?;
        Some(Self::normalize_path(relative))
    }
}

#[async_trait]
impl DriveStorage for LocalStorage {
    async fn list_folders(&self, root: &str) -> Result<Vec<ServerFolder>> {
        let base = self.root_path(root)?;
        if !base.exists() {
            return Ok(Vec::new());
        }

        // 使用 spawn_blocking 避免阻塞 async runtime
        let folders = tokio::task::spawn_blocking(move || {
            let mut hashers: BTreeMap<String, blake3::Hasher> = BTreeMap::new();
            for entry in WalkDir::new(&base).follow_links(false).into_iter().filter_map(|e| e.ok()) {
                let Some(relative) = Self::relative(&base, entry.path()) else {
                    continue;
                };
                let Ok(metadata) = entry.metadata() else {
                    continue;
                };
                if metadata.is_dir() {
                    hashers.entry(relative).or_default();
                } else if let Some(parent) = crate::models::parent_path(&relative) {
                    // 目录序列号：直接文件的名称、大小、修改时间的摘要
                    let hasher = hashers.entry(parent.to_string()).or_default();
                    hasher.update(entry.file_name().as_encoded_bytes());
                    hasher.update(&metadata.len().to_le_bytes());
                    hasher.update(&Self::millis(metadata.modified()).to_le_bytes());
                }
            }
            hashers
                .into_iter()
                .map(|(path, hasher)| {
                    let digest = hasher.finalize();
                    let mut sequence = [0u8; 8];
                    sequence.copy_from_slice(&digest.as_bytes()[..8]);
                    ServerFolder {
                        id: path.clone(),
                        path,
                        sequence: u64::from_le_bytes(sequence),
                    }
                })
                .collect::<Vec<_>>()
        })
        .await?;

        Ok(folders)
    }

    async fn list_files(&self, root: &str, path: &str) -> Result<Vec<ServerFile>> {
        let dir = self.resolve_path(root, path)?;
        if !dir.is_dir() {
            return Ok(Vec::new());
        }

        let mut files = Vec::new();
        let mut entries = fs::read_dir(&dir)
            .await
            .with_context(|| format!("读取目录失败: {}", dir.display()))?;
        while let Some(entry) = entries.next_entry().await? {
            let metadata = entry.metadata().await?;
            if !metadata.is_file() {
                continue;
            }
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                tracing::warn!("跳过非 UTF-8 文件名: {:?}", entry.path());
                continue;
            };
            files.push(Self::to_server_file(path, &name, &metadata));
        }
        files.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(files)
    }

    async fn read_file(&self, root: &str, path: &str, file: &ServerFile) -> Result<Vec<u8>> {
        let full_path = Self::checked_join(&self.resolve_path(root, path)?, &file.name)?;
        let data = fs::read(&full_path)
            .await
            .with_context(|| format!("读取文件失败: {}", full_path.display()))?;
        Ok(data)
    }

    async fn permissions(&self, root: &str, path: &str) -> Result<Permissions> {
        let full_path = self.resolve_path(root, path)?;
        match fs::metadata(&full_path).await {
            Ok(metadata) if metadata.permissions().readonly() => Ok(Permissions::read_only()),
            Ok(_) => Ok(Permissions::full()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Permissions::full()),
            Err(e) => Err(e.into()),
        }
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn storage_with_tree() -> (tempfile::TempDir, LocalStorage) {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("docs/sub")).unwrap();
        std::fs::write(dir.path().join("docs/a.txt"), b"hello").unwrap();
        std::fs::write(dir.path().join("docs/sub/b.txt"), b"world").unwrap();
        let storage = LocalStorage::new(dir.path().to_str().unwrap()).unwrap();
        (dir, storage)
    }

    #[tokio::test]
    async fn test_list_folders_includes_root() {
        let (_dir, storage) = storage_with_tree();
        let folders = storage.list_folders("").await.unwrap();
        let paths: Vec<_> = folders.iter().map(|f| f.path.as_str()).collect();
        assert_eq!(paths, vec!["/", "/docs", "/docs/sub"]);
    }

    #[tokio::test]
    async fn test_sequence_changes_with_content() {
        let (dir, storage) = storage_with_tree();
        let before = storage.folder("", "/docs").await.unwrap().unwrap();
        std::fs::write(dir.path().join("docs/new.txt"), b"!").unwrap();
        let after = storage.folder("", "/docs").await.unwrap().unwrap();
        assert_ne!(before.sequence, after.sequence);
    }

    #[tokio::test]
    async fn test_paths_cannot_escape_base() {
        let (dir, storage) = storage_with_tree();
        std::fs::write(dir.path().join("docs/sub/c.txt"), b"!").unwrap();
        let nested = LocalStorage::new(dir.path().join("docs/sub").to_str().unwrap()).unwrap();

        assert!(nested.list_folders("../..").await.is_err());
        assert!(nested.list_folders("/..").await.is_err());
        assert!(nested.list_files("", "/../..").await.is_err());
        assert!(nested.permissions("ok/../..", "/").await.is_err());
        assert!(storage.list_folders("./docs").await.is_ok());

        let files = nested.list_files("", "/").await.unwrap();
        assert_eq!(files.len(), 1);
        let mut escaped = files[0].clone();
        escaped.name = "../../docs/a.txt".into();
        assert!(nested.read_file("", "/", &escaped).await.is_err());
    }

    #[tokio::test]
    async fn test_list_and_read_files() {
        let (_dir, storage) = storage_with_tree();
        let files = storage.list_files("", "/docs").await.unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].name, "a.txt");
        assert_eq!(files[0].id, "/docs/a.txt");
        assert_eq!(files[0].size, 5);

        let data = storage.read_file("", "/docs", &files[0]).await.unwrap();
        assert_eq!(data, b"hello");

        assert!(storage.list_files("", "/missing").await.unwrap().is_empty());
        assert_eq!(
            storage.list_subfolder_names("", "/docs").await.unwrap(),
            vec!["sub".to_string()]
        );
    }
}
