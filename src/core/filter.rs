//! 排除规则与输入校验
//!
//! 静态规则来自服务端配置，会话规则由客户端随请求提交。所有规则都是
//! 大小写不敏感、整串匹配的正则表达式。被排除的条目对差异比较完全不可见。

use crate::error::DriveError;
use crate::models::{parent_path, SyncSession};
use regex::{Regex, RegexBuilder};
use std::sync::Arc;

/// 单个文件名或路径段的最大字符数
pub const MAX_NAME_LENGTH: usize = 255;
const CHECKSUM_LENGTH: usize = 32;

/// 编译为整串匹配、大小写不敏感的正则
fn anchored(pattern: &str) -> Result<Regex, DriveError> {
    RegexBuilder::new(&format!("^(?:{})$", pattern))
        .case_insensitive(true)
        .build()
        .map_err(|e| DriveError::InvalidPattern {
            pattern: pattern.to_string(),
            reason: e.to_string(),
        })
}

/// 服务端配置的静态排除规则，整个进程共享
#[derive(Debug, Clone)]
pub struct StaticPatterns {
    file_names: Regex,
    directories: Regex,
    source: String,
}

impl StaticPatterns {
    pub fn compile(file_names: &str, directories: &str) -> Result<Self, DriveError> {
        let invalid = |e: DriveError| DriveError::InvalidConfig(e.to_string());
        Ok(Self {
            file_names: anchored(file_names).map_err(invalid)?,
            directories: anchored(directories).map_err(invalid)?,
            source: format!("{}\n{}", file_names, directories),
        })
    }

    pub fn is_file_name_excluded(&self, name: &str) -> bool {
        self.file_names.is_match(name)
    }

    pub fn is_directory_excluded(&self, path: &str) -> bool {
        self.directories.is_match(path)
    }
}

/// 会话文件规则：所在目录路径与文件名同时匹配
#[derive(Debug, Clone)]
struct FilePattern {
    path: Regex,
    name: Regex,
}

/// 合并静态规则与会话规则后的过滤器
#[derive(Debug, Clone)]
pub struct PatternFilter {
    statics: Arc<StaticPatterns>,
    files: Vec<FilePattern>,
    directories: Vec<Regex>,
    fingerprint: String,
}

impl PatternFilter {
    pub fn new(statics: Arc<StaticPatterns>, session: &SyncSession) -> Result<Self, DriveError> {
        let mut view = statics.source.clone();

        let mut files = Vec::with_capacity(session.file_exclusions.len());
        for spec in &session.file_exclusions {
            files.push(FilePattern {
                path: anchored(&spec.path)?,
                name: anchored(&spec.name)?,
            });
            view.push_str(&format!("\nF:{}:{}", spec.path, spec.name));
        }

        let mut directories = Vec::with_capacity(session.directory_exclusions.len());
        for spec in &session.directory_exclusions {
            directories.push(anchored(&spec.path)?);
            view.push_str(&format!("\nD:{}", spec.path));
        }

        Ok(Self {
            statics,
            files,
            directories,
            fingerprint: Self::hash_view(&view),
        })
    }

    /// 没有会话规则，只应用静态规则
    pub fn static_only(statics: Arc<StaticPatterns>) -> Self {
        let fingerprint = Self::hash_view(&statics.source);
        Self {
            statics,
            files: Vec::new(),
            directories: Vec::new(),
            fingerprint,
        }
    }

    fn hash_view(view: &str) -> String {
        let hash = blake3::hash(view.as_bytes());
        hash.to_hex()[..16].to_string()
    }

    /// 规则集指纹，规则相同的会话共享目录校验和缓存
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    fn matches_directory(&self, path: &str) -> bool {
        self.statics.is_directory_excluded(path) || self.directories.iter().any(|re| re.is_match(path))
    }

    /// 目录本身或任一祖先目录被排除即视为排除，根目录永不排除
    pub fn is_directory_excluded(&self, path: &str) -> bool {
        let mut current = Some(path);
        while let Some(p) = current {
            if p == "/" {
                break;
            }
            if self.matches_directory(p) {
                return true;
            }
            current = parent_path(p);
        }
        false
    }

    /// 文件是否被排除：静态文件名规则优先，其次目录规则，最后会话文件规则
    pub fn is_excluded(&self, path: &str, name: &str) -> bool {
        if self.statics.is_file_name_excluded(name) {
            return true;
        }
        if self.is_directory_excluded(path) {
            return true;
        }
        self.files
            .iter()
            .any(|p| p.path.is_match(path) && p.name.is_match(name))
    }

    /// 过滤掉被排除的目录条目
    pub fn retain_directories<T, F>(&self, items: Vec<T>, path_of: F) -> Vec<T>
    where
        F: Fn(&T) -> &str,
    {
        items
            .into_iter()
            .filter(|item| !self.is_directory_excluded(path_of(item)))
            .collect()
    }

    /// 过滤掉某目录下被排除的文件条目
    pub fn retain_files<T, F>(&self, path: &str, items: Vec<T>, name_of: F) -> Vec<T>
    where
        F: Fn(&T) -> &str,
    {
        items
            .into_iter()
            .filter(|item| !self.is_excluded(path, name_of(item)))
            .collect()
    }
}

fn has_control_chars(s: &str) -> bool {
    s.chars().any(|c| c.is_control() && c != '\r')
}

/// 校验目录路径：以 `/` 开头，不以 `/` 结尾（根目录除外），不含空段、`.` 或 `..`
pub fn validate_path(path: &str) -> Result<(), DriveError> {
    if path == "/" {
        return Ok(());
    }
    if !path.starts_with('/') || path.ends_with('/') || has_control_chars(path) {
        return Err(DriveError::InvalidPath(path.to_string()));
    }
    for segment in path[1..].split('/') {
        if segment.is_empty()
            || segment == "."
            || segment == ".."
            || segment.chars().count() > MAX_NAME_LENGTH
        {
            return Err(DriveError::InvalidPath(path.to_string()));
        }
    }
    Ok(())
}

/// 校验文件名
pub fn validate_file_name(name: &str) -> Result<(), DriveError> {
    if name.is_empty()
        || name == "."
        || name == ".."
        || name.contains('/')
        || has_control_chars(name)
        || name.chars().count() > MAX_NAME_LENGTH
    {
        return Err(DriveError::InvalidFilename(name.to_string()));
    }
    Ok(())
}

/// 校验并规范化校验和（32 位十六进制，统一小写）
pub fn normalize_checksum(identity: &str, checksum: &str) -> Result<String, DriveError> {
    if checksum.len() != CHECKSUM_LENGTH || !checksum.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(DriveError::InvalidChecksum {
            identity: identity.to_string(),
            checksum: checksum.to_string(),
        });
    }
    Ok(checksum.to_ascii_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DriveConfig;

    fn statics() -> Arc<StaticPatterns> {
        let config = DriveConfig::default();
        Arc::new(
            StaticPatterns::compile(
                &config.excluded_filenames_pattern,
                &config.excluded_directories_pattern,
            )
            .unwrap(),
        )
    }

    #[test]
    fn test_static_file_names_are_case_insensitive() {
        let filter = PatternFilter::static_only(statics());
        assert!(filter.is_excluded("/docs", "Thumbs.db"));
        assert!(filter.is_excluded("/docs", ".DS_Store"));
        assert!(filter.is_excluded("/", "upload.drivepart"));
        assert!(!filter.is_excluded("/docs", "thumbs.db.txt"));
        assert!(!filter.is_excluded("/docs", "report.pdf"));
    }

    #[test]
    fn test_directory_exclusion_covers_descendants() {
        let session = SyncSession::new("1").exclude_directories("/build");
        let filter = PatternFilter::new(statics(), &session).unwrap();
        assert!(filter.is_directory_excluded("/build"));
        assert!(filter.is_directory_excluded("/BUILD/out/x"));
        assert!(!filter.is_directory_excluded("/builder"));
        assert!(!filter.is_directory_excluded("/"));
        assert!(filter.is_excluded("/build/out", "a.o"));
    }

    #[test]
    fn test_session_file_pattern_needs_path_and_name() {
        let session = SyncSession::new("1").exclude_files("/tmp(/.*)?", r".*\.log");
        let filter = PatternFilter::new(statics(), &session).unwrap();
        assert!(filter.is_excluded("/tmp", "a.log"));
        assert!(filter.is_excluded("/tmp/deep", "B.LOG"));
        assert!(!filter.is_excluded("/docs", "a.log"));
        assert!(!filter.is_excluded("/tmp", "a.txt"));
    }

    #[test]
    fn test_invalid_session_pattern_is_rejected() {
        let session = SyncSession::new("1").exclude_directories("/(unclosed");
        let err = PatternFilter::new(statics(), &session).unwrap_err();
        assert!(matches!(err, DriveError::InvalidPattern { .. }));
    }

    #[test]
    fn test_fingerprint_depends_on_session_rules() {
        let plain = PatternFilter::new(statics(), &SyncSession::new("1")).unwrap();
        let same = PatternFilter::new(statics(), &SyncSession::new("2")).unwrap();
        let other =
            PatternFilter::new(statics(), &SyncSession::new("1").exclude_directories("/x")).unwrap();
        assert_eq!(plain.fingerprint(), same.fingerprint());
        assert_ne!(plain.fingerprint(), other.fingerprint());
    }

    #[test]
    fn test_retain_helpers() {
        let session = SyncSession::new("1").exclude_directories("/skip");
        let filter = PatternFilter::new(statics(), &session).unwrap();
        let dirs = vec!["/", "/keep", "/skip", "/skip/inner"];
        let kept = filter.retain_directories(dirs, |p| *p);
        assert_eq!(kept, vec!["/", "/keep"]);

        let names = vec!["a.txt", "desktop.ini"];
        assert_eq!(filter.retain_files("/keep", names, |n| *n), vec!["a.txt"]);
    }

    #[test]
    fn test_path_validation() {
        for ok in ["/", "/a", "/a/b c/d.e"] {
            assert!(validate_path(ok).is_ok(), "{ok}");
        }
        for bad in ["", "a", "/a/", "//", "/a//b", "/a/../b", "/./a", "/a\u{0}b"] {
            assert!(validate_path(bad).is_err(), "{bad}");
        }
    }

    #[test]
    fn test_file_name_validation() {
        assert!(validate_file_name("report.pdf").is_ok());
        assert!(validate_file_name("Icon\r").is_ok());
        for bad in ["", ".", "..", "a/b", "tab\tname"] {
            assert!(validate_file_name(bad).is_err(), "{bad:?}");
        }
        assert!(validate_file_name(&"x".repeat(256)).is_err());
    }

    #[test]
    fn test_checksum_normalization() {
        let upper = "AF1349B9F5F9A1A6A0404DEA36DCC949";
        assert_eq!(
            normalize_checksum("f", upper).unwrap(),
            upper.to_ascii_lowercase()
        );
        assert!(normalize_checksum("f", "xyz").is_err());
        assert!(normalize_checksum("f", &"g".repeat(32)).is_err());
    }
}
