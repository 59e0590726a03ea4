use crate::core::filter::MAX_NAME_LENGTH;
use crate::error::ErrorCode;
use crate::models::{fold_identity, join_path, parent_path, EntityKind, Version};
use std::collections::{HashMap, HashSet};

/// 冲突类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictKind {
    /// 两端都修改了同一文件，内容不同
    ConcurrentEdit,
    /// 大小写不敏感时与另一条目同名
    Name,
    /// 与另一种实体（文件/目录）同名
    Level,
}

/// 一条冲突及其三方版本
#[derive(Debug, Clone, PartialEq)]
pub struct Conflict<T> {
    pub kind: ConflictKind,
    pub original: Option<T>,
    pub client: Option<T>,
    pub server: Option<T>,
}

impl<T: Version> Conflict<T> {
    pub fn new(kind: ConflictKind, original: Option<T>, client: Option<T>, server: Option<T>) -> Self {
        Self {
            kind,
            original,
            client,
            server,
        }
    }

    pub fn identity(&self) -> &str {
        self.client
            .as_ref()
            .or(self.server.as_ref())
            .or(self.original.as_ref())
            .map(|v| v.identity())
            .unwrap_or_default()
    }
}

/// 冲突解决策略
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// 客户端副本改名为 `identity`
    RenameClientCopy { identity: String },
    /// 服务端副本改名为 `identity`
    RenameServerCopy { identity: String },
    /// 隔离：客户端停止同步该条目
    Quarantine { code: ErrorCode },
    /// 拒绝：以 ERROR 动作告知客户端
    Reject { code: ErrorCode },
}

impl std::fmt::Display for Resolution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Resolution::RenameClientCopy { identity } => write!(f, "rename_client_copy({})", identity),
            Resolution::RenameServerCopy { identity } => write!(f, "rename_server_copy({})", identity),
            Resolution::Quarantine { code } => write!(f, "quarantine({})", code.name()),
            Resolution::Reject { code } => write!(f, "reject({})", code.name()),
        }
    }
}

/// 已占用的标识（大小写不敏感），保证生成的新名称不重复
#[derive(Debug, Clone, Default)]
pub struct NameRegistry {
    taken: HashSet<String>,
}

impl NameRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, identity: &str) -> bool {
        self.taken.insert(fold_identity(identity))
    }

    pub fn contains(&self, identity: &str) -> bool {
        self.taken.contains(&fold_identity(identity))
    }

    pub fn extend<'a>(&mut self, identities: impl IntoIterator<Item = &'a str>) {
        for identity in identities {
            self.insert(identity);
        }
    }
}

/// 拆分文件名与扩展名，以点开头的名称没有扩展名
pub fn split_extension(name: &str) -> (&str, &str) {
    match name.rfind('.') {
        Some(idx) if idx > 0 => name.split_at(idx),
        _ => (name, ""),
    }
}

/// 并发修改时客户端副本的名称：`报告 (conflicting copy).txt`、`报告 (conflicting copy 2).txt`…
pub fn conflicting_copy_label(round: u32) -> String {
    if round <= 1 {
        "(conflicting copy)".to_string()
    } else {
        format!("(conflicting copy {})", round)
    }
}

/// 同名冲突时较新条目的名称：`a (1).txt`、`a (2).txt`…
pub fn numbered_label(round: u32) -> String {
    format!("({})", round)
}

/// 拼接 `主名 标签扩展名`，超出长度上限时截断主名；扩展名本身过长时舍弃扩展名
fn labeled_leaf(stem: &str, label: &str, ext: &str) -> String {
    let label_len = label.chars().count() + 1;
    let ext = if label_len + ext.chars().count() >= MAX_NAME_LENGTH {
        ""
    } else {
        ext
    };
    let budget = MAX_NAME_LENGTH.saturating_sub(label_len + ext.chars().count());
    let stem: String = stem.chars().take(budget).collect();
    format!("{} {}{}", stem, label, ext)
}

/// 生成未被占用的新标识并登记
fn allocate<T: Version>(identity: &str, label: fn(u32) -> String, names: &mut NameRegistry) -> String {
    let (parent, leaf) = match T::KIND {
        EntityKind::Directory => {
            let parent = parent_path(identity).unwrap_or("/");
            let leaf = identity.rsplit('/').next().unwrap_or(identity);
            (Some(parent), leaf)
        }
        EntityKind::File => (None, identity),
    };
    let (stem, ext) = match T::KIND {
        EntityKind::File => split_extension(leaf),
        EntityKind::Directory => (leaf, ""),
    };

    let mut round = 1;
    loop {
        let candidate_leaf = labeled_leaf(stem, &label(round), ext);
        let candidate = match parent {
            Some(parent) => join_path(parent, &candidate_leaf),
            None => candidate_leaf,
        };
        if names.insert(&candidate) {
            return candidate;
        }
        round += 1;
    }
}

/// 冲突解决器
///
/// 结果只取决于冲突本身、已占用的名称和调用方提供的冲突轮数，不保存任何状态。
#[derive(Debug, Clone)]
pub struct ConflictResolver {
    max_rounds: u32,
    rounds: HashMap<String, u32>,
}

impl ConflictResolver {
    pub fn new(max_rounds: u32, rounds: HashMap<String, u32>) -> Self {
        Self { max_rounds, rounds }
    }

    fn rounds_for(&self, identity: &str) -> u32 {
        self.rounds.get(identity).copied().unwrap_or(0)
    }

    pub fn resolve<T: Version>(&self, conflict: &Conflict<T>, names: &mut NameRegistry) -> Resolution {
        let identity = conflict.identity();
        if self.max_rounds > 0 && self.rounds_for(identity) >= self.max_rounds {
            tracing::warn!("{} 连续 {} 轮冲突，隔离处理", identity, self.rounds_for(identity));
            return Resolution::Quarantine {
                code: ErrorCode::ConflictQuarantined,
            };
        }

        match conflict.kind {
            ConflictKind::Level => Resolution::Reject {
                code: match T::KIND {
                    EntityKind::File => ErrorCode::LevelConflictingFilename,
                    EntityKind::Directory => ErrorCode::LevelConflictingPath,
                },
            },
            ConflictKind::ConcurrentEdit => Resolution::RenameClientCopy {
                identity: allocate::<T>(identity, conflicting_copy_label, names),
            },
            ConflictKind::Name => {
                let identity = allocate::<T>(identity, numbered_label, names);
                if conflict.client.is_some() {
                    Resolution::RenameClientCopy { identity }
                } else {
                    Resolution::RenameServerCopy { identity }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{DirectoryVersion, FileVersion};

    fn file(name: &str, checksum: &str) -> FileVersion {
        FileVersion::new(name, checksum)
    }

    #[test]
    fn test_split_extension() {
        assert_eq!(split_extension("report.final.pdf"), ("report.final", ".pdf"));
        assert_eq!(split_extension(".bashrc"), (".bashrc", ""));
        assert_eq!(split_extension("Makefile"), ("Makefile", ""));
    }

    #[test]
    fn test_concurrent_edit_renames_client_copy() {
        let resolver = ConflictResolver::new(5, HashMap::new());
        let mut names = NameRegistry::new();
        names.extend(["report.txt", "Report (Conflicting Copy).txt"]);
        let conflict = Conflict::new(
            ConflictKind::ConcurrentEdit,
            Some(file("report.txt", "h0")),
            Some(file("report.txt", "h1")),
            Some(file("report.txt", "h2")),
        );
        assert_eq!(
            resolver.resolve(&conflict, &mut names),
            Resolution::RenameClientCopy {
                identity: "report (conflicting copy 2).txt".into()
            }
        );
        // 同一名称不会分配两次
        assert_eq!(
            resolver.resolve(&conflict, &mut names),
            Resolution::RenameClientCopy {
                identity: "report (conflicting copy 3).txt".into()
            }
        );
    }

    #[test]
    fn test_name_conflict_side() {
        let resolver = ConflictResolver::new(5, HashMap::new());
        let mut names = NameRegistry::new();
        names.extend(["foo.txt", "FOO.txt"]);

        let client_side = Conflict::new(ConflictKind::Name, None, Some(file("FOO.txt", "h1")), None);
        assert_eq!(
            resolver.resolve(&client_side, &mut names),
            Resolution::RenameClientCopy {
                identity: "FOO (1).txt".into()
            }
        );

        let server_side = Conflict::new(ConflictKind::Name, None, None, Some(file("FOO.txt", "h1")));
        assert_eq!(
            resolver.resolve(&server_side, &mut names),
            Resolution::RenameServerCopy {
                identity: "FOO (2).txt".into()
            }
        );
    }

    #[test]
    fn test_directory_rename_keeps_parent() {
        let resolver = ConflictResolver::new(5, HashMap::new());
        let mut names = NameRegistry::new();
        let conflict = Conflict::new(
            ConflictKind::Name,
            None,
            Some(DirectoryVersion::new("/a/Photos.2024", "h")),
            None,
        );
        assert_eq!(
            resolver.resolve(&conflict, &mut names),
            Resolution::RenameClientCopy {
                identity: "/a/Photos.2024 (1)".into()
            }
        );
    }

    #[test]
    fn test_generated_names_fit_length_limit() {
        let resolver = ConflictResolver::new(5, HashMap::new());
        let mut names = NameRegistry::new();
        let long = format!("{}.txt", "n".repeat(250));
        let conflict = Conflict::new(
            ConflictKind::ConcurrentEdit,
            Some(file(&long, "h0")),
            Some(file(&long, "h1")),
            Some(file(&long, "h2")),
        );
        let Resolution::RenameClientCopy { identity } = resolver.resolve(&conflict, &mut names) else {
            panic!("expected rename");
        };
        assert_eq!(identity.chars().count(), MAX_NAME_LENGTH);
        assert!(identity.ends_with(" (conflicting copy).txt"));
        assert!(crate::core::filter::validate_file_name(&identity).is_ok());

        // 第二个副本仍然唯一且不超长
        let Resolution::RenameClientCopy { identity: second } = resolver.resolve(&conflict, &mut names) else {
            panic!("expected rename");
        };
        assert_ne!(second, identity);
        assert!(second.chars().count() <= MAX_NAME_LENGTH);

        // 目录只截断最后一段
        let dir = format!("/a/{}", "d".repeat(255));
        let conflict = Conflict::new(ConflictKind::Name, None, Some(DirectoryVersion::new(dir, "h")), None);
        let Resolution::RenameClientCopy { identity } = resolver.resolve(&conflict, &mut names) else {
            panic!("expected rename");
        };
        assert!(identity.starts_with("/a/ddd"));
        assert!(identity.ends_with(" (1)"));
        assert!(crate::core::filter::validate_path(&identity).is_ok());

        // 扩展名本身过长时舍弃扩展名
        assert_eq!(labeled_leaf("a", "(1)", &format!(".{}", "e".repeat(253))), "a (1)");
    }

    #[test]
    fn test_level_conflict_is_rejected() {
        let resolver = ConflictResolver::new(5, HashMap::new());
        let mut names = NameRegistry::new();
        let file_conflict = Conflict::new(ConflictKind::Level, None, Some(file("x", "h")), None);
        assert_eq!(
            resolver.resolve(&file_conflict, &mut names),
            Resolution::Reject {
                code: ErrorCode::LevelConflictingFilename
            }
        );
        let dir_conflict = Conflict::new(
            ConflictKind::Level,
            None,
            Some(DirectoryVersion::new("/x", "h")),
            None,
        );
        assert_eq!(
            resolver.resolve(&dir_conflict, &mut names),
            Resolution::Reject {
                code: ErrorCode::LevelConflictingPath
            }
        );
    }

    #[test]
    fn test_repeated_conflicts_escalate_to_quarantine() {
        let mut rounds = HashMap::new();
        rounds.insert("report.txt".to_string(), 5);
        let resolver = ConflictResolver::new(5, rounds);
        let conflict = Conflict::new(
            ConflictKind::ConcurrentEdit,
            Some(file("report.txt", "h0")),
            Some(file("report.txt", "h1")),
            Some(file("report.txt", "h2")),
        );
        assert_eq!(
            resolver.resolve(&conflict, &mut NameRegistry::new()),
            Resolution::Quarantine {
                code: ErrorCode::ConflictQuarantined
            }
        );
    }
}
