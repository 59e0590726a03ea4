//! 三方差异比较：original（客户端上次同步后的状态）、client（客户端当前状态）、server（服务端当前状态）

use crate::core::checksum::empty_checksum;
use crate::core::conflict::{Conflict, ConflictKind, NameRegistry};
use crate::models::{fold_identity, Version};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

/// 单个标识的变化
#[derive(Debug, Clone, PartialEq)]
pub enum Change<T> {
    /// 两端已一致，客户端只需更新 original
    Acknowledge { original: Option<T>, current: Option<T> },
    /// 仅服务端新增或修改（或客户端删除但服务端修改）
    ServerChanged { client: Option<T>, server: T },
    /// 仅服务端删除
    ServerRemoved { client: T },
    /// 仅客户端新增或修改（或服务端删除但客户端修改）
    ClientChanged {
        original: Option<T>,
        client: T,
        server: Option<T>,
    },
    /// 仅客户端删除
    ClientRemoved { original: T, server: T },
    /// 目录两端都变化，内容在文件级合并
    Diverged { client: T, server: T },
    /// 客户端重命名（由一次删除与一次新增配对得到）
    ClientMoved { original: T, server: T, client: T },
    /// 服务端重命名
    ServerMoved { client: T, server: T },
    Conflict(Conflict<T>),
}

impl<T: Version> Change<T> {
    /// 排序与计数使用的标识，重命名取新标识
    pub fn identity(&self) -> &str {
        match self {
            Change::Acknowledge { original, current } => current
                .as_ref()
                .or(original.as_ref())
                .map(|v| v.identity())
                .unwrap_or_default(),
            Change::ServerChanged { server, .. } => server.identity(),
            Change::ServerRemoved { client } => client.identity(),
            Change::ClientChanged { client, .. } => client.identity(),
            Change::ClientRemoved { original, .. } => original.identity(),
            Change::Diverged { client, .. } => client.identity(),
            Change::ClientMoved { client, .. } => client.identity(),
            Change::ServerMoved { server, .. } => server.identity(),
            Change::Conflict(conflict) => conflict.identity(),
        }
    }

    /// 合并后该标识是否仍然存在
    fn survives(&self) -> bool {
        match self {
            Change::Acknowledge { current, .. } => current.is_some(),
            Change::ServerRemoved { .. } | Change::ClientRemoved { .. } => false,
            Change::Conflict(conflict) => conflict.kind != ConflictKind::Level,
            _ => true,
        }
    }
}

/// 差异比较上下文
#[derive(Debug, Clone, Default)]
pub struct DiffContext {
    /// 被另一种实体占用的标识（已折叠大小写）。比较文件时为同级子目录名，比较目录时为父目录下的文件路径
    pub occupied: HashSet<String>,
}

impl DiffContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_occupied<I, S>(identities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            occupied: identities
                .into_iter()
                .map(|s| fold_identity(s.as_ref()))
                .collect(),
        }
    }
}

/// 比较结果，按标识排序
#[derive(Debug, Clone)]
pub struct ClassifiedDiff<T> {
    pub changes: Vec<Change<T>>,
    pub unchanged: usize,
    /// 三方出现过的所有标识，用于生成不冲突的新名称
    pub names: NameRegistry,
}

impl<T> ClassifiedDiff<T> {
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }
}

fn same<T: Version>(a: Option<&T>, b: Option<&T>) -> bool {
    match (a, b) {
        (None, None) => true,
        (Some(a), Some(b)) => a.checksum() == b.checksum(),
        _ => false,
    }
}

/// 对单个标识分类，未变化时返回 None
pub fn classify<T: Version>(o: Option<&T>, c: Option<&T>, s: Option<&T>) -> Option<Change<T>> {
    if same(c, s) {
        if same(o, c) {
            return None;
        }
        return Some(Change::Acknowledge {
            original: o.cloned(),
            current: c.cloned(),
        });
    }

    let client_changed = !same(o, c);
    let server_changed = !same(o, s);
    match (client_changed, server_changed, c, s) {
        // 仅服务端变化
        (false, true, c, Some(s)) => Some(Change::ServerChanged {
            client: c.cloned(),
            server: s.clone(),
        }),
        (false, true, Some(c), None) => Some(Change::ServerRemoved { client: c.clone() }),
        // 仅客户端变化
        (true, false, Some(c), s) => Some(Change::ClientChanged {
            original: o.cloned(),
            client: c.clone(),
            server: s.cloned(),
        }),
        (true, false, None, Some(s)) => o.map(|o| Change::ClientRemoved {
            original: o.clone(),
            server: s.clone(),
        }),
        // 两端都变化：删除让位于修改
        (true, true, None, Some(s)) => Some(Change::ServerChanged {
            client: None,
            server: s.clone(),
        }),
        (true, true, Some(c), None) => Some(Change::ClientChanged {
            original: o.cloned(),
            client: c.clone(),
            server: None,
        }),
        (true, true, Some(c), Some(s)) => Some(match T::KIND {
            crate::models::EntityKind::File => Change::Conflict(Conflict::new(
                ConflictKind::ConcurrentEdit,
                o.cloned(),
                Some(c.clone()),
                Some(s.clone()),
            )),
            crate::models::EntityKind::Directory => Change::Diverged {
                client: c.clone(),
                server: s.clone(),
            },
        }),
        _ => None,
    }
}

fn index<T: Version>(versions: &[T]) -> BTreeMap<&str, &T> {
    let mut map = BTreeMap::new();
    for version in versions {
        map.entry(version.identity()).or_insert(version);
    }
    map
}

/// 三方差异比较器
pub struct VersionDiffer;

impl VersionDiffer {
    pub fn diff<T: Version>(
        original: &[T],
        client: &[T],
        server: &[T],
        context: &DiffContext,
    ) -> ClassifiedDiff<T> {
        let o = index(original);
        let c = index(client);
        let s = index(server);

        let identities: BTreeSet<&str> = o.keys().chain(c.keys()).chain(s.keys()).copied().collect();

        let mut names = NameRegistry::new();
        names.extend(identities.iter().copied());

        let mut unchanged = 0;
        let mut changes: BTreeMap<&str, Change<T>> = BTreeMap::new();
        // 合并后仍存在的标识，按折叠后的名称分组
        let mut survivors: BTreeMap<String, Vec<&str>> = BTreeMap::new();

        for identity in identities.iter().copied() {
            let (oi, ci, si) = (
                o.get(identity).copied(),
                c.get(identity).copied(),
                s.get(identity).copied(),
            );
            let Some(mut change) = classify(oi, ci, si) else {
                unchanged += 1;
                if ci.is_some() {
                    survivors.entry(fold_identity(identity)).or_default().push(identity);
                }
                continue;
            };

            // 客户端新增的条目与另一种实体同名
            let level_conflict = match &change {
                Change::ClientChanged {
                    original: None,
                    client,
                    server: None,
                } if context.occupied.contains(&fold_identity(identity)) => Some(client.clone()),
                _ => None,
            };
            if let Some(client) = level_conflict {
                change = Change::Conflict(Conflict::new(ConflictKind::Level, None, Some(client), None));
            }

            if change.survives() {
                survivors.entry(fold_identity(identity)).or_default().push(identity);
            }
            changes.insert(identity, change);
        }

        // 大小写不敏感的同名冲突：保留已存在的条目，较新的条目改名
        for group in survivors.values().filter(|g| g.len() > 1) {
            let keeper = group
                .iter()
                .find(|id| o.contains_key(**id))
                .or_else(|| group.iter().find(|id| s.contains_key(**id)))
                .or_else(|| group.first())
                .copied();

            for identity in group.iter().copied() {
                if Some(identity) == keeper || o.contains_key(identity) {
                    continue;
                }
                let conflict = match (c.get(identity), s.get(identity)) {
                    (Some(ci), None) => Conflict::new(ConflictKind::Name, None, Some((*ci).clone()), None),
                    (None, Some(si)) => Conflict::new(ConflictKind::Name, None, None, Some((*si).clone())),
                    _ => continue,
                };
                tracing::debug!("名称冲突: {} 与 {:?}", identity, keeper);
                changes.insert(identity, Change::Conflict(conflict));
            }
        }

        ClassifiedDiff {
            changes: changes.into_values().collect(),
            unchanged,
            names,
        }
    }
}

/// 将唯一匹配的“删除 + 新增”配对为重命名
///
/// 只配对校验和相同、且该校验和在删除侧和新增侧都唯一的条目；空内容的校验和不参与配对。
pub fn pair_renames<T: Version>(changes: Vec<Change<T>>) -> Vec<Change<T>> {
    let trivial = empty_checksum();
    let mut client_removed: HashMap<&str, Vec<usize>> = HashMap::new();
    let mut client_added: HashMap<&str, Vec<usize>> = HashMap::new();
    let mut server_removed: HashMap<&str, Vec<usize>> = HashMap::new();
    let mut server_added: HashMap<&str, Vec<usize>> = HashMap::new();

    for (idx, change) in changes.iter().enumerate() {
        let (bucket, checksum) = match change {
            Change::ClientRemoved { original, server } if original.checksum() == server.checksum() => {
                (&mut client_removed, original.checksum())
            }
            Change::ClientChanged {
                original: None,
                client,
                server: None,
            } => (&mut client_added, client.checksum()),
            Change::ServerRemoved { client } => (&mut server_removed, client.checksum()),
            Change::ServerChanged { client: None, server } => (&mut server_added, server.checksum()),
            _ => continue,
        };
        if checksum != trivial {
            bucket.entry(checksum).or_default().push(idx);
        }
    }

    let unique_pairs = |removed: &HashMap<&str, Vec<usize>>, added: &HashMap<&str, Vec<usize>>| {
        removed
            .iter()
            .filter_map(|(checksum, r)| match (r.as_slice(), added.get(checksum).map(Vec::as_slice)) {
                ([from], Some([to])) => Some((*from, *to)),
                _ => None,
            })
            .collect::<Vec<_>>()
    };
    let client_pairs = unique_pairs(&client_removed, &client_added);
    let server_pairs = unique_pairs(&server_removed, &server_added);

    let mut slots: Vec<Option<Change<T>>> = changes.into_iter().map(Some).collect();
    for (from, to) in client_pairs {
        if let (Some(Change::ClientRemoved { original, server }), Some(Change::ClientChanged { client, .. })) =
            (slots[from].take(), slots[to].take())
        {
            tracing::debug!("客户端重命名: {} -> {}", original.identity(), client.identity());
            slots[to] = Some(Change::ClientMoved {
                original,
                server,
                client,
            });
        }
    }
    for (from, to) in server_pairs {
        if let (Some(Change::ServerRemoved { client }), Some(Change::ServerChanged { server, .. })) =
            (slots[from].take(), slots[to].take())
        {
            tracing::debug!("服务端重命名: {} -> {}", client.identity(), server.identity());
            slots[to] = Some(Change::ServerMoved { client, server });
        }
    }
    slots.into_iter().flatten().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::checksum::content_checksum;
    use crate::models::{DirectoryVersion, FileVersion};

    fn f(name: &str, content: &str) -> FileVersion {
        FileVersion::new(name, content_checksum(content.as_bytes()))
    }

    fn d(path: &str, content: &str) -> DirectoryVersion {
        DirectoryVersion::new(path, content_checksum(content.as_bytes()))
    }

    fn diff_files(o: &[FileVersion], c: &[FileVersion], s: &[FileVersion]) -> ClassifiedDiff<FileVersion> {
        VersionDiffer::diff(o, c, s, &DiffContext::new())
    }

    #[test]
    fn test_unchanged_yields_nothing() {
        let all = vec![f("a", "1"), f("b", "2")];
        let diff = diff_files(&all, &all, &all);
        assert!(diff.is_empty());
        assert_eq!(diff.unchanged, 2);
    }

    #[test]
    fn test_one_sided_changes() {
        let o = vec![f("keep", "1"), f("srv-del", "2"), f("cli-del", "3"), f("srv-mod", "4")];
        let c = vec![f("keep", "1"), f("srv-del", "2"), f("srv-mod", "4"), f("cli-new", "5")];
        let s = vec![f("keep", "1"), f("cli-del", "3"), f("srv-mod", "4x")];
        let diff = diff_files(&o, &c, &s);

        assert_eq!(
            diff.changes,
            vec![
                Change::ClientRemoved {
                    original: f("cli-del", "3"),
                    server: f("cli-del", "3")
                },
                Change::ClientChanged {
                    original: None,
                    client: f("cli-new", "5"),
                    server: None
                },
                Change::ServerRemoved {
                    client: f("srv-del", "2")
                },
                Change::ServerChanged {
                    client: Some(f("srv-mod", "4")),
                    server: f("srv-mod", "4x")
                },
            ]
        );
    }

    #[test]
    fn test_converged_changes_are_acknowledged() {
        let o = vec![f("gone", "1"), f("same", "1")];
        let c = vec![f("same", "2")];
        let s = vec![f("same", "2")];
        let diff = diff_files(&o, &c, &s);
        assert_eq!(
            diff.changes,
            vec![
                Change::Acknowledge {
                    original: Some(f("gone", "1")),
                    current: None
                },
                Change::Acknowledge {
                    original: Some(f("same", "1")),
                    current: Some(f("same", "2"))
                },
            ]
        );
    }

    #[test]
    fn test_delete_yields_to_modification() {
        let o = vec![f("a", "1"), f("b", "1")];
        let c = vec![f("b", "2")];
        let s = vec![f("a", "2")];
        let diff = diff_files(&o, &c, &s);
        assert_eq!(
            diff.changes,
            vec![
                Change::ServerChanged {
                    client: None,
                    server: f("a", "2")
                },
                Change::ClientChanged {
                    original: Some(f("b", "1")),
                    client: f("b", "2"),
                    server: None
                },
            ]
        );
    }

    #[test]
    fn test_concurrent_edit_is_conflict_for_files_only() {
        let diff = diff_files(&[f("x", "0")], &[f("x", "1")], &[f("x", "2")]);
        assert!(matches!(
            &diff.changes[0],
            Change::Conflict(Conflict { kind: ConflictKind::ConcurrentEdit, .. })
        ));

        let dirs = VersionDiffer::diff(&[d("/x", "0")], &[d("/x", "1")], &[d("/x", "2")], &DiffContext::new());
        assert!(matches!(&dirs.changes[0], Change::Diverged { .. }));
    }

    #[test]
    fn test_case_insensitive_name_collision() {
        // 客户端新增 Foo.txt，服务端已有 foo.txt
        let o = vec![f("foo.txt", "1")];
        let c = vec![f("foo.txt", "1"), f("Foo.txt", "2")];
        let s = vec![f("foo.txt", "1")];
        let diff = diff_files(&o, &c, &s);
        assert_eq!(diff.changes.len(), 1);
        assert_eq!(
            diff.changes[0],
            Change::Conflict(Conflict::new(ConflictKind::Name, None, Some(f("Foo.txt", "2")), None))
        );

        // 两端同时新增，保留服务端副本
        let diff = diff_files(&[], &[f("REPORT", "1")], &[f("report", "2")]);
        let conflicts: Vec<_> = diff
            .changes
            .iter()
            .filter(|c| matches!(c, Change::Conflict(_)))
            .collect();
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].identity(), "REPORT");
    }

    #[test]
    fn test_level_conflict_against_other_kind() {
        let context = DiffContext::with_occupied(["Photos"]);
        let diff = VersionDiffer::diff(&[], &[f("photos", "1")], &[], &context);
        assert_eq!(
            diff.changes,
            vec![Change::Conflict(Conflict::new(
                ConflictKind::Level,
                None,
                Some(f("photos", "1")),
                None
            ))]
        );
    }

    #[test]
    fn test_pair_renames_unique_checksums_only() {
        let o = vec![f("old.txt", "content"), f("a", "dup"), f("b", "dup")];
        let c = vec![f("new.txt", "content"), f("c", "dup"), f("d", "dup")];
        let s = o.clone();
        let diff = diff_files(&o, &c, &s);
        let paired = pair_renames(diff.changes);

        let moves: Vec<_> = paired
            .iter()
            .filter(|c| matches!(c, Change::ClientMoved { .. }))
            .collect();
        assert_eq!(moves.len(), 1);
        assert_eq!(moves[0].identity(), "new.txt");
        // 重复的校验和保持删除 + 新增
        assert_eq!(paired.len(), 5);
    }

    #[test]
    fn test_pair_server_renames_and_skip_empty_content() {
        let o = vec![f("x", "payload"), f("empty", "")];
        let s = vec![f("y", "payload"), f("empty2", "")];
        let diff = diff_files(&o, &o, &s);
        let paired = pair_renames(diff.changes);
        assert!(paired.contains(&Change::ServerMoved {
            client: f("x", "payload"),
            server: f("y", "payload")
        }));
        assert!(paired.contains(&Change::ServerRemoved { client: f("empty", "") }));
    }
}
