//! 动作规划：把分类后的变化转换为客户端/服务端动作
//!
//! 变化先按 (层级, 标识) 排序，再按客户端动作数截断为一个批次；批次内做重命名配对，
//! 最后展开为动作并统一排序。被截断的变化在下一次同步中重新出现。

use crate::core::comparator::{pair_renames, Change, ClassifiedDiff};
use crate::core::conflict::{Conflict, ConflictResolver, Resolution};
use crate::error::{ErrorCode, ErrorInfo};
use crate::models::{
    is_ancestor, parent_path, ActionKind, DriveAction, EntityKind, ParameterKey, SyncPlan, Version,
};
use crate::storage::{Permissions, ServerFile};
use serde_json::Value;
use std::collections::HashMap;
use tracing::debug;

/// 按目录路径查询权限；未登记的路径继承最近的已登记祖先，都没有时使用默认权限
#[derive(Debug, Clone, Default)]
pub struct PermissionMap {
    default: Permissions,
    by_path: HashMap<String, Permissions>,
}

impl PermissionMap {
    pub fn uniform(permissions: Permissions) -> Self {
        Self {
            default: permissions,
            by_path: HashMap::new(),
        }
    }

    pub fn insert(&mut self, path: impl Into<String>, permissions: Permissions) {
        self.by_path.insert(path.into(), permissions);
    }

    pub fn for_path(&self, path: &str) -> Permissions {
        let mut current = Some(path);
        while let Some(path) = current {
            if let Some(permissions) = self.by_path.get(path) {
                return *permissions;
            }
            current = parent_path(path);
        }
        self.default
    }

    pub fn len(&self) -> usize {
        self.by_path.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_path.is_empty()
    }
}

/// 规划所需的上下文
#[derive(Debug, Clone)]
pub struct PlanContext {
    /// 文件同步时所在的目录
    pub directory: Option<String>,
    pub permissions: PermissionMap,
    /// 服务端文件元数据，按文件名索引
    pub metadata: HashMap<String, ServerFile>,
    /// 单批次最多的客户端动作数
    pub max_actions: usize,
}

impl PlanContext {
    pub fn new(max_actions: usize) -> Self {
        Self {
            directory: None,
            permissions: PermissionMap::default(),
            metadata: HashMap::new(),
            max_actions,
        }
    }

    fn directory(&self) -> &str {
        self.directory.as_deref().unwrap_or("/")
    }

    /// 新建条目所需的权限所在目录
    fn create_scope<'a, T: Version>(&'a self, version: &'a T) -> &'a str {
        match T::KIND {
            EntityKind::File => self.directory(),
            EntityKind::Directory => parent_path(version.identity()).unwrap_or("/"),
        }
    }

    /// 修改或删除条目所需的权限所在目录
    fn write_scope<'a, T: Version>(&'a self, version: &'a T) -> &'a str {
        match T::KIND {
            EntityKind::File => self.directory(),
            EntityKind::Directory => version.identity(),
        }
    }
}

enum Step<T> {
    Change(Change<T>),
    Resolved(Conflict<T>, Resolution),
}

impl<T: Version> Step<T> {
    fn identity(&self) -> &str {
        match self {
            Step::Change(change) => change.identity(),
            Step::Resolved(conflict, _) => conflict.identity(),
        }
    }
}

struct Expansion<T> {
    client: Vec<DriveAction<T>>,
    server: Vec<DriveAction<T>>,
    warnings: Vec<ErrorInfo>,
}

impl<T> Default for Expansion<T> {
    fn default() -> Self {
        Self {
            client: Vec::new(),
            server: Vec::new(),
            warnings: Vec::new(),
        }
    }
}

fn error_action<T: Version>(version: Option<T>, code: ErrorCode, quarantine: bool) -> DriveAction<T> {
    let identity = version.as_ref().map(|v| v.identity().to_string()).unwrap_or_default();
    let info = ErrorInfo::new(code, format!("{} ({})", code.name(), identity)).with_identity(identity);
    DriveAction::new(ActionKind::Error, version, None)
        .with_parameter(ParameterKey::Error, serde_json::to_value(&info).unwrap_or_default())
        .with_parameter(ParameterKey::Quarantine, quarantine)
}

/// 动作规划器
pub struct ActionPlanner {
    resolver: ConflictResolver,
}

impl ActionPlanner {
    pub fn new(resolver: ConflictResolver) -> Self {
        Self { resolver }
    }

    pub fn plan<T: Version>(&self, diff: ClassifiedDiff<T>, context: &PlanContext) -> SyncPlan<T> {
        let ClassifiedDiff {
            changes, mut names, ..
        } = diff;

        let steps: Vec<Step<T>> = changes
            .into_iter()
            .map(|change| match change {
                Change::Conflict(conflict) => {
                    let resolution = self.resolver.resolve(&conflict, &mut names);
                    debug!("冲突 {}: {}", conflict.identity(), resolution);
                    Step::Resolved(conflict, resolution)
                }
                other => Step::Change(other),
            })
            .collect();

        // 按 (层级, 标识) 排序后截断
        let mut ranked: Vec<(u8, String, usize, Step<T>)> = steps
            .into_iter()
            .map(|step| {
                let expansion = self.expand(&step, context);
                let tier = expansion
                    .client
                    .iter()
                    .map(|a| a.action.tier())
                    .min()
                    .unwrap_or(ActionKind::None.tier());
                let cost = expansion.client.len().max(1);
                (tier, step.identity().to_string(), cost, step)
            })
            .collect();
        ranked.sort_by(|a, b| (a.0, &a.1).cmp(&(b.0, &b.1)));

        let total = ranked.len();
        let mut budget = 0;
        let mut window = Vec::new();
        for (_, _, cost, step) in ranked {
            // 第一项总是放行，保证每次调用都有进展
            if !window.is_empty() && budget + cost > context.max_actions {
                break;
            }
            budget += cost;
            window.push(step);
        }
        if window.len() < total {
            debug!("本批次处理 {} 项变化，推迟 {} 项", window.len(), total - window.len());
        }

        // 只在批次内配对重命名
        let mut batch_changes = Vec::new();
        let mut batch_resolved = Vec::new();
        for step in window {
            match step {
                Step::Change(change) => batch_changes.push(change),
                resolved => batch_resolved.push(resolved),
            }
        }
        let mut batch: Vec<Step<T>> = pair_renames(batch_changes).into_iter().map(Step::Change).collect();
        batch.extend(batch_resolved);

        let mut plan = SyncPlan::default();
        for step in &batch {
            let expansion = self.expand(step, context);
            plan.client_actions.extend(expansion.client);
            plan.server_actions.extend(expansion.server);
            plan.warnings.extend(expansion.warnings);
        }

        if T::KIND == EntityKind::Directory {
            plan.client_actions = collapse_nested(plan.client_actions);
            plan.server_actions = collapse_nested(plan.server_actions);
        }
        if let Some(directory) = &context.directory {
            for action in plan.client_actions.iter_mut().chain(plan.server_actions.iter_mut()) {
                action
                    .parameters
                    .insert(ParameterKey::Path, Value::from(directory.as_str()));
            }
        }

        sort_actions(&mut plan.client_actions);
        sort_actions(&mut plan.server_actions);
        plan
    }

    fn expand<T: Version>(&self, step: &Step<T>, context: &PlanContext) -> Expansion<T> {
        let mut out = Expansion::default();
        match step {
            Step::Change(change) => self.expand_change(change, context, &mut out),
            Step::Resolved(conflict, resolution) => {
                self.expand_resolution(conflict, resolution, context, &mut out)
            }
        }
        out
    }

    /// 让客户端取得服务端版本：文件下载，目录同步
    fn fetch<T: Version>(&self, current: Option<T>, target: &T, source: &str, context: &PlanContext) -> DriveAction<T> {
        match T::KIND {
            EntityKind::Directory => DriveAction::new(ActionKind::Sync, current, Some(target.clone())),
            EntityKind::File => {
                let mut action = DriveAction::new(ActionKind::Download, current, Some(target.clone()));
                if let Some(meta) = context.metadata.get(source) {
                    action = action
                        .with_parameter(ParameterKey::TotalLength, meta.size)
                        .with_parameter(ParameterKey::Modified, meta.modified)
                        .with_parameter(ParameterKey::Created, meta.created);
                    if let Some(content_type) = &meta.content_type {
                        action = action.with_parameter(ParameterKey::ContentType, content_type.as_str());
                    }
                }
                action
            }
        }
    }

    /// 客户端新建条目，检查创建权限
    fn create<T: Version>(&self, version: &T, context: &PlanContext, out: &mut Expansion<T>) {
        if !context.permissions.for_path(context.create_scope(version)).create {
            debug!("无创建权限: {}", version.identity());
            out.client
                .push(error_action(Some(version.clone()), ErrorCode::NoCreatePermission, true));
            return;
        }
        match T::KIND {
            EntityKind::File => out
                .client
                .push(DriveAction::new(ActionKind::Upload, None, Some(version.clone()))),
            EntityKind::Directory => {
                out.server
                    .push(DriveAction::new(ActionKind::Sync, None, Some(version.clone())));
                out.client
                    .push(DriveAction::new(ActionKind::Sync, Some(version.clone()), None));
            }
        }
    }

    fn expand_change<T: Version>(&self, change: &Change<T>, context: &PlanContext, out: &mut Expansion<T>) {
        match change {
            Change::Acknowledge { original, current } => out.client.push(DriveAction::new(
                ActionKind::Acknowledge,
                original.clone(),
                current.clone(),
            )),
            Change::ServerChanged { client, server } => {
                out.client
                    .push(self.fetch(client.clone(), server, server.identity(), context))
            }
            Change::ServerRemoved { client } => {
                out.client
                    .push(DriveAction::new(ActionKind::Remove, Some(client.clone()), None))
            }
            Change::ClientChanged {
                original,
                client,
                server,
            } => match server {
                None => self.create(client, context, out),
                Some(server) => match T::KIND {
                    EntityKind::File => {
                        if context.permissions.for_path(context.write_scope(client)).modify {
                            out.client.push(DriveAction::new(
                                ActionKind::Upload,
                                Some(server.clone()),
                                Some(client.clone()),
                            ));
                        } else {
                            debug!("无修改权限: {}", client.identity());
                            out.client.push(error_action(
                                Some(client.clone()),
                                ErrorCode::NoModifyPermission,
                                true,
                            ));
                        }
                    }
                    // 目录内容的变化在文件级处理
                    EntityKind::Directory => out.client.push(DriveAction::new(
                        ActionKind::Sync,
                        original.clone().or(Some(client.clone())),
                        Some(client.clone()),
                    )),
                },
            },
            Change::ClientRemoved { original, server } => {
                if context.permissions.for_path(context.write_scope(server)).delete {
                    out.server
                        .push(DriveAction::new(ActionKind::Remove, Some(server.clone()), None));
                    out.client.push(DriveAction::new(
                        ActionKind::Acknowledge,
                        Some(original.clone()),
                        None,
                    ));
                } else {
                    debug!("无删除权限，恢复: {}", server.identity());
                    out.client.push(error_action(
                        Some(original.clone()),
                        ErrorCode::NoDeletePermission,
                        false,
                    ));
                    out.client
                        .push(self.fetch(None, server, server.identity(), context));
                }
            }
            Change::Diverged { client, server } => out.client.push(DriveAction::new(
                ActionKind::Sync,
                Some(client.clone()),
                Some(server.clone()),
            )),
            Change::ClientMoved {
                original,
                server,
                client,
            } => {
                let allowed = context.permissions.for_path(context.write_scope(server)).modify
                    && context.permissions.for_path(context.create_scope(client)).create;
                if allowed {
                    out.server.push(DriveAction::new(
                        ActionKind::Edit,
                        Some(server.clone()),
                        Some(client.clone()),
                    ));
                    out.client.push(DriveAction::new(
                        ActionKind::Acknowledge,
                        Some(original.clone()),
                        Some(client.clone()),
                    ));
                } else {
                    // 不能重命名时退化为删除 + 新建，各自检查权限
                    self.expand_change(
                        &Change::ClientRemoved {
                            original: original.clone(),
                            server: server.clone(),
                        },
                        context,
                        out,
                    );
                    self.create(client, context, out);
                }
            }
            Change::ServerMoved { client, server } => out.client.push(DriveAction::new(
                ActionKind::Edit,
                Some(client.clone()),
                Some(server.clone()),
            )),
            // 冲突在规划前已转换为 Step::Resolved
            Change::Conflict(_) => {}
        }
    }

    fn expand_resolution<T: Version>(
        &self,
        conflict: &Conflict<T>,
        resolution: &Resolution,
        context: &PlanContext,
        out: &mut Expansion<T>,
    ) {
        let subject = conflict.client.clone().or_else(|| conflict.server.clone());
        match resolution {
            Resolution::Quarantine { code } => {
                out.client.push(error_action(subject, *code, true));
                out.warnings.push(
                    ErrorInfo::new(*code, format!("{} keeps conflicting", conflict.identity()))
                        .with_identity(conflict.identity()),
                );
            }
            Resolution::Reject { code } => out.client.push(error_action(subject, *code, false)),
            Resolution::RenameClientCopy { identity } => {
                let Some(client) = &conflict.client else {
                    return;
                };
                let renamed = client.renamed(identity);
                out.client.push(DriveAction::new(
                    ActionKind::Edit,
                    Some(client.clone()),
                    Some(renamed.clone()),
                ));
                self.create(&renamed, context, out);
                // 并发修改：客户端再取回服务端版本
                if let Some(server) = &conflict.server {
                    out.client
                        .push(self.fetch(None, server, server.identity(), context));
                }
            }
            Resolution::RenameServerCopy { identity } => {
                let Some(server) = &conflict.server else {
                    return;
                };
                let renamed = server.renamed(identity);
                out.server.push(DriveAction::new(
                    ActionKind::Edit,
                    Some(server.clone()),
                    Some(renamed.clone()),
                ));
                out.client
                    .push(self.fetch(None, &renamed, server.identity(), context));
            }
        }
    }
}

/// 按 (层级, 标识) 稳定排序
pub fn sort_actions<T: Version>(actions: &mut [DriveAction<T>]) {
    actions.sort_by(|a, b| {
        a.action
            .tier()
            .cmp(&b.action.tier())
            .then_with(|| a.identity().cmp(b.identity()))
    });
}

/// 祖先目录已被删除或重命名时，省略子目录上的同类动作
fn collapse_nested<T: Version>(actions: Vec<DriveAction<T>>) -> Vec<DriveAction<T>> {
    let removed: Vec<String> = actions
        .iter()
        .filter(|a| a.action == ActionKind::Remove)
        .filter_map(|a| a.version.as_ref().map(|v| v.identity().to_string()))
        .collect();
    let moved: Vec<(String, String)> = actions
        .iter()
        .filter(|a| a.action == ActionKind::Edit)
        .filter_map(|a| {
            Some((
                a.version.as_ref()?.identity().to_string(),
                a.new_version.as_ref()?.identity().to_string(),
            ))
        })
        .collect();

    let implied_move = |from: &str, to: &str| {
        moved.iter().any(|(parent_from, parent_to)| {
            is_ancestor(parent_from, from)
                && is_ancestor(parent_to, to)
                && from[parent_from.len()..] == to[parent_to.len()..]
        })
    };

    actions
        .into_iter()
        .filter(|action| match (action.action, &action.version, &action.new_version) {
            (ActionKind::Remove, Some(v), _) => !removed.iter().any(|r| is_ancestor(r, v.identity())),
            (ActionKind::Edit, Some(v), Some(n)) => !implied_move(v.identity(), n.identity()),
            _ => true,
        })
        .collect()
}
