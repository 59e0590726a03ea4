//! 同步数据模型：目录/文件版本、同步动作、同步结果与会话

use crate::core::version::ClientVersion;
use crate::error::ErrorInfo;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::fmt::Debug;
use std::hash::Hash;

/// 实体类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Directory,
    File,
}

/// 可同步的版本实体（目录或文件）
///
/// 差异比较与动作规划对两种实体共用同一套算法，只通过标识和校验和访问实体。
pub trait Version:
    Clone + Debug + PartialEq + Eq + Hash + Serialize + DeserializeOwned + Send + Sync + 'static
{
    const KIND: EntityKind;

    /// 标识：目录为路径，文件为文件名
    fn identity(&self) -> &str;

    fn checksum(&self) -> &str;

    /// 以新标识复制当前版本（校验和不变）
    fn renamed(&self, identity: &str) -> Self;
}

/// 目录版本
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DirectoryVersion {
    pub path: String,
    pub checksum: String,
}

impl DirectoryVersion {
    pub fn new(path: impl Into<String>, checksum: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            checksum: checksum.into(),
        }
    }
}

impl Version for DirectoryVersion {
    const KIND: EntityKind = EntityKind::Directory;

    fn identity(&self) -> &str {
        &self.path
    }

    fn checksum(&self) -> &str {
        &self.checksum
    }

    fn renamed(&self, identity: &str) -> Self {
        Self::new(identity, self.checksum.clone())
    }
}

/// 文件版本
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileVersion {
    pub name: String,
    pub checksum: String,
}

impl FileVersion {
    pub fn new(name: impl Into<String>, checksum: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            checksum: checksum.into(),
        }
    }
}

impl Version for FileVersion {
    const KIND: EntityKind = EntityKind::File;

    fn identity(&self) -> &str {
        &self.name
    }

    fn checksum(&self) -> &str {
        &self.checksum
    }

    fn renamed(&self, identity: &str) -> Self {
        Self::new(identity, self.checksum.clone())
    }
}

/// 动作类型（线上可见，取值必须保持稳定）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionKind {
    Sync,
    Download,
    Upload,
    Remove,
    Edit,
    Error,
    Acknowledge,
    None,
}

impl ActionKind {
    /// 排序层级：错误最先，其次确认，删除/重命名先于传输，目录同步最后
    pub fn tier(self) -> u8 {
        match self {
            ActionKind::Error => 0,
            ActionKind::Acknowledge => 1,
            ActionKind::Remove | ActionKind::Edit => 2,
            ActionKind::Upload | ActionKind::Download => 3,
            ActionKind::Sync => 4,
            ActionKind::None => 5,
        }
    }
}

/// 动作参数键（封闭集合）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ParameterKey {
    Path,
    Modified,
    Created,
    TotalLength,
    Offset,
    ContentType,
    Error,
    Quarantine,
    Reset,
    Length,
    Stop,
    Acknowledge,
    Root,
    DirectLink,
    DirectLinkFragments,
    PreviewLink,
    ThumbnailLink,
    Data,
}

/// 客户端或服务端需要执行的同步动作
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DriveAction<T> {
    pub action: ActionKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new_version: Option<T>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub parameters: BTreeMap<ParameterKey, Value>,
}

impl<T: Version> DriveAction<T> {
    pub fn new(action: ActionKind, version: Option<T>, new_version: Option<T>) -> Self {
        Self {
            action,
            version,
            new_version,
            parameters: BTreeMap::new(),
        }
    }

    pub fn with_parameter(mut self, key: ParameterKey, value: impl Into<Value>) -> Self {
        self.parameters.insert(key, value.into());
        self
    }

    pub fn parameter(&self, key: ParameterKey) -> Option<&Value> {
        self.parameters.get(&key)
    }

    /// 动作所指向的标识（优先新版本）
    pub fn identity(&self) -> &str {
        self.new_version
            .as_ref()
            .or(self.version.as_ref())
            .map(|v| v.identity())
            .unwrap_or_default()
    }

    pub fn is_quarantine(&self) -> bool {
        self.parameter(ParameterKey::Quarantine)
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }
}

/// 返回给客户端的同步结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncResult<T> {
    pub actions: Vec<DriveAction<T>>,
    #[serde(default)]
    pub warnings: Vec<ErrorInfo>,
}

/// 一次同步调用的完整规划
///
/// 服务端动作交给外部执行器在存储上执行，客户端动作组成返回给客户端的 [`SyncResult`]。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncPlan<T> {
    pub server_actions: Vec<DriveAction<T>>,
    pub client_actions: Vec<DriveAction<T>>,
    pub warnings: Vec<ErrorInfo>,
}

impl<T> Default for SyncPlan<T> {
    fn default() -> Self {
        Self {
            server_actions: Vec::new(),
            client_actions: Vec::new(),
            warnings: Vec::new(),
        }
    }
}

impl<T: Version> SyncPlan<T> {
    pub fn is_empty(&self) -> bool {
        self.server_actions.is_empty() && self.client_actions.is_empty()
    }

    pub fn into_result(self) -> SyncResult<T> {
        SyncResult {
            actions: self.client_actions,
            warnings: self.warnings,
        }
    }

    pub fn client_actions_of(&self, kind: ActionKind) -> impl Iterator<Item = &DriveAction<T>> {
        self.client_actions.iter().filter(move |a| a.action == kind)
    }
}

/// 客户端类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClientType {
    Windows,
    #[serde(rename = "macos")]
    MacOs,
    Ios,
    Android,
    Test,
    #[default]
    #[serde(other)]
    Unknown,
}

impl std::fmt::Display for ClientType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClientType::Windows => write!(f, "windows"),
            ClientType::MacOs => write!(f, "macos"),
            ClientType::Ios => write!(f, "ios"),
            ClientType::Android => write!(f, "android"),
            ClientType::Test => write!(f, "test"),
            ClientType::Unknown => write!(f, "unknown"),
        }
    }
}

/// 客户端声明的文件忽略规则（路径与文件名都匹配时排除）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FilePatternSpec {
    pub path: String,
    pub name: String,
}

/// 客户端声明的目录忽略规则
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DirectoryPatternSpec {
    pub path: String,
}

fn new_session_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

fn default_api_version() -> u32 {
    1
}

/// 单次同步请求的上下文，请求结束即丢弃，不在服务端保留
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncSession {
    #[serde(default = "new_session_id")]
    pub session_id: String,
    pub root_folder_id: String,
    #[serde(default = "default_api_version")]
    pub api_version: u32,
    #[serde(default)]
    pub client_type: ClientType,
    #[serde(default)]
    pub client_version: Option<ClientVersion>,
    #[serde(default)]
    pub file_exclusions: Vec<FilePatternSpec>,
    #[serde(default)]
    pub directory_exclusions: Vec<DirectoryPatternSpec>,
    /// 各标识已连续出现冲突的轮数，由调用方维护
    #[serde(default)]
    pub conflict_rounds: HashMap<String, u32>,
}

impl SyncSession {
    pub fn new(root_folder_id: impl Into<String>) -> Self {
        Self {
            session_id: new_session_id(),
            root_folder_id: root_folder_id.into(),
            api_version: default_api_version(),
            client_type: ClientType::Unknown,
            client_version: None,
            file_exclusions: Vec::new(),
            directory_exclusions: Vec::new(),
            conflict_rounds: HashMap::new(),
        }
    }

    pub fn with_client(mut self, client_type: ClientType, version: Option<ClientVersion>) -> Self {
        self.client_type = client_type;
        self.client_version = version;
        self
    }

    pub fn with_api_version(mut self, api_version: u32) -> Self {
        self.api_version = api_version;
        self
    }

    pub fn exclude_files(mut self, path: impl Into<String>, name: impl Into<String>) -> Self {
        self.file_exclusions.push(FilePatternSpec {
            path: path.into(),
            name: name.into(),
        });
        self
    }

    pub fn exclude_directories(mut self, path: impl Into<String>) -> Self {
        self.directory_exclusions.push(DirectoryPatternSpec { path: path.into() });
        self
    }
}

/// 大小写无关的标识，用于名称冲突检测
pub fn fold_identity(identity: &str) -> String {
    identity.to_lowercase()
}

/// 拼接目录路径与名称
pub fn join_path(parent: &str, name: &str) -> String {
    if parent == "/" {
        format!("/{}", name)
    } else {
        format!("{}/{}", parent, name)
    }
}

/// 父目录路径，根目录没有父目录
pub fn parent_path(path: &str) -> Option<&str> {
    if path == "/" {
        return None;
    }
    match path.rfind('/') {
        Some(0) => Some("/"),
        Some(idx) => Some(&path[..idx]),
        None => None,
    }
}

/// `ancestor` 是否为 `path` 的祖先目录
pub fn is_ancestor(ancestor: &str, path: &str) -> bool {
    if ancestor == path {
        return false;
    }
    if ancestor == "/" {
        return path.starts_with('/');
    }
    path.strip_prefix(ancestor)
        .map(|rest| rest.starts_with('/'))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_action_serialization_uses_closed_vocabulary() {
        let action = DriveAction::new(
            ActionKind::Download,
            None,
            Some(FileVersion::new("f.txt", "h1")),
        )
        .with_parameter(ParameterKey::TotalLength, 42)
        .with_parameter(ParameterKey::Path, "/docs");

        let json = serde_json::to_value(&action).unwrap();
        assert_eq!(json["action"], "download");
        assert_eq!(json["newVersion"]["name"], "f.txt");
        assert_eq!(json["parameters"]["totalLength"], 42);
        assert_eq!(json["parameters"]["path"], "/docs");
        assert!(json.get("version").is_none());
    }

    #[test]
    fn test_unknown_parameter_key_is_rejected() {
        let raw = r#"{"action":"remove","parameters":{"whatever":1}}"#;
        assert!(serde_json::from_str::<DriveAction<FileVersion>>(raw).is_err());
    }

    #[test]
    fn test_client_result_keeps_only_client_actions() {
        let plan = SyncPlan {
            server_actions: vec![DriveAction::new(
                ActionKind::Remove,
                Some(FileVersion::new("old.txt", "h0")),
                None,
            )],
            client_actions: vec![
                DriveAction::new(ActionKind::Upload, None, Some(FileVersion::new("a.txt", "h1")))
                    .with_parameter(ParameterKey::Path, "/docs"),
                DriveAction::new(
                    ActionKind::Edit,
                    Some(FileVersion::new("b.txt", "h2")),
                    Some(FileVersion::new("c.txt", "h2")),
                ),
            ],
            warnings: Vec::new(),
        };
        let result = plan.into_result();
        assert_eq!(result.actions.len(), 2);

        let json = serde_json::to_string(&result).unwrap();
        let parsed: SyncResult<FileVersion> = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, result);
        assert_eq!(parsed.actions[0].version, None);
        assert_eq!(parsed.actions[1].identity(), "c.txt");

        // 缺省的版本字段解析为 None
        let action: DriveAction<FileVersion> =
            serde_json::from_str(r#"{"action":"acknowledge"}"#).unwrap();
        assert_eq!(action.version, None);
        assert_eq!(action.new_version, None);
        assert!(action.parameters.is_empty());
    }

    #[test]
    fn test_session_defaults() {
        let session: SyncSession = serde_json::from_str(r#"{"rootFolderId":"9"}"#).unwrap();
        assert_eq!(session.api_version, 1);
        assert_eq!(session.client_type, ClientType::Unknown);
        assert!(!session.session_id.is_empty());

        let session: SyncSession =
            serde_json::from_str(r#"{"rootFolderId":"9","clientType":"beos"}"#).unwrap();
        assert_eq!(session.client_type, ClientType::Unknown);
    }

    #[test]
    fn test_path_helpers() {
        assert_eq!(join_path("/", "a"), "/a");
        assert_eq!(join_path("/a", "b"), "/a/b");
        assert_eq!(parent_path("/a/b"), Some("/a"));
        assert_eq!(parent_path("/a"), Some("/"));
        assert_eq!(parent_path("/"), None);
        assert!(is_ancestor("/", "/a"));
        assert!(is_ancestor("/a", "/a/b/c"));
        assert!(!is_ancestor("/a", "/ab"));
        assert!(!is_ancestor("/a", "/a"));
    }

    #[test]
    fn test_tiers_order_removals_before_transfers() {
        assert!(ActionKind::Error.tier() < ActionKind::Acknowledge.tier());
        assert!(ActionKind::Remove.tier() < ActionKind::Download.tier());
        assert!(ActionKind::Upload.tier() < ActionKind::Sync.tier());
    }
}
