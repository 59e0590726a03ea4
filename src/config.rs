//! 引擎配置模块

use crate::core::filter::StaticPatterns;
use crate::core::version::{ClientVersionGate, VersionThresholds};
use crate::error::DriveError;
use crate::models::ClientType;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// 同步引擎配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DriveConfig {
    /// 单次目录同步最多返回的客户端动作数
    #[serde(default = "default_max_directory_actions")]
    pub max_directory_actions: usize,
    /// 单次文件同步最多返回的客户端动作数
    #[serde(default = "default_max_file_actions")]
    pub max_file_actions: usize,
    /// 并发同步上限，-1 表示不限制
    #[serde(default = "default_unlimited")]
    pub max_concurrent_sync_operations: i64,
    /// 等待同步许可的最长时间（毫秒）
    #[serde(default = "default_sync_permit_timeout_ms")]
    pub sync_permit_timeout_ms: u64,
    #[serde(default = "default_min_api_version")]
    pub min_api_version: u32,
    /// 排除的文件名（正则，整串匹配，大小写不敏感）
    #[serde(default = "default_excluded_filenames_pattern")]
    pub excluded_filenames_pattern: String,
    /// 排除的目录路径（正则，整串匹配，大小写不敏感）
    #[serde(default = "default_excluded_directories_pattern")]
    pub excluded_directories_pattern: String,
    #[serde(default)]
    pub client_versions: HashMap<ClientType, VersionThresholds>,
    /// 同一标识连续冲突达到该轮数后隔离
    #[serde(default = "default_max_conflict_rounds")]
    pub max_conflict_rounds: u32,
    #[serde(default = "default_unlimited")]
    pub max_directories: i64,
    #[serde(default = "default_unlimited")]
    pub max_files_per_directory: i64,
    /// 单次存储调用超时（秒）
    #[serde(default = "default_storage_timeout_secs")]
    pub storage_timeout_secs: u64,
    #[serde(default = "default_checksum_cleaner_interval_secs")]
    pub checksum_cleaner_interval_secs: u64,
    /// 超过该时长未使用的校验和缓存条目会被清理
    #[serde(default = "default_checksum_max_age_secs")]
    pub checksum_max_age_secs: u64,
    /// 节点总带宽（字节/秒），-1 表示不限制
    #[serde(default = "default_unlimited")]
    pub node_bandwidth_limit: i64,
    /// 单会话带宽（字节/秒），-1 表示不限制
    #[serde(default = "default_unlimited")]
    pub session_bandwidth_limit: i64,
    #[serde(default = "default_long_polling_timeout_secs")]
    pub long_polling_timeout_secs: u64,
}

fn default_max_directory_actions() -> usize {
    1000
}

fn default_max_file_actions() -> usize {
    500
}

fn default_unlimited() -> i64 {
    -1
}

fn default_sync_permit_timeout_ms() -> u64 {
    500
}

fn default_min_api_version() -> u32 {
    1
}

fn default_excluded_filenames_pattern() -> String {
    r"thumbs\.db|desktop\.ini|\.ds_store|icon\r|\.msngr_hstr_data|.*\.drivepart".to_string()
}

fn default_excluded_directories_pattern() -> String {
    r"/\.drive|/\.msngr_hstr_data|/\.drive-meta".to_string()
}

fn default_max_conflict_rounds() -> u32 {
    5
}

fn default_storage_timeout_secs() -> u64 {
    60
}

fn default_checksum_cleaner_interval_secs() -> u64 {
    86400 // 每天一次
}

fn default_checksum_max_age_secs() -> u64 {
    2_419_200 // 4 周
}

fn default_long_polling_timeout_secs() -> u64 {
    90
}

impl Default for DriveConfig {
    fn default() -> Self {
        Self {
            max_directory_actions: default_max_directory_actions(),
            max_file_actions: default_max_file_actions(),
            max_concurrent_sync_operations: default_unlimited(),
            sync_permit_timeout_ms: default_sync_permit_timeout_ms(),
            min_api_version: default_min_api_version(),
            excluded_filenames_pattern: default_excluded_filenames_pattern(),
            excluded_directories_pattern: default_excluded_directories_pattern(),
            client_versions: HashMap::new(),
            max_conflict_rounds: default_max_conflict_rounds(),
            max_directories: default_unlimited(),
            max_files_per_directory: default_unlimited(),
            storage_timeout_secs: default_storage_timeout_secs(),
            checksum_cleaner_interval_secs: default_checksum_cleaner_interval_secs(),
            checksum_max_age_secs: default_checksum_max_age_secs(),
            node_bandwidth_limit: default_unlimited(),
            session_bandwidth_limit: default_unlimited(),
            long_polling_timeout_secs: default_long_polling_timeout_secs(),
        }
    }
}

/// 负数表示不限制
pub fn limit(value: i64) -> Option<u64> {
    u64::try_from(value).ok()
}

impl DriveConfig {
    /// 从配置文件加载同步配置
    pub fn load(config_dir: &Path) -> Self {
        let config_file = config_dir.join("config.json");
        if config_file.exists() {
            if let Ok(content) = fs::read_to_string(&config_file) {
                if let Ok(config) = serde_json::from_str::<serde_json::Value>(&content) {
                    if let Some(drive_config) = config.get("drive") {
                        match serde_json::from_value::<DriveConfig>(drive_config.clone()) {
                            Ok(drive) => return drive,
                            Err(e) => tracing::warn!("同步配置无效，使用默认配置: {}", e),
                        }
                    }
                }
            }
        }
        Self::default()
    }

    /// 保存同步配置
    pub fn save(&self, config_dir: &Path) -> io::Result<()> {
        let config_file = config_dir.join("config.json");

        // 读取现有配置，保留其他模块的配置项
        let mut config: serde_json::Value = if config_file.exists() {
            let content = fs::read_to_string(&config_file)?;
            serde_json::from_str(&content).unwrap_or_else(|_| serde_json::json!({}))
        } else {
            serde_json::json!({})
        };

        config["drive"] = serde_json::to_value(self)?;

        let content = serde_json::to_string_pretty(&config)?;
        fs::write(&config_file, content)?;

        Ok(())
    }

    pub fn sync_permit_timeout(&self) -> Duration {
        Duration::from_millis(self.sync_permit_timeout_ms)
    }

    pub fn storage_timeout(&self) -> Duration {
        Duration::from_secs(self.storage_timeout_secs)
    }

    pub fn long_polling_timeout(&self) -> Duration {
        Duration::from_secs(self.long_polling_timeout_secs)
    }
}

/// 校验后的配置快照：配置本身、编译好的静态排除规则与版本门禁
#[derive(Debug)]
pub struct EngineSettings {
    pub config: DriveConfig,
    pub static_patterns: Arc<StaticPatterns>,
    pub version_gate: ClientVersionGate,
}

impl EngineSettings {
    pub fn from_config(config: DriveConfig) -> Result<Self, DriveError> {
        let invalid = |field: &str| {
            Err(DriveError::InvalidConfig(format!(
                "{} must be greater than zero",
                field
            )))
        };
        if config.max_directory_actions == 0 {
            return invalid("maxDirectoryActions");
        }
        if config.max_file_actions == 0 {
            return invalid("maxFileActions");
        }
        // 负数表示不限制，0 会让所有调用都得不到许可
        if config.max_concurrent_sync_operations == 0 {
            return invalid("maxConcurrentSyncOperations");
        }
        if config.storage_timeout_secs == 0 {
            return invalid("storageTimeoutSecs");
        }
        if config.checksum_cleaner_interval_secs == 0 {
            return invalid("checksumCleanerIntervalSecs");
        }
        let static_patterns = Arc::new(StaticPatterns::compile(
            &config.excluded_filenames_pattern,
            &config.excluded_directories_pattern,
        )?);
        let version_gate = ClientVersionGate::new(config.client_versions.clone());
        Ok(Self {
            config,
            static_patterns,
            version_gate,
        })
    }
}

/// 配置句柄：读取方拿到不可变快照，重新加载时整体替换
pub struct ConfigHandle {
    current: RwLock<Arc<EngineSettings>>,
}

impl ConfigHandle {
    pub fn new(config: DriveConfig) -> Result<Self, DriveError> {
        Ok(Self {
            current: RwLock::new(Arc::new(EngineSettings::from_config(config)?)),
        })
    }

    pub fn load(config_dir: &Path) -> Result<Self, DriveError> {
        Self::new(DriveConfig::load(config_dir))
    }

    /// 当前快照，持有期间不受后续 reload 影响
    pub fn snapshot(&self) -> Arc<EngineSettings> {
        self.current.read().clone()
    }

    /// 替换配置；校验失败时保留原快照
    pub fn reload(&self, config: DriveConfig) -> Result<(), DriveError> {
        let settings = Arc::new(EngineSettings::from_config(config)?);
        *self.current.write() = settings;
        tracing::info!("同步配置已重新加载");
        Ok(())
    }
}
