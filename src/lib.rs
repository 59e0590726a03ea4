pub mod config;
pub mod core;
pub mod error;
pub mod logging;
pub mod models;
pub mod storage;

pub use config::{ConfigHandle, DriveConfig, EngineSettings};
pub use crate::core::DriveSyncEngine;
pub use error::{DriveError, ErrorCategory, ErrorCode, ErrorInfo};
pub use models::{
    ActionKind, ClientType, DirectoryVersion, DriveAction, FileVersion, ParameterKey, SyncPlan,
    SyncResult, SyncSession,
};

/// 平台配置目录
pub mod dirs {
    use std::path::PathBuf;

    pub fn config_dir() -> Option<PathBuf> {
        if cfg!(target_os = "windows") {
            std::env::var("APPDATA").ok().map(PathBuf::from)
        } else if cfg!(target_os = "macos") {
            std::env::var("HOME")
                .ok()
                .map(|h| PathBuf::from(h).join("Library").join("Application Support"))
        } else {
            std::env::var("XDG_CONFIG_HOME")
                .ok()
                .map(PathBuf::from)
                .or_else(|| std::env::var("HOME").ok().map(|h| PathBuf::from(h).join(".config")))
        }
    }

    /// drivesync 的配置目录，可用 `DRIVESYNC_CONFIG_DIR` 覆盖
    pub fn app_config_dir() -> PathBuf {
        std::env::var("DRIVESYNC_CONFIG_DIR")
            .ok()
            .map(PathBuf::from)
            .or_else(|| config_dir().map(|p| p.join("drivesync")))
            .unwrap_or_else(|| PathBuf::from(".drivesync"))
    }
}
