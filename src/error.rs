//! 错误类型：稳定的错误码、分类、面向用户的提示与可重试标记

use crate::models::ClientType;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// 错误分类
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCategory {
    UserInput,
    Permission,
    Conflict,
    Connectivity,
    Capacity,
    ServerBusy,
    Client,
    Internal,
}

/// 稳定错误码，线上以 `DRV-nnnn` 形式出现
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    InvalidPath,
    InvalidFilename,
    InvalidPattern,
    InvalidChecksum,
    InvalidVersion,
    InvalidConfig,
    NoCreatePermission,
    NoModifyPermission,
    NoDeletePermission,
    LevelConflictingFilename,
    LevelConflictingPath,
    ConflictQuarantined,
    IoError,
    DbErrorRetry,
    ChecksumFailed,
    QuotaReached,
    TooManyFiles,
    TooManyDirectories,
    ServerBusy,
    ClientVersionOutdated,
    ClientVersionUpdateAvailable,
    ApiVersionUnsupported,
    Internal,
}

impl ErrorCode {
    pub fn number(self) -> u16 {
        match self {
            ErrorCode::InvalidPath => 1,
            ErrorCode::InvalidFilename => 2,
            ErrorCode::InvalidPattern => 3,
            ErrorCode::InvalidChecksum => 4,
            ErrorCode::InvalidVersion => 5,
            ErrorCode::InvalidConfig => 6,
            ErrorCode::NoCreatePermission => 10,
            ErrorCode::NoModifyPermission => 11,
            ErrorCode::NoDeletePermission => 12,
            ErrorCode::LevelConflictingFilename => 20,
            ErrorCode::LevelConflictingPath => 21,
            ErrorCode::ConflictQuarantined => 23,
            ErrorCode::IoError => 30,
            ErrorCode::DbErrorRetry => 31,
            ErrorCode::ChecksumFailed => 32,
            ErrorCode::QuotaReached => 40,
            ErrorCode::TooManyFiles => 41,
            ErrorCode::TooManyDirectories => 42,
            ErrorCode::ServerBusy => 50,
            ErrorCode::ClientVersionOutdated => 60,
            ErrorCode::ClientVersionUpdateAvailable => 61,
            ErrorCode::ApiVersionUnsupported => 62,
            ErrorCode::Internal => 99,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ErrorCode::InvalidPath => "INVALID_PATH",
            ErrorCode::InvalidFilename => "INVALID_FILENAME",
            ErrorCode::InvalidPattern => "INVALID_PATTERN",
            ErrorCode::InvalidChecksum => "INVALID_CHECKSUM",
            ErrorCode::InvalidVersion => "INVALID_VERSION",
            ErrorCode::InvalidConfig => "INVALID_CONFIG",
            ErrorCode::NoCreatePermission => "NO_CREATE_PERMISSION",
            ErrorCode::NoModifyPermission => "NO_MODIFY_PERMISSION",
            ErrorCode::NoDeletePermission => "NO_DELETE_PERMISSION",
            ErrorCode::LevelConflictingFilename => "LEVEL_CONFLICTING_FILENAME",
            ErrorCode::LevelConflictingPath => "LEVEL_CONFLICTING_PATH",
            ErrorCode::ConflictQuarantined => "CONFLICT_QUARANTINED",
            ErrorCode::IoError => "IO_ERROR",
            ErrorCode::DbErrorRetry => "DB_ERROR_RETRY",
            ErrorCode::ChecksumFailed => "CHECKSUM_FAILED",
            ErrorCode::QuotaReached => "QUOTA_REACHED",
            ErrorCode::TooManyFiles => "TOO_MANY_FILES",
            ErrorCode::TooManyDirectories => "TOO_MANY_DIRECTORIES",
            ErrorCode::ServerBusy => "SERVER_BUSY",
            ErrorCode::ClientVersionOutdated => "CLIENT_VERSION_OUTDATED",
            ErrorCode::ClientVersionUpdateAvailable => "CLIENT_VERSION_UPDATE_AVAILABLE",
            ErrorCode::ApiVersionUnsupported => "API_VERSION_UNSUPPORTED",
            ErrorCode::Internal => "INTERNAL",
        }
    }

    pub fn category(self) -> ErrorCategory {
        match self {
            ErrorCode::InvalidPath
            | ErrorCode::InvalidFilename
            | ErrorCode::InvalidPattern
            | ErrorCode::InvalidChecksum
            | ErrorCode::InvalidVersion => ErrorCategory::UserInput,
            ErrorCode::NoCreatePermission
            | ErrorCode::NoModifyPermission
            | ErrorCode::NoDeletePermission => ErrorCategory::Permission,
            ErrorCode::LevelConflictingFilename
            | ErrorCode::LevelConflictingPath
            | ErrorCode::ConflictQuarantined => ErrorCategory::Conflict,
            ErrorCode::IoError | ErrorCode::DbErrorRetry | ErrorCode::ChecksumFailed => {
                ErrorCategory::Connectivity
            }
            ErrorCode::QuotaReached | ErrorCode::TooManyFiles | ErrorCode::TooManyDirectories => {
                ErrorCategory::Capacity
            }
            ErrorCode::ServerBusy => ErrorCategory::ServerBusy,
            ErrorCode::ClientVersionOutdated
            | ErrorCode::ClientVersionUpdateAvailable
            | ErrorCode::ApiVersionUnsupported => ErrorCategory::Client,
            ErrorCode::InvalidConfig | ErrorCode::Internal => ErrorCategory::Internal,
        }
    }

    /// 面向终端用户的提示
    pub fn display_message(self) -> &'static str {
        match self.category() {
            ErrorCategory::UserInput => "The request contains an invalid value.",
            ErrorCategory::Permission => "You are not allowed to perform this change.",
            ErrorCategory::Conflict => "The item conflicts with another item of the same name.",
            ErrorCategory::Connectivity => "The storage is temporarily unavailable. Please try again later.",
            ErrorCategory::Capacity => "The storage limit has been reached.",
            ErrorCategory::ServerBusy => "The server is busy. Please try again later.",
            ErrorCategory::Client => "Please update your client.",
            ErrorCategory::Internal => "An unexpected error occurred.",
        }
    }

    pub fn is_retryable(self) -> bool {
        matches!(
            self.category(),
            ErrorCategory::Connectivity | ErrorCategory::ServerBusy
        )
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DRV-{:04}", self.number())
    }
}

/// 同步引擎错误
#[derive(Error, Debug)]
pub enum DriveError {
    #[error("invalid path: {0}")]
    InvalidPath(String),

    #[error("invalid file name: {0}")]
    InvalidFilename(String),

    #[error("invalid pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error("invalid checksum '{checksum}' for {identity}")]
    InvalidChecksum { identity: String, checksum: String },

    #[error("invalid version: {0}")]
    InvalidVersion(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("client version {actual} of {client_type} is below the required minimum {minimum}")]
    ClientOutdated {
        client_type: ClientType,
        actual: String,
        minimum: String,
    },

    #[error("API version {actual} is below the minimum {minimum}")]
    ApiVersionUnsupported { actual: u32, minimum: u32 },

    #[error("server busy: all {limit} synchronization slots are taken")]
    ServerBusy { limit: usize },

    #[error("quota reached: {requested} more {unit} requested, {used} of {limit} in use")]
    QuotaReached {
        unit: &'static str,
        used: u64,
        limit: u64,
        requested: u64,
    },

    #[error("too many files in {path}: {count} exceeds {limit}")]
    TooManyFiles { path: String, count: usize, limit: usize },

    #[error("too many directories: {count} exceeds {limit}")]
    TooManyDirectories { count: usize, limit: usize },

    #[error("storage operation {operation} failed: {message}")]
    Storage { operation: String, message: String },

    #[error("storage operation {operation} timed out after {seconds}s")]
    StorageTimeout { operation: String, seconds: u64 },

    #[error("internal error: {0}")]
    Internal(String),
}

impl DriveError {
    /// 包装存储层的 anyhow 错误，保留完整错误链
    pub fn storage(operation: impl Into<String>, err: anyhow::Error) -> Self {
        DriveError::Storage {
            operation: operation.into(),
            message: format!("{:#}", err),
        }
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            DriveError::InvalidPath(_) => ErrorCode::InvalidPath,
            DriveError::InvalidFilename(_) => ErrorCode::InvalidFilename,
            DriveError::InvalidPattern { .. } => ErrorCode::InvalidPattern,
            DriveError::InvalidChecksum { .. } => ErrorCode::InvalidChecksum,
            DriveError::InvalidVersion(_) => ErrorCode::InvalidVersion,
            DriveError::InvalidConfig(_) => ErrorCode::InvalidConfig,
            DriveError::ClientOutdated { .. } => ErrorCode::ClientVersionOutdated,
            DriveError::ApiVersionUnsupported { .. } => ErrorCode::ApiVersionUnsupported,
            DriveError::ServerBusy { .. } => ErrorCode::ServerBusy,
            DriveError::QuotaReached { .. } => ErrorCode::QuotaReached,
            DriveError::TooManyFiles { .. } => ErrorCode::TooManyFiles,
            DriveError::TooManyDirectories { .. } => ErrorCode::TooManyDirectories,
            DriveError::Storage { .. } => ErrorCode::IoError,
            DriveError::StorageTimeout { .. } => ErrorCode::DbErrorRetry,
            DriveError::Internal(_) => ErrorCode::Internal,
        }
    }

    pub fn category(&self) -> ErrorCategory {
        self.code().category()
    }

    pub fn is_retryable(&self) -> bool {
        self.code().is_retryable()
    }

    pub fn display_message(&self) -> &'static str {
        self.code().display_message()
    }

    pub fn info(&self) -> ErrorInfo {
        ErrorInfo::new(self.code(), self.to_string())
    }
}

/// 可序列化的错误描述，用于警告列表与 ERROR 动作
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorInfo {
    pub code: String,
    pub name: String,
    pub category: ErrorCategory,
    pub message: String,
    pub display_message: String,
    pub retryable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity: Option<String>,
}

impl ErrorInfo {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            name: code.name().to_string(),
            category: code.category(),
            message: message.into(),
            display_message: code.display_message().to_string(),
            retryable: code.is_retryable(),
            identity: None,
        }
    }

    pub fn with_identity(mut self, identity: impl Into<String>) -> Self {
        self.identity = Some(identity.into());
        self
    }

    pub fn is(&self, code: ErrorCode) -> bool {
        self.name == code.name()
    }
}

pub type Result<T> = std::result::Result<T, DriveError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_format() {
        assert_eq!(ErrorCode::InvalidPath.to_string(), "DRV-0001");
        assert_eq!(ErrorCode::ServerBusy.to_string(), "DRV-0050");
        assert_eq!(ErrorCode::Internal.to_string(), "DRV-0099");
    }

    #[test]
    fn test_retryable_categories() {
        let busy = DriveError::ServerBusy { limit: 4 };
        assert!(busy.is_retryable());
        assert_eq!(busy.category(), ErrorCategory::ServerBusy);

        let io = DriveError::storage("list_files", anyhow::anyhow!("connection reset"));
        assert!(io.is_retryable());
        assert!(io.to_string().contains("connection reset"));

        let invalid = DriveError::InvalidPath("a/b".into());
        assert!(!invalid.is_retryable());
        assert_eq!(invalid.category(), ErrorCategory::UserInput);
    }

    #[test]
    fn test_info_serialization() {
        let info = DriveError::TooManyFiles {
            path: "/docs".into(),
            count: 11,
            limit: 10,
        }
        .info()
        .with_identity("/docs");
        let json = serde_json::to_value(&info).unwrap();
        assert_eq!(json["code"], "DRV-0041");
        assert_eq!(json["name"], "TOO_MANY_FILES");
        assert_eq!(json["category"], "CAPACITY");
        assert_eq!(json["identity"], "/docs");
        assert!(info.is(ErrorCode::TooManyFiles));
    }
}
