//! 同步会话准入：并发许可、API 版本与客户端版本检查

use crate::config::{limit, EngineSettings};
use crate::core::version::GateDecision;
use crate::error::{DriveError, ErrorCode, ErrorInfo};
use crate::models::SyncSession;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, warn};

/// 会话状态
///
/// 被拒绝的会话不会得到凭据，`admit` 直接返回错误且不占用许可。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Admitted,
    Running,
    Completed,
}

/// 准入凭据，持有期间占用一个并发许可
#[derive(Debug)]
pub struct SessionTicket {
    state: SessionState,
    session_id: String,
    warnings: Vec<ErrorInfo>,
    _permit: Option<OwnedSemaphorePermit>,
}

impl SessionTicket {
    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn start(&mut self) {
        if self.state == SessionState::Admitted {
            self.state = SessionState::Running;
        }
    }

    /// 结束会话，许可随凭据释放
    pub fn complete(mut self) -> SessionState {
        self.state = SessionState::Completed;
        debug!("会话 {} 完成", self.session_id);
        self.state
    }

    /// 准入阶段产生的警告（例如可升级提示）
    pub fn take_warnings(&mut self) -> Vec<ErrorInfo> {
        std::mem::take(&mut self.warnings)
    }
}

/// 会话准入控制
pub struct SyncSessionGovernor {
    permits: Option<Arc<Semaphore>>,
    limit: usize,
    timeout: Duration,
}

impl SyncSessionGovernor {
    /// `max_concurrent` 为负时不限制并发
    pub fn new(max_concurrent: i64, timeout: Duration) -> Self {
        let limit = limit(max_concurrent).map(|n| n as usize);
        Self {
            permits: limit.map(|n| Arc::new(Semaphore::new(n))),
            limit: limit.unwrap_or(usize::MAX),
            timeout,
        }
    }

    pub fn from_settings(settings: &EngineSettings) -> Self {
        Self::new(
            settings.config.max_concurrent_sync_operations,
            settings.config.sync_permit_timeout(),
        )
    }

    /// 当前可用的许可数，不限制时返回 None
    pub fn available(&self) -> Option<usize> {
        self.permits.as_ref().map(|p| p.available_permits())
    }

    /// 依次检查并发许可、API 版本与客户端版本
    pub async fn admit(
        &self,
        session: &SyncSession,
        settings: &EngineSettings,
    ) -> Result<SessionTicket, DriveError> {
        let permit = match &self.permits {
            None => None,
            Some(permits) => {
                match tokio::time::timeout(self.timeout, Arc::clone(permits).acquire_owned()).await {
                    Ok(Ok(permit)) => Some(permit),
                    Ok(Err(_)) | Err(_) => {
                        warn!("同步并发已满 ({})，拒绝会话 {}", self.limit, session.session_id);
                        return Err(DriveError::ServerBusy { limit: self.limit });
                    }
                }
            }
        };

        let minimum = settings.config.min_api_version;
        if session.api_version < minimum {
            info!("会话 {} 的 API 版本 {} 过低", session.session_id, session.api_version);
            return Err(DriveError::ApiVersionUnsupported {
                actual: session.api_version,
                minimum,
            });
        }

        let mut warnings = Vec::new();
        match settings
            .version_gate
            .check(session.client_type, session.client_version.as_ref())
        {
            GateDecision::Pass => {}
            GateDecision::Blocked { minimum } => {
                let actual = session
                    .client_version
                    .as_ref()
                    .map(|v| v.to_string())
                    .unwrap_or_default();
                info!("客户端 {} {} 版本过低，最低 {}", session.client_type, actual, minimum);
                return Err(DriveError::ClientOutdated {
                    client_type: session.client_type,
                    actual,
                    minimum: minimum.to_string(),
                });
            }
            GateDecision::UpdateAvailable { recommended } => {
                warnings.push(ErrorInfo::new(
                    ErrorCode::ClientVersionUpdateAvailable,
                    format!("version {} is available for {}", recommended, session.client_type),
                ));
            }
        }

        Ok(SessionTicket {
            state: SessionState::Admitted,
            session_id: session.session_id.clone(),
            warnings,
            _permit: permit,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DriveConfig;
    use crate::core::version::VersionThresholds;
    use crate::models::ClientType;

    fn settings(config: DriveConfig) -> EngineSettings {
        EngineSettings::from_config(config).unwrap()
    }

    #[tokio::test]
    async fn test_busy_when_permits_exhausted() {
        let governor = SyncSessionGovernor::new(1, Duration::from_millis(50));
        let settings = settings(DriveConfig::default());
        let session = SyncSession::new("root");

        let first = governor.admit(&session, &settings).await.unwrap();
        assert_eq!(governor.available(), Some(0));
        let err = governor.admit(&session, &settings).await.unwrap_err();
        assert!(matches!(err, DriveError::ServerBusy { limit: 1 }));
        assert!(err.is_retryable());

        assert_eq!(first.complete(), SessionState::Completed);
        assert_eq!(governor.available(), Some(1));
        assert!(governor.admit(&session, &settings).await.is_ok());
    }

    #[tokio::test]
    async fn test_unlimited_governor() {
        let governor = SyncSessionGovernor::new(-1, Duration::from_millis(10));
        assert_eq!(governor.available(), None);
        let settings = settings(DriveConfig::default());
        let mut tickets = Vec::new();
        for _ in 0..10 {
            tickets.push(governor.admit(&SyncSession::new("r"), &settings).await.unwrap());
        }
        tickets[0].start();
        assert_eq!(tickets[0].state(), SessionState::Running);
    }

    #[tokio::test]
    async fn test_api_version_gate() {
        let governor = SyncSessionGovernor::new(2, Duration::from_millis(10));
        let settings = settings(DriveConfig {
            min_api_version: 3,
            ..DriveConfig::default()
        });
        let err = governor
            .admit(&SyncSession::new("r").with_api_version(2), &settings)
            .await
            .unwrap_err();
        assert!(matches!(err, DriveError::ApiVersionUnsupported { actual: 2, minimum: 3 }));
        // 被拒绝的会话不占用许可
        assert_eq!(governor.available(), Some(2));
    }

    #[tokio::test]
    async fn test_client_version_gate() {
        let mut config = DriveConfig::default();
        config.client_versions.insert(
            ClientType::Windows,
            VersionThresholds {
                soft: Some("2.0".parse().unwrap()),
                hard: Some("1.5".parse().unwrap()),
            },
        );
        let settings = settings(config);
        let governor = SyncSessionGovernor::new(-1, Duration::from_millis(10));

        let old = SyncSession::new("r").with_client(ClientType::Windows, Some("1.4.9".parse().unwrap()));
        let err = governor.admit(&old, &settings).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::ClientVersionOutdated);

        let dated = SyncSession::new("r").with_client(ClientType::Windows, Some("1.9".parse().unwrap()));
        let mut ticket = governor.admit(&dated, &settings).await.unwrap();
        let warnings = ticket.take_warnings();
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].is(ErrorCode::ClientVersionUpdateAvailable));

        let other = SyncSession::new("r").with_client(ClientType::Android, Some("0.1".parse().unwrap()));
        assert!(governor.admit(&other, &settings).await.is_ok());
    }
}
