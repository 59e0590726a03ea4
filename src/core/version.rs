//! 客户端版本解析、比较与最低版本门禁

use crate::error::DriveError;
use crate::models::ClientType;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

/// 点分数字版本号，例如 `2.1.0`
///
/// 比较时较短的一方补零，因此 `1.2` 与 `1.2.0` 相等且哈希一致。
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ClientVersion {
    raw: String,
    components: Vec<u64>,
}

impl ClientVersion {
    pub fn components(&self) -> &[u64] {
        &self.components
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// 去掉末尾零后的分量，用于哈希
    fn significant(&self) -> &[u64] {
        let len = self
            .components
            .iter()
            .rposition(|c| *c != 0)
            .map(|idx| idx + 1)
            .unwrap_or(0);
        &self.components[..len]
    }
}

impl FromStr for ClientVersion {
    type Err = DriveError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = s.trim();
        let components = raw
            .split('.')
            .map(|part| {
                if part.is_empty() || !part.bytes().all(|b| b.is_ascii_digit()) {
                    return Err(DriveError::InvalidVersion(s.to_string()));
                }
                part.parse::<u64>()
                    .map_err(|_| DriveError::InvalidVersion(s.to_string()))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            raw: raw.to_string(),
            components,
        })
    }
}

impl TryFrom<String> for ClientVersion {
    type Error = DriveError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ClientVersion> for String {
    fn from(value: ClientVersion) -> Self {
        value.raw
    }
}

impl fmt::Display for ClientVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// 逐分量比较，缺失分量视为 0
pub fn compare(a: &ClientVersion, b: &ClientVersion) -> Ordering {
    let len = a.components.len().max(b.components.len());
    for i in 0..len {
        let x = a.components.get(i).copied().unwrap_or(0);
        let y = b.components.get(i).copied().unwrap_or(0);
        match x.cmp(&y) {
            Ordering::Equal => continue,
            other => return other,
        }
    }
    Ordering::Equal
}

/// `actual` 是否满足最低版本 `minimum`
pub fn satisfies(actual: &ClientVersion, minimum: &ClientVersion) -> bool {
    compare(actual, minimum) != Ordering::Less
}

impl PartialEq for ClientVersion {
    fn eq(&self, other: &Self) -> bool {
        compare(self, other) == Ordering::Equal
    }
}

impl Eq for ClientVersion {}

impl Hash for ClientVersion {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.significant().hash(state);
    }
}

impl PartialOrd for ClientVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ClientVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        compare(self, other)
    }
}

/// 某类客户端的版本阈值
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionThresholds {
    /// 低于该版本时给出升级提示
    #[serde(default)]
    pub soft: Option<ClientVersion>,
    /// 低于该版本时拒绝同步
    #[serde(default)]
    pub hard: Option<ClientVersion>,
}

/// 门禁检查结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateDecision {
    Pass,
    /// 允许同步，但需提示升级
    UpdateAvailable { recommended: ClientVersion },
    /// 拒绝同步
    Blocked { minimum: ClientVersion },
}

/// 按客户端类型检查最低版本
#[derive(Debug, Clone, Default)]
pub struct ClientVersionGate {
    thresholds: HashMap<ClientType, VersionThresholds>,
}

impl ClientVersionGate {
    pub fn new(thresholds: HashMap<ClientType, VersionThresholds>) -> Self {
        Self { thresholds }
    }

    /// 未配置阈值的客户端类型或未上报版本的客户端直接放行
    pub fn check(&self, client_type: ClientType, version: Option<&ClientVersion>) -> GateDecision {
        let (Some(thresholds), Some(version)) = (self.thresholds.get(&client_type), version) else {
            return GateDecision::Pass;
        };

        if let Some(hard) = &thresholds.hard {
            if !satisfies(version, hard) {
                return GateDecision::Blocked {
                    minimum: hard.clone(),
                };
            }
        }
        if let Some(soft) = &thresholds.soft {
            if !satisfies(version, soft) {
                return GateDecision::UpdateAvailable {
                    recommended: soft.clone(),
                };
            }
        }
        GateDecision::Pass
    }
}
