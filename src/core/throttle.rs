//! 传输限速：节点级与会话级令牌桶

use crate::config::{limit, DriveConfig};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

struct BucketState {
    tokens: f64,
    updated: Instant,
}

/// 令牌桶，容量等于每秒速率；允许透支，透支部分按速率等待
pub struct TokenBucket {
    rate: u64,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    /// `rate` 为每秒字节数，必须大于 0
    pub fn new(rate: u64) -> Self {
        let rate = rate.max(1);
        Self {
            rate,
            state: Mutex::new(BucketState {
                tokens: rate as f64,
                updated: Instant::now(),
            }),
        }
    }

    pub fn rate(&self) -> u64 {
        self.rate
    }

    fn reserve(&self, amount: u64) -> Duration {
        let mut state = self.state.lock();
        let now = Instant::now();
        let elapsed = now.duration_since(state.updated).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.rate as f64).min(self.rate as f64);
        state.updated = now;
        state.tokens -= amount as f64;
        if state.tokens >= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(-state.tokens / self.rate as f64)
        }
    }

    /// 取得 `bytes` 个令牌，超过容量时分块等待
    pub async fn acquire(&self, bytes: u64) {
        let mut remaining = bytes;
        while remaining > 0 {
            let chunk = remaining.min(self.rate);
            let wait = self.reserve(chunk);
            if !wait.is_zero() {
                tokio::time::sleep(wait).await;
            }
            remaining -= chunk;
        }
    }
}

/// 节点级限速器，所有会话共享同一个节点令牌桶
pub struct BandwidthLimiter {
    node: Option<Arc<TokenBucket>>,
    session_rate: Option<u64>,
}

impl BandwidthLimiter {
    pub fn new(node_rate: Option<u64>, session_rate: Option<u64>) -> Self {
        Self {
            node: node_rate.filter(|r| *r > 0).map(|r| Arc::new(TokenBucket::new(r))),
            session_rate: session_rate.filter(|r| *r > 0),
        }
    }

    pub fn from_config(config: &DriveConfig) -> Self {
        Self::new(
            limit(config.node_bandwidth_limit),
            limit(config.session_bandwidth_limit),
        )
    }

    /// 为一个会话创建限速器
    pub fn session(&self) -> SessionThrottle {
        SessionThrottle {
            node: self.node.clone(),
            session: self.session_rate.map(TokenBucket::new),
        }
    }
}

/// 会话级限速器
pub struct SessionThrottle {
    node: Option<Arc<TokenBucket>>,
    session: Option<TokenBucket>,
}

impl SessionThrottle {
    pub fn is_unlimited(&self) -> bool {
        self.node.is_none() && self.session.is_none()
    }

    pub async fn acquire(&self, bytes: u64) {
        if let Some(session) = &self.session {
            session.acquire(bytes).await;
        }
        if let Some(node) = &self.node {
            node.acquire(bytes).await;
        }
    }
}
