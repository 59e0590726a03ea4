//! 存储变更通知，供长轮询的客户端等待下一次同步时机

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::debug;

const CHANNEL_CAPACITY: usize = 256;

/// 存储层变更事件
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum StorageEvent {
    #[serde(rename_all = "camelCase")]
    FileChanged {
        root: String,
        folder_id: String,
        path: String,
        file_id: String,
    },
    #[serde(rename_all = "camelCase")]
    FolderChanged {
        root: String,
        folder_id: String,
        path: String,
    },
}

impl StorageEvent {
    pub fn root(&self) -> &str {
        match self {
            StorageEvent::FileChanged { root, .. } | StorageEvent::FolderChanged { root, .. } => root,
        }
    }

    pub fn path(&self) -> &str {
        match self {
            StorageEvent::FileChanged { path, .. } | StorageEvent::FolderChanged { path, .. } => path,
        }
    }
}

/// 按根目录分发的变更通知
///
/// 只为有订阅者的根目录保留通道，最后一个订阅者离开后通道随之移除。
#[derive(Default)]
pub struct ChangeNotifier {
    channels: Mutex<HashMap<String, broadcast::Sender<StorageEvent>>>,
}

impl ChangeNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// 发布事件，返回收到事件的订阅者数量；没有订阅者时直接丢弃
    pub fn publish(&self, event: StorageEvent) -> usize {
        let mut channels = self.channels.lock();
        let Some(sender) = channels.get(event.root()) else {
            return 0;
        };
        let root = event.root().to_string();
        match sender.send(event) {
            Ok(receivers) => receivers,
            Err(_) => {
                channels.remove(&root);
                0
            }
        }
    }

    pub fn subscribe(&self, root: &str) -> broadcast::Receiver<StorageEvent> {
        self.channels
            .lock()
            .entry(root.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    /// 移除已没有订阅者的通道
    fn prune(&self, root: &str) {
        let mut channels = self.channels.lock();
        if channels.get(root).is_some_and(|s| s.receiver_count() == 0) {
            channels.remove(root);
        }
    }

    /// 等待根目录下的下一次变更，超时返回 None
    pub async fn wait_for_change(&self, root: &str, timeout: Duration) -> Option<StorageEvent> {
        let event = {
            let mut receiver = self.subscribe(root);
            let wait = async {
                loop {
                    match receiver.recv().await {
                        Ok(event) => return Some(event),
                        Err(RecvError::Lagged(skipped)) => {
                            debug!("变更通知积压，跳过 {} 条", skipped);
                        }
                        Err(RecvError::Closed) => return None,
                    }
                }
            };
            let event = tokio::time::timeout(timeout, wait).await.ok().flatten();
            event
        };
        self.prune(root);
        event
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn folder_event(root: &str) -> StorageEvent {
        StorageEvent::FolderChanged {
            root: root.into(),
            folder_id: "7".into(),
            path: "/docs".into(),
        }
    }

    #[tokio::test]
    async fn test_wait_receives_event_for_root() {
        let notifier = Arc::new(ChangeNotifier::new());
        let waiter = {
            let notifier = Arc::clone(&notifier);
            tokio::spawn(async move { notifier.wait_for_change("r1", Duration::from_secs(5)).await })
        };
        // 等待订阅建立
        while !notifier.channels.lock().contains_key("r1") {
            tokio::task::yield_now().await;
        }
        assert_eq!(notifier.publish(folder_event("r2")), 0);
        assert_eq!(notifier.publish(folder_event("r1")), 1);
        assert_eq!(waiter.await.unwrap(), Some(folder_event("r1")));
    }

    #[tokio::test]
    async fn test_wait_times_out() {
        let notifier = ChangeNotifier::new();
        assert_eq!(notifier.wait_for_change("r", Duration::from_millis(20)).await, None);
        assert!(notifier.channels.lock().is_empty());
    }

    #[tokio::test]
    async fn test_channels_only_live_while_subscribed() {
        let notifier = ChangeNotifier::new();
        for i in 0..100 {
            assert_eq!(notifier.publish(folder_event(&format!("root-{}", i))), 0);
        }
        assert!(notifier.channels.lock().is_empty());

        let receiver = notifier.subscribe("r");
        assert_eq!(notifier.channels.lock().len(), 1);
        drop(receiver);
        assert_eq!(notifier.publish(folder_event("r")), 0);
        assert!(notifier.channels.lock().is_empty());

        let mut first = notifier.subscribe("r");
        let waiter = notifier.wait_for_change("r", Duration::from_millis(20)).await;
        assert_eq!(waiter, None);
        // 仍有订阅者时通道保留
        assert_eq!(notifier.publish(folder_event("r")), 1);
        assert_eq!(first.recv().await.unwrap(), folder_event("r"));
    }

    #[test]
    fn test_event_serialization() {
        let json = serde_json::to_value(folder_event("r")).unwrap();
        assert_eq!(json["type"], "folderChanged");
        assert_eq!(json["folderId"], "7");
    }
}
