use fleet_core::ClusterResult;
use fleet_infrastructure::{CoordinationService, TreeCache};
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info};

const GROUP_EVENT_CAPACITY: usize = 256;

/// 分组变更通知
///
/// 监视 `group/` 子树，任何任务或文件记录变化时广播所在分组名。
pub struct GroupWatcher {
    cache: Arc<TreeCache>,
    sender: broadcast::Sender<String>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl GroupWatcher {
    pub async fn start(service: Arc<dyn CoordinationService>, group_root: &str) -> ClusterResult<Self> {
        let cache = TreeCache::start(service, group_root).await?;
        let (sender, _) = broadcast::channel(GROUP_EVENT_CAPACITY);

        let mut changes = cache.subscribe();
        let root = group_root.to_string();
        let notify = sender.clone();
        let handle = tokio::spawn(async move {
            loop {
                match changes.recv().await {
                    Ok(event) => {
                        let Some(group) = group_of(&root, &event.path) else {
                            continue;
                        };
                        debug!(group = %group, "分组记录变化: {:?} {}", event.kind, event.path);
                        let _ = notify.send(group);
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        info!("分组变更监视已启动: {}", group_root);
        Ok(Self {
            cache,
            sender,
            task: Mutex::new(Some(handle)),
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.sender.subscribe()
    }

    /// 集群中已有记录的分组
    pub async fn groups(&self) -> Vec<String> {
        self.cache.children(self.cache.root()).await
    }

    pub async fn close(&self) {
        if let Some(handle) = self.task.lock().await.take() {
            handle.abort();
        }
        self.cache.close().await;
    }
}

impl Drop for GroupWatcher {
    fn drop(&mut self) {
        if let Some(handle) = self.task.get_mut().take() {
            handle.abort();
        }
    }
}

fn group_of(root: &str, path: &str) -> Option<String> {
    let rest = path.strip_prefix(root)?.strip_prefix('/')?;
    rest.split('/')
        .next()
        .filter(|name| !name.is_empty())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_infrastructure::{CoordinationClient, MemoryTree};
    use std::time::Duration;

    #[test]
    fn test_group_of() {
        assert_eq!(
            group_of("/fleet/group", "/fleet/group/billing/file/lib/a.jar").as_deref(),
            Some("billing")
        );
        assert_eq!(group_of("/fleet/group", "/fleet/group").as_deref(), None);
        assert_eq!(group_of("/fleet/group", "/fleet/groups/x").as_deref(), None);
    }

    #[tokio::test]
    async fn test_changes_report_group_name() {
        let tree = MemoryTree::new();
        let session: Arc<dyn CoordinationService> = Arc::new(tree.connect().await);
        let client = CoordinationClient::new(session.clone(), Duration::from_secs(1));
        client.ensure_path("/fleet/group").await.unwrap();

        let watcher = GroupWatcher::start(session, "/fleet/group").await.unwrap();
        let mut events = watcher.subscribe();
        client.write("/fleet/group/billing/Invoice", b"{}").await.unwrap();

        let group = tokio::time::timeout(Duration::from_secs(1), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(group, "billing");
        watcher.close().await;
    }
}
