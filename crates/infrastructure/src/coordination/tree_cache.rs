use fleet_core::ClusterResult;
use serde::de::DeserializeOwned;
use std::collections::BTreeMap;
use std::marker::PhantomData;
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{join_path, CoordinationService, NodeEventKind, TreeEvent};

const CACHE_EVENT_CAPACITY: usize = 256;

fn in_scope(root: &str, path: &str) -> bool {
    path == root || (path.starts_with(root) && path[root.len()..].starts_with('/'))
}

/// 协调树子树的本地镜像
///
/// 启动时加载整棵子树，之后根据变更流增量更新；变更流落后时整体重载。
/// 读操作完全在本地完成。丢弃或关闭时停止后台更新任务。
pub struct TreeCache {
    root: String,
    nodes: Arc<RwLock<BTreeMap<String, Vec<u8>>>>,
    events: broadcast::Sender<TreeEvent>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl TreeCache {
    pub async fn start(service: Arc<dyn CoordinationService>, root: &str) -> ClusterResult<Arc<Self>> {
        // 先订阅，加载期间的变更不会丢失
        let mut updates = service.subscribe();
        let (events, _) = broadcast::channel(CACHE_EVENT_CAPACITY);
        let nodes = Arc::new(RwLock::new(BTreeMap::new()));
        let root = root.to_string();
        Self::reload(service.as_ref(), &root, &nodes).await?;

        let worker_root = root.clone();
        let worker_nodes = Arc::clone(&nodes);
        let worker_events = events.clone();
        let handle = tokio::spawn(async move {
            loop {
                match updates.recv().await {
                    Ok(event) => {
                        if in_scope(&worker_root, &event.path) {
                            Self::apply(&worker_nodes, &worker_events, event).await;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("树缓存落后 {} 条变更，重新加载: {}", skipped, worker_root);
                        if let Err(e) =
                            Self::reload(service.as_ref(), &worker_root, &worker_nodes).await
                        {
                            warn!("树缓存重新加载失败: {} - {}", worker_root, e);
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        info!("树缓存已启动: {}", root);
        Ok(Arc::new(Self {
            root,
            nodes,
            events,
            task: Mutex::new(Some(handle)),
        }))
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    async fn reload(
        service: &dyn CoordinationService,
        root: &str,
        nodes: &RwLock<BTreeMap<String, Vec<u8>>>,
    ) -> ClusterResult<()> {
        let mut loaded = BTreeMap::new();
        let mut pending = vec![root.to_string()];
        while let Some(path) = pending.pop() {
            let Some(data) = service.get_data(&path).await? else {
                continue;
            };
            let children = match service.children(&path).await {
                Ok(children) => children,
                Err(e) if e.is_node_state() => Vec::new(),
                Err(e) => return Err(e),
            };
            for child in children {
                pending.push(join_path(&path, &child));
            }
            loaded.insert(path, data);
        }
        debug!("树缓存加载 {} 个节点: {}", loaded.len(), root);
        *nodes.write().await = loaded;
        Ok(())
    }

    async fn apply(
        nodes: &RwLock<BTreeMap<String, Vec<u8>>>,
        events: &broadcast::Sender<TreeEvent>,
        event: TreeEvent,
    ) {
        {
            let mut nodes = nodes.write().await;
            match event.kind {
                NodeEventKind::Created | NodeEventKind::DataChanged => {
                    nodes.insert(event.path.clone(), event.data.clone().unwrap_or_default());
                }
                NodeEventKind::Deleted => {
                    let prefix = format!("{}/", event.path);
                    nodes.retain(|path, _| path != &event.path && !path.starts_with(&prefix));
                }
            }
        }
        let _ = events.send(event);
    }

    pub async fn get(&self, path: &str) -> Option<Vec<u8>> {
        self.nodes.read().await.get(path).cloned()
    }

    /// 直接子节点名称，已排序
    pub async fn children(&self, path: &str) -> Vec<String> {
        let prefix = if path == "/" {
            "/".to_string()
        } else {
            format!("{path}/")
        };
        let nodes = self.nodes.read().await;
        nodes
            .range(prefix.clone()..)
            .take_while(|(key, _)| key.starts_with(&prefix))
            .filter_map(|(key, _)| {
                let rest = &key[prefix.len()..];
                (!rest.is_empty() && !rest.contains('/')).then(|| rest.to_string())
            })
            .collect()
    }

    /// 已应用到缓存的变更
    pub fn subscribe(&self) -> broadcast::Receiver<TreeEvent> {
        self.events.subscribe()
    }

    pub async fn close(&self) {
        if let Some(handle) = self.task.lock().await.take() {
            handle.abort();
        }
        self.nodes.write().await.clear();
        info!("树缓存已关闭: {}", self.root);
    }
}

impl Drop for TreeCache {
    fn drop(&mut self) {
        if let Some(handle) = self.task.get_mut().take() {
            handle.abort();
        }
    }
}

/// 子树根下直接子节点的类型化视图，节点数据为 JSON
pub struct NodeMap<T> {
    cache: Arc<TreeCache>,
    _marker: PhantomData<fn() -> T>,
}

impl<T: DeserializeOwned> NodeMap<T> {
    pub async fn start(service: Arc<dyn CoordinationService>, root: &str) -> ClusterResult<Self> {
        Ok(Self {
            cache: TreeCache::start(service, root).await?,
            _marker: PhantomData,
        })
    }

    pub fn cache(&self) -> &Arc<TreeCache> {
        &self.cache
    }

    pub async fn get(&self, name: &str) -> Option<T> {
        let data = self.cache.get(&join_path(self.cache.root(), name)).await?;
        self.decode(name, &data)
    }

    pub async fn entries(&self) -> Vec<(String, T)> {
        let mut entries = Vec::new();
        for name in self.cache.children(self.cache.root()).await {
            if let Some(value) = self.get(&name).await {
                entries.push((name, value));
            }
        }
        entries
    }

    fn decode(&self, name: &str, data: &[u8]) -> Option<T> {
        match serde_json::from_slice(data) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!("节点数据无法解析，忽略: {}/{} - {}", self.cache.root(), name, e);
                None
            }
        }
    }

    pub async fn close(&self) {
        self.cache.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::{CoordinationClient, MemoryTree};
    use serde::Serialize;
    use std::time::Duration;

    #[derive(Debug, Serialize, serde::Deserialize, PartialEq)]
    struct Entry {
        value: u32,
    }

    async fn wait_until<F, Fut>(mut check: F)
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        for _ in 0..100 {
            if check().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_cache_tracks_changes() {
        let tree = MemoryTree::new();
        let session: Arc<dyn CoordinationService> = Arc::new(tree.connect().await);
        let client = CoordinationClient::new(session.clone(), Duration::from_secs(1));
        client.write("/fleet/mapping/billing/Invoice/run/h1", b"").await.unwrap();

        let cache = TreeCache::start(session.clone(), "/fleet/mapping").await.unwrap();
        assert_eq!(
            cache.children("/fleet/mapping/billing/Invoice/run").await,
            vec!["h1".to_string()]
        );

        let view = &cache;
        client.write("/fleet/mapping/billing/Invoice/run/h2", b"").await.unwrap();
        wait_until(move || async move {
            view.children("/fleet/mapping/billing/Invoice/run").await.len() == 2
        })
        .await;

        client.delete_recursive("/fleet/mapping/billing").await.unwrap();
        wait_until(move || async move { view.children("/fleet/mapping").await.is_empty() }).await;
        assert!(cache.get("/fleet/mapping/billing/Invoice").await.is_none());

        // 范围外的变更不进入缓存
        client.write("/fleet/mappingx", b"").await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(cache.get("/fleet/mappingx").await.is_none());
        cache.close().await;
    }

    #[tokio::test]
    async fn test_node_map_skips_bad_payloads() {
        let tree = MemoryTree::new();
        let session: Arc<dyn CoordinationService> = Arc::new(tree.connect().await);
        let client = CoordinationClient::new(session.clone(), Duration::from_secs(1));
        client.write_json("/fleet/token/a", &Entry { value: 1 }).await.unwrap();
        client.write("/fleet/token/b", b"not json").await.unwrap();

        let map: NodeMap<Entry> = NodeMap::start(session, "/fleet/token").await.unwrap();
        assert_eq!(map.get("a").await, Some(Entry { value: 1 }));
        assert_eq!(map.get("b").await, None);
        assert_eq!(map.entries().await.len(), 1);

        client.write_json("/fleet/token/c", &Entry { value: 3 }).await.unwrap();
        let view = &map;
        wait_until(move || async move { view.entries().await.len() == 2 }).await;
        map.close().await;
    }
}
