use fleet_core::{ClusterError, ClusterResult};
use serde::{de::DeserializeOwned, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use super::{
    join_path, CoordinationService, CreateMode, LeaderLatch, LockGuard, NodeWatch, SessionEvent,
    TreeEvent,
};

/// 协调服务客户端
///
/// 在原始原语之上提供幂等建路径、覆盖写、JSON 读写和叶子遍历。
#[derive(Clone)]
pub struct CoordinationClient {
    service: Arc<dyn CoordinationService>,
    lock_timeout: Duration,
}

impl CoordinationClient {
    pub fn new(service: Arc<dyn CoordinationService>, lock_timeout: Duration) -> Self {
        Self {
            service,
            lock_timeout,
        }
    }

    pub fn service(&self) -> &Arc<dyn CoordinationService> {
        &self.service
    }

    pub fn session_id(&self) -> u64 {
        self.service.session_id()
    }

    pub async fn exists(&self, path: &str) -> ClusterResult<bool> {
        self.service.exists(path).await
    }

    pub async fn create_persistent(&self, path: &str, data: &[u8]) -> ClusterResult<String> {
        self.service
            .create(path, data, CreateMode::Persistent, true)
            .await
    }

    pub async fn create_ephemeral(&self, path: &str, data: &[u8]) -> ClusterResult<String> {
        self.service
            .create(path, data, CreateMode::Ephemeral, true)
            .await
    }

    /// 确保路径存在，其他节点并发创建同一路径时视为成功
    pub async fn ensure_path(&self, path: &str) -> ClusterResult<()> {
        if self.service.exists(path).await? {
            return Ok(());
        }
        match self.create_persistent(path, &[]).await {
            Ok(_) | Err(ClusterError::NodeExists { .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }

    pub async fn read(&self, path: &str) -> ClusterResult<Option<Vec<u8>>> {
        self.service.get_data(path).await
    }

    pub async fn read_json<T: DeserializeOwned>(&self, path: &str) -> ClusterResult<Option<T>> {
        match self.service.get_data(path).await? {
            Some(data) => Ok(Some(serde_json::from_slice(&data)?)),
            None => Ok(None),
        }
    }

    /// 写入持久节点，不存在时创建
    pub async fn write(&self, path: &str, data: &[u8]) -> ClusterResult<()> {
        self.upsert(path, data, CreateMode::Persistent).await
    }

    /// 写入临时节点，不存在时创建（父路径为持久节点）
    pub async fn write_ephemeral(&self, path: &str, data: &[u8]) -> ClusterResult<()> {
        self.upsert(path, data, CreateMode::Ephemeral).await
    }

    pub async fn write_json<T: Serialize>(&self, path: &str, value: &T) -> ClusterResult<()> {
        let data = serde_json::to_vec(value)?;
        self.write(path, &data).await
    }

    pub async fn write_json_ephemeral<T: Serialize>(&self, path: &str, value: &T) -> ClusterResult<()> {
        let data = serde_json::to_vec(value)?;
        self.write_ephemeral(path, &data).await
    }

    async fn upsert(&self, path: &str, data: &[u8], mode: CreateMode) -> ClusterResult<()> {
        if self.service.exists(path).await? {
            match self.service.set_data(path, data).await {
                Ok(()) => return Ok(()),
                // 节点在检查后被删除，继续创建
                Err(ClusterError::NoNode { .. }) => {}
                Err(e) => return Err(e),
            }
        }
        match self.service.create(path, data, mode, true).await {
            Ok(_) => Ok(()),
            Err(ClusterError::NodeExists { .. }) => {
                debug!("节点被并发创建，改为覆盖写: {}", path);
                self.service.set_data(path, data).await
            }
            Err(e) => Err(e),
        }
    }

    pub async fn delete(&self, path: &str) -> ClusterResult<()> {
        self.service.delete(path, false).await
    }

    pub async fn delete_recursive(&self, path: &str) -> ClusterResult<()> {
        self.service.delete(path, true).await
    }

    pub async fn children(&self, path: &str) -> ClusterResult<Vec<String>> {
        self.service.children(path).await
    }

    /// 返回 `path` 之下所有叶子节点（没有子节点的节点）的完整路径，不含 `path` 本身
    ///
    /// 遍历中途被删除的节点会被跳过；其他错误直接返回，不产生残缺的结果。
    pub async fn walk_leaves(&self, path: &str) -> ClusterResult<Vec<String>> {
        let mut leaves = Vec::new();
        let mut pending = vec![path.to_string()];

        while let Some(current) = pending.pop() {
            let children = match self.service.children(&current).await {
                Ok(children) => children,
                Err(ClusterError::NoNode { .. }) => continue,
                Err(e) => {
                    warn!("遍历节点失败: {} - {}", current, e);
                    return Err(e);
                }
            };
            if children.is_empty() {
                if current != path {
                    leaves.push(current);
                }
                continue;
            }
            for child in children {
                pending.push(join_path(&current, &child));
            }
        }

        leaves.sort();
        Ok(leaves)
    }

    /// 获取分布式互斥锁，等待时间使用配置的锁超时
    pub async fn mutex(&self, path: &str) -> ClusterResult<LockGuard> {
        self.service.lock(path, self.lock_timeout).await
    }

    pub fn leader_latch(&self, path: &str, identity: &str) -> Arc<dyn LeaderLatch> {
        self.service.leader_latch(path, identity)
    }

    pub async fn watch_node(&self, path: &str) -> ClusterResult<NodeWatch> {
        self.service.watch_node(path).await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TreeEvent> {
        self.service.subscribe()
    }

    pub fn session_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.service.session_events()
    }

    pub async fn close(&self) {
        self.service.close().await;
    }
}
