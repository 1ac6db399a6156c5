use fleet_core::{ClusterError, ClusterResult};
use fleet_infrastructure::{CoordinationClient, TreeCache};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::paths::ClusterPaths;

/// 路由表：`mapping/<group>/<task>/<method>/<host>`
///
/// 注册写临时节点，查询走本地树缓存。
pub struct RoutingTable {
    client: CoordinationClient,
    paths: ClusterPaths,
    host: String,
    cache: Arc<TreeCache>,
}

impl RoutingTable {
    pub async fn start(
        client: CoordinationClient,
        paths: ClusterPaths,
        host: impl Into<String>,
    ) -> ClusterResult<Self> {
        client.ensure_path(&paths.mapping_root()).await?;
        let cache = TreeCache::start(client.service().clone(), &paths.mapping_root()).await?;
        Ok(Self {
            client,
            paths,
            host: host.into(),
            cache,
        })
    }

    /// 以本机地址注册一个可调用方法，重复注册只覆盖写
    pub async fn add_mapping(&self, group: &str, task: &str, method: &str) {
        if let Err(e) = self.try_add_mapping(group, task, method).await {
            error!(group, task, method, "注册路由失败: {}", e);
        }
    }

    async fn try_add_mapping(&self, group: &str, task: &str, method: &str) -> ClusterResult<()> {
        self.client
            .ensure_path(&self.paths.mapping(group, task, method))
            .await?;
        self.client
            .write_ephemeral(
                &self.paths.mapping_host(group, task, method, &self.host),
                &[],
            )
            .await?;
        debug!(group, task, method, "路由已注册: {}", self.host);
        Ok(())
    }

    /// 删除指定主机的路由，不存在时只记录警告
    pub async fn remove_mapping(&self, group: &str, task: &str, method: &str, host: &str) {
        let path = self.paths.mapping_host(group, task, method, host);
        match self.client.delete(&path).await {
            Ok(()) => info!(group, task, method, "路由已删除: {}", host),
            Err(ClusterError::NoNode { .. }) => {
                warn!(group, task, method, "待删除的路由不存在: {}", host)
            }
            Err(e) => error!(group, task, method, "删除路由失败: {} - {}", host, e),
        }
    }

    /// 提供该方法的主机列表（本地缓存）
    pub async fn hosts_for(&self, group: &str, task: &str, method: &str) -> Vec<String> {
        self.cache
            .children(&self.paths.mapping(group, task, method))
            .await
    }

    pub async fn close(&self) {
        self.cache.close().await;
    }
}
