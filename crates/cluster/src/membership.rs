use fleet_core::ClusterResult;
use fleet_infrastructure::CoordinationClient;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::heal::HealLoop;
use crate::paths::ClusterPaths;

/// 集群成员注册
///
/// 以临时节点 `host/<host>` 声明本机存活，节点被删除时自动重建。
pub struct MembershipRegistry {
    client: CoordinationClient,
    paths: ClusterPaths,
    host: String,
    heal: Mutex<Option<HealLoop>>,
}

impl MembershipRegistry {
    pub fn new(client: CoordinationClient, paths: ClusterPaths, host: impl Into<String>) -> Self {
        Self {
            client,
            paths,
            host: host.into(),
            heal: Mutex::new(None),
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub async fn start(&self) -> ClusterResult<()> {
        let mut heal = self.heal.lock().await;
        if heal.as_ref().is_some_and(|running| !running.is_finished()) {
            debug!("成员注册已在运行: {}", self.host);
            return Ok(());
        }

        for root in self.paths.roots() {
            self.client.ensure_path(&root).await?;
        }

        let path = self.paths.host(&self.host);
        self.client.write_ephemeral(&path, &[]).await?;

        let client = self.client.clone();
        let node = path.clone();
        *heal = Some(HealLoop::spawn(self.client.clone(), path, move || {
            let client = client.clone();
            let node = node.clone();
            async move { client.write_ephemeral(&node, &[]).await }
        }));

        info!("主机已加入集群: {}", self.host);
        Ok(())
    }

    /// 当前存活主机列表（时间点快照）
    pub async fn get_all_hosts(&self) -> ClusterResult<Vec<String>> {
        self.client.children(&self.paths.host_root()).await
    }

    pub async fn stop(&self) {
        if let Some(heal) = self.heal.lock().await.take() {
            heal.stop().await;
            info!("成员注册已停止: {}", self.host);
        }
    }
}
