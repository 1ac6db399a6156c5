use fleet_core::ClusterResult;
use fleet_domain::HostGroup;
use fleet_infrastructure::{CoordinationClient, NodeMap};
use metrics::counter;
use rand::seq::IndexedRandom;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};

use crate::heal::HealLoop;
use crate::paths::ClusterPaths;

/// HostGroup 状态发布
///
/// 本机在每个分组上的同步状态写为临时节点 `host_group/<host>_<group>`，
/// 节点被删除时用最近一次发布的值重建。
pub struct HostGroupPublisher {
    client: CoordinationClient,
    paths: ClusterPaths,
    host: String,
    ssl: bool,
    published: Arc<RwLock<HashMap<String, HostGroup>>>,
    heal_loops: Mutex<HashMap<String, HealLoop>>,
    records: NodeMap<HostGroup>,
}

impl HostGroupPublisher {
    pub async fn start(
        client: CoordinationClient,
        paths: ClusterPaths,
        host: impl Into<String>,
        ssl: bool,
    ) -> ClusterResult<Self> {
        client.ensure_path(&paths.host_group_root()).await?;
        let records = NodeMap::start(client.service().clone(), &paths.host_group_root()).await?;
        Ok(Self {
            client,
            paths,
            host: host.into(),
            ssl,
            published: Arc::new(RwLock::new(HashMap::new())),
            heal_loops: Mutex::new(HashMap::new()),
            records,
        })
    }

    /// 根据差异数发布本机在分组上的状态
    pub async fn publish(&self, group: &str, diff_count: usize) -> ClusterResult<HostGroup> {
        let record = HostGroup::from_diff_count(diff_count, self.ssl);
        let path = self.paths.host_group(&self.host, group);

        // 写入成功后才记为已发布，失败时保留上一次的结论
        self.client.write_json_ephemeral(&path, &record).await?;
        self.published
            .write()
            .await
            .insert(group.to_string(), record);
        counter!("fleet_host_group_published_total").increment(1);
        info!(
            group,
            current = record.current,
            weight = record.weight,
            "发布HostGroup状态"
        );

        self.ensure_heal_loop(group, path).await;
        Ok(record)
    }

    async fn ensure_heal_loop(&self, group: &str, path: String) {
        let mut loops = self.heal_loops.lock().await;
        if loops.get(group).is_some_and(|running| !running.is_finished()) {
            return;
        }

        let client = self.client.clone();
        let published = Arc::clone(&self.published);
        let owned_group = group.to_string();
        let node = path.clone();
        let heal = HealLoop::spawn(self.client.clone(), path, move || {
            let client = client.clone();
            let published = Arc::clone(&published);
            let group = owned_group.clone();
            let node = node.clone();
            async move {
                let last = published.read().await.get(&group).copied();
                match last {
                    Some(record) => client.write_json_ephemeral(&node, &record).await,
                    None => Ok(()),
                }
            }
        });
        loops.insert(group.to_string(), heal);
        debug!(group, "HostGroup自愈循环已启动");
    }

    /// 本机最近一次发布的状态
    pub async fn last_published(&self, group: &str) -> Option<HostGroup> {
        self.published.read().await.get(group).copied()
    }

    /// 任意主机在分组上的状态（本地缓存）
    pub async fn get(&self, host: &str, group: &str) -> Option<HostGroup> {
        self.records
            .get(&ClusterPaths::host_group_name(host, group))
            .await
    }

    /// 在分组上处于同步状态的所有主机
    pub async fn get_current_host_ports(&self, group: &str) -> Vec<String> {
        self.records
            .entries()
            .await
            .into_iter()
            .filter(|(_, record)| record.current)
            .filter_map(|(name, _)| {
                ClusterPaths::split_host_group_name(&name)
                    .filter(|(_, g)| *g == group)
                    .map(|(host, _)| host.to_string())
            })
            .collect()
    }

    /// 在同步主机中随机选择一个
    pub async fn get_random_current_host_port(&self, group: &str) -> Option<String> {
        let hosts = self.get_current_host_ports(group).await;
        hosts.choose(&mut rand::rng()).cloned()
    }

    pub async fn close(&self) {
        let loops: Vec<HealLoop> = self
            .heal_loops
            .lock()
            .await
            .drain()
            .map(|(_, heal)| heal)
            .collect();
        for heal in loops {
            heal.stop().await;
        }
        self.records.close().await;
    }
}
