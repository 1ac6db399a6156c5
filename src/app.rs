use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use fleet_cluster::SharedSpace;
use fleet_core::AppConfig;
use fleet_domain::{CodeRunner, MasterJob, TaskStore};
use fleet_infrastructure::{CoordinationConnector, MemoryConnector, MemoryTree, SqliteTaskStore};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::runtime::{EntryPointRunner, LoggingMasterJob};

/// 主应用程序
pub struct Application {
    config: AppConfig,
    store: Arc<dyn TaskStore>,
    space: Arc<SharedSpace>,
}

impl Application {
    /// 使用嵌入式协调树和 SQLite 任务存储创建应用
    pub async fn new(config: AppConfig) -> Result<Self> {
        prepare_store_dir(&config.store.url)?;
        let store = SqliteTaskStore::new_embedded(&config.store.url, config.store.max_connections)
            .await
            .with_context(|| format!("打开任务存储失败: {}", config.store.url))?;
        let connector = Arc::new(MemoryConnector::new(MemoryTree::new()));

        Ok(Self::with_parts(
            config,
            connector,
            Arc::new(store),
            Arc::new(EntryPointRunner::default()),
            Arc::new(LoggingMasterJob),
        ))
    }

    pub fn with_parts(
        config: AppConfig,
        connector: Arc<dyn CoordinationConnector>,
        store: Arc<dyn TaskStore>,
        runner: Arc<dyn CodeRunner>,
        job: Arc<dyn MasterJob>,
    ) -> Self {
        info!("初始化应用程序: {}", config.node.host_port());
        let space = Arc::new(SharedSpace::new(
            config.clone(),
            connector,
            Arc::clone(&store),
            runner,
            job,
        ));
        Self {
            config,
            store,
            space,
        }
    }

    pub fn space(&self) -> &Arc<SharedSpace> {
        &self.space
    }

    pub fn store(&self) -> &Arc<dyn TaskStore> {
        &self.store
    }

    /// 加入集群并运行到收到关闭信号，退出前释放全部集群资源
    pub async fn run(&self, mut shutdown_rx: broadcast::Receiver<()>) -> Result<()> {
        self.space.init().await.context("加入集群失败")?;
        let mut group_events = self
            .space
            .group_events()
            .await
            .context("订阅分组变更失败")?;

        let mut resync = self.config.groups.sync_interval().map(|period| {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            interval
        });
        if let Some(interval) = resync.as_mut() {
            // 第一次 tick 立即完成，启动时已经同步过
            interval.tick().await;
        }

        info!("应用程序已启动: {}", self.space.host());
        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!("收到关闭信号，退出集群");
                    break;
                }
                changed = group_events.recv() => match changed {
                    Ok(group) => {
                        debug!(group = %group, master = self.space.is_master(), "集群分组记录变化");
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("分组变更通知积压，丢弃 {} 条", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        // 会话重建后分组监视器被替换，重新订阅
                        match self.space.group_events().await {
                            Ok(receiver) => group_events = receiver,
                            Err(e) => {
                                debug!("会话重建中，稍后重新订阅分组变更: {}", e);
                                tokio::time::sleep(self.config.coordination.reconnect_interval()).await;
                            }
                        }
                    }
                },
                _ = tick(&mut resync) => self.resync().await,
            }
        }

        self.space.release().await;
        info!("应用程序已停止");
        Ok(())
    }

    async fn resync(&self) {
        match self.space.engine().await {
            Ok(engine) => match engine.join_cluster_all().await {
                Ok(results) => {
                    let diverged = results.values().filter(|diffs| !diffs.is_empty()).count();
                    info!(groups = results.len(), diverged, "定期同步完成");
                }
                Err(e) => error!("定期同步失败: {}", e),
            },
            Err(e) => warn!("会话重建中，跳过本轮定期同步: {}", e),
        }
    }
}

async fn tick(interval: &mut Option<tokio::time::Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

/// 文件型 SQLite 数据库所在目录不存在时先创建
fn prepare_store_dir(url: &str) -> Result<()> {
    if url.contains(":memory:") {
        return Ok(());
    }
    let path = url
        .trim_start_matches("sqlite:")
        .trim_start_matches("//")
        .split('?')
        .next()
        .unwrap_or_default();
    if let Some(parent) = Path::new(path).parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("创建数据目录失败: {}", parent.display()))?;
    }
    Ok(())
}
