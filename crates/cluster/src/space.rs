use chrono::Utc;
use fleet_core::{AppConfig, ClusterError, ClusterResult};
use fleet_domain::{CodeRunner, MasterJob, TaskStore, Token};
use fleet_infrastructure::{CoordinationClient, CoordinationConnector, NodeMap, SessionEvent};
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::counters::TaskCounters;
use crate::host_group::HostGroupPublisher;
use crate::leader::{LeaderElectionController, MasterState};
use crate::membership::MembershipRegistry;
use crate::paths::ClusterPaths;
use crate::routing::RoutingTable;
use crate::sync::{GroupSyncEngine, GroupWatcher, LocalGroupFiles};

/// 一个协调会话上启动的全部组件，会话丢失后整体丢弃重建
pub struct Components {
    client: CoordinationClient,
    leader: Arc<LeaderElectionController>,
    membership: Arc<MembershipRegistry>,
    routing: Arc<RoutingTable>,
    publisher: Arc<HostGroupPublisher>,
    tokens: NodeMap<Token>,
    group_watcher: GroupWatcher,
    engine: Arc<GroupSyncEngine>,
}

impl Components {
    pub fn client(&self) -> &CoordinationClient {
        &self.client
    }

    pub fn leader(&self) -> &Arc<LeaderElectionController> {
        &self.leader
    }

    pub fn membership(&self) -> &Arc<MembershipRegistry> {
        &self.membership
    }

    pub fn routing(&self) -> &Arc<RoutingTable> {
        &self.routing
    }

    pub fn publisher(&self) -> &Arc<HostGroupPublisher> {
        &self.publisher
    }

    pub fn engine(&self) -> &Arc<GroupSyncEngine> {
        &self.engine
    }

    pub fn group_watcher(&self) -> &GroupWatcher {
        &self.group_watcher
    }

    async fn release(&self) {
        self.publisher.close().await;
        self.membership.stop().await;
        if let Err(e) = self.leader.stop().await {
            warn!("退出主节点选举失败: {}", e);
        }
        self.routing.close().await;
        self.tokens.close().await;
        self.group_watcher.close().await;
        self.client.close().await;
    }
}

/// 会话建立后、同步前启动的组件
struct Caches {
    routing: Arc<RoutingTable>,
    publisher: Arc<HostGroupPublisher>,
    tokens: NodeMap<Token>,
    group_watcher: GroupWatcher,
}

struct SpaceInner {
    config: AppConfig,
    paths: ClusterPaths,
    host: String,
    connector: Arc<dyn CoordinationConnector>,
    store: Arc<dyn TaskStore>,
    runner: Arc<dyn CodeRunner>,
    job: Arc<dyn MasterJob>,
    master: MasterState,
    counters: Arc<TaskCounters>,
    components: RwLock<Option<Arc<Components>>>,
}

/// 集群共享空间
///
/// 组合成员注册、主节点选举、路由表、HostGroup 发布和分组同步。
/// 会话丢失时释放全部组件并按配置的间隔重试初始化，直到成功。
/// 主节点标志和任务计数跨会话保留。
pub struct SharedSpace {
    inner: Arc<SpaceInner>,
    monitor: Mutex<Option<JoinHandle<()>>>,
}

impl SharedSpace {
    pub fn new(
        config: AppConfig,
        connector: Arc<dyn CoordinationConnector>,
        store: Arc<dyn TaskStore>,
        runner: Arc<dyn CodeRunner>,
        job: Arc<dyn MasterJob>,
    ) -> Self {
        let paths = ClusterPaths::new(config.coordination.namespace.clone());
        let host = config.node.host_port();
        Self {
            inner: Arc::new(SpaceInner {
                config,
                paths,
                host,
                connector,
                store,
                runner,
                job,
                master: MasterState::new(),
                counters: Arc::new(TaskCounters::new()),
                components: RwLock::new(None),
            }),
            monitor: Mutex::new(None),
        }
    }

    /// 建立会话、启动全部组件并同步所有分组，然后开始监视会话状态
    pub async fn init(&self) -> ClusterResult<()> {
        let mut monitor = self.monitor.lock().await;
        if monitor.is_some() {
            debug!("共享空间已初始化: {}", self.inner.host);
            return Ok(());
        }

        let events = self.inner.init_once().await?;
        *monitor = Some(tokio::spawn(Self::monitor(Arc::clone(&self.inner), events)));
        info!("共享空间初始化完成: {}", self.inner.host);
        Ok(())
    }

    /// 停止会话监视并释放全部组件
    pub async fn release(&self) {
        if let Some(handle) = self.monitor.lock().await.take() {
            handle.abort();
            let _ = handle.await;
        }
        self.inner.release_components().await;
        info!("共享空间已释放: {}", self.inner.host);
    }

    async fn monitor(inner: Arc<SpaceInner>, mut events: broadcast::Receiver<SessionEvent>) {
        loop {
            match events.recv().await {
                Ok(SessionEvent::Lost) => {
                    error!("协调会话丢失，释放全部组件并重新初始化: {}", inner.host);
                    inner.release_components().await;
                    events = inner.reinit_until_success().await;
                }
                Ok(SessionEvent::Suspended) => warn!("协调会话连接中断: {}", inner.host),
                Ok(SessionEvent::Reconnected) => info!("协调会话已恢复连接: {}", inner.host),
                Ok(SessionEvent::Connected) => debug!("协调会话已连接: {}", inner.host),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("会话事件积压，丢弃 {} 条", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }

    pub fn host(&self) -> &str {
        &self.inner.host
    }

    pub fn paths(&self) -> &ClusterPaths {
        &self.inner.paths
    }

    pub fn config(&self) -> &AppConfig {
        &self.inner.config
    }

    pub fn master_state(&self) -> &MasterState {
        &self.inner.master
    }

    pub fn is_master(&self) -> bool {
        self.inner.master.is_master()
    }

    pub fn counters(&self) -> &Arc<TaskCounters> {
        &self.inner.counters
    }

    pub async fn is_initialized(&self) -> bool {
        self.inner.components.read().await.is_some()
    }

    /// 当前会话上的组件；会话重建期间返回错误
    pub async fn components(&self) -> ClusterResult<Arc<Components>> {
        self.inner
            .components
            .read()
            .await
            .clone()
            .ok_or_else(|| ClusterError::coordination("共享空间未初始化或正在重建"))
    }

    pub async fn engine(&self) -> ClusterResult<Arc<GroupSyncEngine>> {
        Ok(Arc::clone(self.components().await?.engine()))
    }

    pub async fn routing(&self) -> ClusterResult<Arc<RoutingTable>> {
        Ok(Arc::clone(self.components().await?.routing()))
    }

    pub async fn publisher(&self) -> ClusterResult<Arc<HostGroupPublisher>> {
        Ok(Arc::clone(self.components().await?.publisher()))
    }

    pub async fn membership(&self) -> ClusterResult<Arc<MembershipRegistry>> {
        Ok(Arc::clone(self.components().await?.membership()))
    }

    pub async fn leader(&self) -> ClusterResult<Arc<LeaderElectionController>> {
        Ok(Arc::clone(self.components().await?.leader()))
    }

    /// 分组记录变化通知，值为分组名
    pub async fn group_events(&self) -> ClusterResult<broadcast::Receiver<String>> {
        Ok(self.components().await?.group_watcher().subscribe())
    }

    /// 按ID查询令牌，已过期的令牌视为不存在
    pub async fn get_token(&self, token_id: &str) -> Option<Token> {
        let components = self.components().await.ok()?;
        let token = components.tokens.get(token_id).await?;
        if token.is_expired(Utc::now()) {
            debug!("令牌已过期: {}", token_id);
            return None;
        }
        Some(token)
    }
}

impl Drop for SharedSpace {
    fn drop(&mut self) {
        if let Some(handle) = self.monitor.get_mut().take() {
            handle.abort();
        }
    }
}

impl SpaceInner {
    /// 一次完整的初始化：建立组件、同步全部分组
    ///
    /// 同步时会话丢失会释放已建立的组件并返回错误，单个分组失败只记录日志。
    async fn init_once(&self) -> ClusterResult<broadcast::Receiver<SessionEvent>> {
        let (components, events) = self.connect_components().await?;
        *self.components.write().await = Some(Arc::clone(&components));

        match components.engine().join_cluster_all().await {
            Ok(results) => {
                let diverged = results.values().filter(|diffs| !diffs.is_empty()).count();
                info!(
                    groups = results.len(),
                    diverged, "启动同步完成"
                );
                Ok(events)
            }
            Err(e) if e.is_session_loss() => {
                self.release_components().await;
                Err(e)
            }
            Err(e) => {
                warn!("启动同步未完成，等待下一轮: {}", e);
                Ok(events)
            }
        }
    }

    async fn reinit_until_success(&self) -> broadcast::Receiver<SessionEvent> {
        let interval = self.config.coordination.reconnect_interval();
        let mut attempt: u64 = 0;
        loop {
            attempt += 1;
            match self.init_once().await {
                Ok(events) => {
                    info!(attempt, "共享空间重新初始化完成: {}", self.host);
                    return events;
                }
                Err(e) => {
                    error!(attempt, "共享空间重新初始化失败，{:?}后重试: {}", interval, e);
                    tokio::time::sleep(interval).await;
                }
            }
        }
    }

    async fn connect_components(
        &self,
    ) -> ClusterResult<(Arc<Components>, broadcast::Receiver<SessionEvent>)> {
        let service = self.connector.connect().await?;
        let events = service.session_events();
        let client = CoordinationClient::new(service, self.config.coordination.lock_timeout());

        let leader = Arc::new(LeaderElectionController::new(
            client.clone(),
            self.paths.master(),
            self.host.clone(),
            self.master.clone(),
            Arc::clone(&self.job),
        ));
        let membership = Arc::new(MembershipRegistry::new(
            client.clone(),
            self.paths.clone(),
            self.host.clone(),
        ));

        let caches = match self.start_caches(&client, &leader, &membership).await {
            Ok(caches) => caches,
            Err(e) => {
                membership.stop().await;
                if let Err(stop_error) = leader.stop().await {
                    warn!("退出主节点选举失败: {}", stop_error);
                }
                client.close().await;
                return Err(e);
            }
        };

        let files = LocalGroupFiles::new(&self.config.groups);
        let engine = Arc::new(GroupSyncEngine::new(
            client.clone(),
            self.paths.clone(),
            Arc::clone(&self.store),
            Arc::clone(&self.runner),
            files,
            Arc::clone(&caches.publisher),
            Arc::clone(&caches.routing),
        ));

        let components = Arc::new(Components {
            client,
            leader,
            membership,
            routing: caches.routing,
            publisher: caches.publisher,
            tokens: caches.tokens,
            group_watcher: caches.group_watcher,
            engine,
        });
        Ok((components, events))
    }

    async fn start_caches(
        &self,
        client: &CoordinationClient,
        leader: &LeaderElectionController,
        membership: &MembershipRegistry,
    ) -> ClusterResult<Caches> {
        leader.start().await?;
        membership.start().await?;

        let routing = Arc::new(RoutingTable::start(client.clone(), self.paths.clone(), self.host.clone()).await?);
        let tokens = NodeMap::start(client.service().clone(), &self.paths.token_root()).await?;
        let publisher = Arc::new(
            HostGroupPublisher::start(
                client.clone(),
                self.paths.clone(),
                self.host.clone(),
                self.config.node.ssl,
            )
            .await?,
        );
        let group_watcher = GroupWatcher::start(client.service().clone(), &self.paths.group_root()).await?;

        Ok(Caches {
            routing,
            publisher,
            tokens,
            group_watcher,
        })
    }

    async fn release_components(&self) {
        let Some(components) = self.components.write().await.take() else {
            return;
        };
        components.release().await;
        debug!("会话组件已释放: {}", self.host);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{wait_until, MockCodeRunner, MockTaskStore, RecordingMasterJob};
    use chrono::Duration as ChronoDuration;
    use fleet_domain::Task;
    use fleet_infrastructure::{MemoryConnector, MemoryTree};
    use std::collections::HashMap;

    fn config(root: &std::path::Path) -> AppConfig {
        let mut config = AppConfig::default();
        config.groups.root_dir = root.to_path_buf();
        config.coordination.reconnect_interval_seconds = 0;
        config
    }

    fn space(
        tree: &Arc<MemoryTree>,
        root: &std::path::Path,
        job: Arc<RecordingMasterJob>,
    ) -> SharedSpace {
        let store = MockTaskStore::with_tasks(vec![Task::new("billing", "Invoice", "v1")]);
        SharedSpace::new(
            config(root),
            Arc::new(MemoryConnector::new(Arc::clone(tree))),
            Arc::new(store),
            Arc::new(MockCodeRunner::new()),
            job,
        )
    }

    #[tokio::test]
    async fn test_init_joins_cluster() {
        let dir = tempfile::tempdir().unwrap();
        let tree = MemoryTree::new();
        let job = Arc::new(RecordingMasterJob::default());
        let space = space(&tree, dir.path(), Arc::clone(&job));

        space.init().await.unwrap();
        assert!(space.is_initialized().await);
        let view = &space;
        wait_until(move || async move { view.is_master() }).await;
        assert_eq!(job.starts(), 1);

        let hosts = space.membership().await.unwrap().get_all_hosts().await.unwrap();
        assert_eq!(hosts, vec!["127.0.0.1:9095".to_string()]);

        let publisher = space.publisher().await.unwrap();
        let view = &publisher;
        wait_until(move || async move {
            view
                .get("127.0.0.1:9095", "billing")
                .await
                .is_some_and(|record| record.current)
        })
        .await;

        let routing = space.routing().await.unwrap();
        let view = &routing;
        wait_until(move || async move { !view.hosts_for("billing", "Invoice", "run").await.is_empty() }).await;

        space.release().await;
        assert!(!space.is_initialized().await);
        assert!(!space.is_master());
        assert_eq!(job.stops(), 1);
    }

    #[tokio::test]
    async fn test_reinit_after_session_loss() {
        let dir = tempfile::tempdir().unwrap();
        let tree = MemoryTree::new();
        let job = Arc::new(RecordingMasterJob::default());
        let space = space(&tree, dir.path(), Arc::clone(&job));
        space.init().await.unwrap();

        let first_session = space.components().await.unwrap().client().session_id();
        tree.expire_session(first_session).await;

        let view = &space;
        wait_until(move || async move {
            match view.components().await {
                Ok(components) => components.client().session_id() != first_session,
                Err(_) => false,
            }
        })
        .await;

        let components = space.components().await.unwrap();
        let client = components.client().clone();
        let view = &client;
        wait_until(move || async move {
            view.exists("/fleet/host/127.0.0.1:9095")
                .await
                .unwrap_or(false)
        })
        .await;
        let recorded = &job;
        wait_until(move || async move { recorded.starts() == 2 }).await;
        assert_eq!(job.stops(), 1);
        assert!(space.is_master());

        drop(components);
        space.release().await;
        assert_eq!(job.stops(), 2);
    }

    #[tokio::test]
    async fn test_expired_token_is_hidden() {
        let dir = tempfile::tempdir().unwrap();
        let tree = MemoryTree::new();
        let space = space(&tree, dir.path(), Arc::new(RecordingMasterJob::default()));
        space.init().await.unwrap();

        let client = space.components().await.unwrap().client().clone();
        let live = Token {
            token: "t1".to_string(),
            user: "alice".to_string(),
            expire_at: Utc::now() + ChronoDuration::hours(1),
            params: HashMap::new(),
        };
        let expired = Token {
            token: "t2".to_string(),
            user: "bob".to_string(),
            expire_at: Utc::now() - ChronoDuration::hours(1),
            params: HashMap::new(),
        };
        client.write_json("/fleet/token/t1", &live).await.unwrap();
        client.write_json("/fleet/token/t2", &expired).await.unwrap();

        let view = &space;
        wait_until(move || async move { view.get_token("t1").await.is_some() }).await;
        assert_eq!(space.get_token("t1").await, Some(live));
        assert!(space.get_token("t2").await.is_none());
        assert!(space.get_token("missing").await.is_none());

        space.release().await;
        assert!(space.get_token("t1").await.is_none());
    }
}
