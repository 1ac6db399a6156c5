#![allow(dead_code)]

use fleet_cluster::test_utils::{CountingHasher, MockCodeRunner, MockTaskStore};
use fleet_cluster::{ClusterPaths, GroupSyncEngine, HostGroupPublisher, LocalGroupFiles, RoutingTable};
use fleet_core::GroupsConfig;
use fleet_domain::Task;
use fleet_infrastructure::{CoordinationClient, CoordinationService, MemoryTree};
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

pub use fleet_cluster::test_utils::wait_until;

pub const NAMESPACE: &str = "/fleet";

/// 一台在共享内存树上运行同步引擎的主机
pub struct TestHost {
    pub host: String,
    pub dir: TempDir,
    pub client: CoordinationClient,
    pub paths: ClusterPaths,
    pub store: MockTaskStore,
    pub hasher: Arc<CountingHasher>,
    pub runner: Arc<MockCodeRunner>,
    pub publisher: Arc<HostGroupPublisher>,
    pub routing: Arc<RoutingTable>,
    pub engine: GroupSyncEngine,
}

impl TestHost {
    pub async fn start(tree: &Arc<MemoryTree>, host: &str, tasks: Vec<Task>) -> Self {
        Self::start_with_runner(tree, host, tasks, MockCodeRunner::new()).await
    }

    pub async fn start_with_runner(
        tree: &Arc<MemoryTree>,
        host: &str,
        tasks: Vec<Task>,
        runner: MockCodeRunner,
    ) -> Self {
        let session = Arc::new(tree.connect().await);
        Self::start_on(session, host, tasks, runner, Duration::from_secs(2)).await
    }

    /// 在指定会话上启动，可以包装故障注入或缩短锁超时
    pub async fn start_on(
        session: Arc<dyn CoordinationService>,
        host: &str,
        tasks: Vec<Task>,
        runner: MockCodeRunner,
        lock_timeout: Duration,
    ) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let client = CoordinationClient::new(session, lock_timeout);
        let paths = ClusterPaths::new(NAMESPACE);
        for root in paths.roots() {
            client.ensure_path(&root).await.unwrap();
        }

        let store = MockTaskStore::with_tasks(tasks);
        let hasher = Arc::new(CountingHasher::default());
        let runner = Arc::new(runner);
        let files = LocalGroupFiles::new(&GroupsConfig {
            root_dir: dir.path().to_path_buf(),
            descriptor_file: "manifest.json".to_string(),
            ..GroupsConfig::default()
        })
        .with_hasher(hasher.clone());
        let publisher = Arc::new(
            HostGroupPublisher::start(client.clone(), paths.clone(), host, false)
                .await
                .unwrap(),
        );
        let routing = Arc::new(
            RoutingTable::start(client.clone(), paths.clone(), host)
                .await
                .unwrap(),
        );
        let engine = GroupSyncEngine::new(
            client.clone(),
            paths.clone(),
            Arc::new(store.clone()),
            runner.clone(),
            files,
            publisher.clone(),
            routing.clone(),
        );

        Self {
            host: host.to_string(),
            dir,
            client,
            paths,
            store,
            hasher,
            runner,
            publisher,
            routing,
            engine,
        }
    }

    pub fn group_dir(&self, group: &str) -> PathBuf {
        self.dir.path().join(group)
    }

    pub fn write_file(&self, group: &str, relative: &str, content: &str) {
        let path = self.group_dir(group).join(relative.trim_start_matches('/'));
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    pub fn remove_file(&self, group: &str, relative: &str) {
        fs::remove_file(self.group_dir(group).join(relative.trim_start_matches('/'))).unwrap();
    }

    pub async fn close(&self) {
        self.publisher.close().await;
        self.routing.close().await;
        self.client.close().await;
    }
}

pub fn task(group: &str, name: &str, code: &str) -> Task {
    Task::new(group, name, code)
}
