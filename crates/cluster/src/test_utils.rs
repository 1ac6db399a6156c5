//! 测试用的端口实现
//!
//! 内存任务存储、可配置的代码编译器、记录启停次数的主节点作业和计数的文件哈希器，
//! 单元测试和集成测试共用。

use async_trait::async_trait;
use chrono::Utc;
use fleet_core::{ClusterError, ClusterResult};
use fleet_domain::{CodeRunner, Group, MasterJob, Task, TaskStore};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::future::Future;
use std::io;
use std::path::Path;
use fleet_infrastructure::{
    CoordinationService, CreateMode, LeaderLatch, LockGuard, NodeWatch, SessionEvent, TreeEvent,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::sync::{FileHasher, Sha256Hasher};

/// 内存任务存储
#[derive(Debug, Clone, Default)]
pub struct MockTaskStore {
    groups: Arc<Mutex<BTreeMap<String, Group>>>,
    tasks: Arc<Mutex<BTreeMap<(String, String), Task>>>,
    next_id: Arc<Mutex<i64>>,
}

impl MockTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tasks(tasks: Vec<Task>) -> Self {
        let store = Self::new();
        for task in tasks {
            store.insert(task);
        }
        store
    }

    /// 写入任务，所在分组不存在时一并创建
    pub fn insert(&self, mut task: Task) -> Task {
        let mut next_id = self.next_id.lock().unwrap();
        self.groups
            .lock()
            .unwrap()
            .entry(task.group_name.clone())
            .or_insert_with(|| Group::new(task.group_name.clone()));
        let mut tasks = self.tasks.lock().unwrap();
        let key = (task.group_name.clone(), task.name.clone());
        task.id = match tasks.get(&key) {
            Some(existing) => existing.id,
            None => {
                *next_id += 1;
                *next_id
            }
        };
        task.updated_at = Utc::now();
        tasks.insert(key, task.clone());
        task
    }

    pub fn add_group(&self, name: &str) {
        self.groups
            .lock()
            .unwrap()
            .entry(name.to_string())
            .or_insert_with(|| Group::new(name));
    }

    pub fn remove_task(&self, group: &str, name: &str) {
        self.tasks
            .lock()
            .unwrap()
            .remove(&(group.to_string(), name.to_string()));
    }
}

#[async_trait]
impl TaskStore for MockTaskStore {
    async fn list_groups(&self) -> ClusterResult<Vec<Group>> {
        Ok(self.groups.lock().unwrap().values().cloned().collect())
    }

    async fn find_tasks_by_group(&self, group_name: &str) -> ClusterResult<Vec<Task>> {
        Ok(self
            .tasks
            .lock()
            .unwrap()
            .values()
            .filter(|task| task.group_name == group_name)
            .cloned()
            .collect())
    }

    async fn find_task(&self, group_name: &str, task_name: &str) -> ClusterResult<Option<Task>> {
        Ok(self
            .tasks
            .lock()
            .unwrap()
            .get(&(group_name.to_string(), task_name.to_string()))
            .cloned())
    }

    async fn save_group(&self, group: &Group) -> ClusterResult<Group> {
        self.add_group(&group.name);
        Ok(group.clone())
    }

    async fn save_task(&self, task: &Task) -> ClusterResult<Task> {
        Ok(self.insert(task.clone()))
    }
}

/// 每个任务暴露固定的方法名，可指定编译失败的任务
#[derive(Debug, Default)]
pub struct MockCodeRunner {
    methods: HashMap<String, Vec<String>>,
    failing: HashSet<String>,
    compiled: AtomicUsize,
}

impl MockCodeRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_methods(mut self, task: &str, methods: &[&str]) -> Self {
        self.methods.insert(
            task.to_string(),
            methods.iter().map(|m| m.to_string()).collect(),
        );
        self
    }

    pub fn failing(mut self, task: &str) -> Self {
        self.failing.insert(task.to_string());
        self
    }

    pub fn compiled(&self) -> usize {
        self.compiled.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CodeRunner for MockCodeRunner {
    async fn compile(&self, task: &Task) -> ClusterResult<Vec<String>> {
        self.compiled.fetch_add(1, Ordering::SeqCst);
        if self.failing.contains(&task.name) {
            return Err(ClusterError::compile_error(
                &task.group_name,
                &task.name,
                "syntax error",
            ));
        }
        Ok(self
            .methods
            .get(&task.name)
            .cloned()
            .unwrap_or_else(|| vec!["run".to_string()]))
    }
}

/// 记录启停次数的主节点作业
#[derive(Debug, Default)]
pub struct RecordingMasterJob {
    starts: AtomicUsize,
    stops: AtomicUsize,
}

impl RecordingMasterJob {
    pub fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn stops(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MasterJob for RecordingMasterJob {
    async fn start(&self) {
        self.starts.fetch_add(1, Ordering::SeqCst);
    }

    async fn stop(&self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
    }
}

/// 统计内容哈希次数的 SHA-256 哈希器
#[derive(Debug, Default)]
pub struct CountingHasher {
    calls: AtomicUsize,
}

impl CountingHasher {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl FileHasher for CountingHasher {
    fn hash_file(&self, path: &Path) -> io::Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Sha256Hasher.hash_file(path)
    }
}

/// 可注入故障的协调服务
///
/// 包装真实会话；设置故障前缀后，该前缀下的创建、写入、删除和列子节点操作返回通信错误。
pub struct FaultyCoordination {
    inner: Arc<dyn CoordinationService>,
    failing: Mutex<Option<String>>,
}

impl FaultyCoordination {
    pub fn new(inner: Arc<dyn CoordinationService>) -> Self {
        Self {
            inner,
            failing: Mutex::new(None),
        }
    }

    pub fn fail_under(&self, prefix: &str) {
        *self.failing.lock().unwrap() = Some(prefix.to_string());
    }

    pub fn recover(&self) {
        *self.failing.lock().unwrap() = None;
    }

    fn check(&self, path: &str) -> ClusterResult<()> {
        match self.failing.lock().unwrap().as_deref() {
            Some(prefix) if path.starts_with(prefix) => Err(ClusterError::coordination(format!(
                "injected failure: {path}"
            ))),
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl CoordinationService for FaultyCoordination {
    fn session_id(&self) -> u64 {
        self.inner.session_id()
    }

    async fn exists(&self, path: &str) -> ClusterResult<bool> {
        self.inner.exists(path).await
    }

    async fn create(
        &self,
        path: &str,
        data: &[u8],
        mode: CreateMode,
        create_parents: bool,
    ) -> ClusterResult<String> {
        self.check(path)?;
        self.inner.create(path, data, mode, create_parents).await
    }

    async fn get_data(&self, path: &str) -> ClusterResult<Option<Vec<u8>>> {
        self.inner.get_data(path).await
    }

    async fn set_data(&self, path: &str, data: &[u8]) -> ClusterResult<()> {
        self.check(path)?;
        self.inner.set_data(path, data).await
    }

    async fn delete(&self, path: &str, recursive: bool) -> ClusterResult<()> {
        self.check(path)?;
        self.inner.delete(path, recursive).await
    }

    async fn children(&self, path: &str) -> ClusterResult<Vec<String>> {
        self.check(path)?;
        self.inner.children(path).await
    }

    async fn watch_node(&self, path: &str) -> ClusterResult<NodeWatch> {
        self.inner.watch_node(path).await
    }

    fn subscribe(&self) -> tokio::sync::broadcast::Receiver<TreeEvent> {
        self.inner.subscribe()
    }

    async fn lock(&self, path: &str, timeout: Duration) -> ClusterResult<LockGuard> {
        self.inner.lock(path, timeout).await
    }

    fn leader_latch(&self, path: &str, identity: &str) -> Arc<dyn LeaderLatch> {
        self.inner.leader_latch(path, identity)
    }

    fn session_events(&self) -> tokio::sync::broadcast::Receiver<SessionEvent> {
        self.inner.session_events()
    }

    async fn close(&self) {
        self.inner.close().await
    }
}

/// 轮询直到条件成立，超过2秒视为失败
pub async fn wait_until<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..400 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached within timeout");
}
