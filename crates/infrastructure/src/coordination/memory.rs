use async_trait::async_trait;
use fleet_core::{ClusterError, ClusterResult};
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{
    node_name, parent_path, CoordinationConnector, CoordinationService, CreateMode, LeaderLatch,
    LockGuard, NodeEventKind, NodeWatch, SessionEvent, TreeEvent, WatchedEvent,
};

const EVENT_CHANNEL_CAPACITY: usize = 1024;
const SESSION_CHANNEL_CAPACITY: usize = 16;
const LATCH_NODE_PREFIX: &str = "latch-";

#[derive(Debug, Default)]
struct Node {
    data: Vec<u8>,
    /// 临时节点的所属会话
    owner: Option<u64>,
    children: BTreeSet<String>,
    /// 顺序子节点计数器
    next_sequence: u64,
}

#[derive(Default)]
struct TreeState {
    nodes: HashMap<String, Node>,
    /// 路径 -> (会话, 一次性监听)
    watches: HashMap<String, Vec<(u64, oneshot::Sender<WatchedEvent>)>>,
    sessions: HashMap<u64, broadcast::Sender<SessionEvent>>,
}

/// 内存协调树
///
/// 进程内的层级节点存储，语义与外部协调服务一致：临时节点随会话结束删除，
/// 监听只触发一次，锁按路径分段。适用于嵌入式单机部署和测试，
/// 多个 [`MemorySession`] 共享同一棵树即可模拟多个对等节点。
pub struct MemoryTree {
    state: Mutex<TreeState>,
    events: broadcast::Sender<TreeEvent>,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    next_session: AtomicU64,
}

impl MemoryTree {
    pub fn new() -> Arc<Self> {
        let mut state = TreeState::default();
        state.nodes.insert("/".to_string(), Node::default());
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Arc::new(Self {
            state: Mutex::new(state),
            events,
            locks: Mutex::new(HashMap::new()),
            next_session: AtomicU64::new(1),
        })
    }

    /// 打开新会话
    pub async fn connect(self: &Arc<Self>) -> MemorySession {
        let id = self.next_session.fetch_add(1, Ordering::SeqCst);
        let (session_tx, _) = broadcast::channel(SESSION_CHANNEL_CAPACITY);
        self.state.lock().await.sessions.insert(id, session_tx.clone());
        info!("内存协调树会话已建立: {}", id);
        let _ = session_tx.send(SessionEvent::Connected);
        MemorySession {
            id,
            tree: Arc::clone(self),
            session_tx,
        }
    }

    /// 使会话过期：删除它的临时节点和监听，并通知会话丢失
    pub async fn expire_session(&self, session_id: u64) {
        warn!("会话过期: {}", session_id);
        self.end_session(session_id, true).await;
    }

    /// 当前注册中的一次性监听数量
    pub async fn watch_count(&self) -> usize {
        self.state
            .lock()
            .await
            .watches
            .values()
            .map(|list| list.iter().filter(|(_, tx)| !tx.is_closed()).count())
            .sum()
    }

    pub async fn is_session_alive(&self, session_id: u64) -> bool {
        self.state.lock().await.sessions.contains_key(&session_id)
    }

    async fn end_session(&self, session_id: u64, notify: bool) {
        let mut state = self.state.lock().await;
        let Some(session_tx) = state.sessions.remove(&session_id) else {
            return;
        };

        for list in state.watches.values_mut() {
            list.retain(|(owner, _)| *owner != session_id);
        }
        state.watches.retain(|_, list| !list.is_empty());

        let mut owned: Vec<String> = state
            .nodes
            .iter()
            .filter(|(_, node)| node.owner == Some(session_id))
            .map(|(path, _)| path.clone())
            .collect();
        // 先删深层节点
        owned.sort_by_key(|path| std::cmp::Reverse(path.len()));
        for path in owned {
            self.remove_subtree(&mut state, &path);
        }
        drop(state);

        if notify {
            let _ = session_tx.send(SessionEvent::Lost);
        }
    }

    fn check_session(state: &TreeState, session_id: u64) -> ClusterResult<()> {
        if state.sessions.contains_key(&session_id) {
            Ok(())
        } else {
            Err(ClusterError::SessionExpired)
        }
    }

    fn validate_path(path: &str) -> ClusterResult<()> {
        if !path.starts_with('/') || (path.len() > 1 && path.ends_with('/')) || path.contains("//")
        {
            return Err(ClusterError::coordination(format!("非法路径: {path}")));
        }
        Ok(())
    }

    fn notify(&self, state: &mut TreeState, kind: NodeEventKind, path: &str, data: Option<Vec<u8>>) {
        if let Some(list) = state.watches.remove(path) {
            for (_, tx) in list {
                let _ = tx.send(WatchedEvent {
                    kind,
                    path: path.to_string(),
                });
            }
        }
        let _ = self.events.send(TreeEvent {
            kind,
            path: path.to_string(),
            data,
        });
    }

    fn insert_node(
        &self,
        state: &mut TreeState,
        path: &str,
        data: &[u8],
        owner: Option<u64>,
    ) -> ClusterResult<()> {
        let parent = parent_path(path).ok_or_else(|| ClusterError::node_exists(path))?;
        let parent_node = state
            .nodes
            .get_mut(parent)
            .ok_or_else(|| ClusterError::no_node(parent))?;
        if parent_node.owner.is_some() {
            return Err(ClusterError::coordination(format!(
                "临时节点不能有子节点: {parent}"
            )));
        }
        parent_node.children.insert(node_name(path).to_string());
        state.nodes.insert(
            path.to_string(),
            Node {
                data: data.to_vec(),
                owner,
                ..Node::default()
            },
        );
        self.notify(state, NodeEventKind::Created, path, Some(data.to_vec()));
        Ok(())
    }

    fn remove_subtree(&self, state: &mut TreeState, path: &str) {
        let Some(node) = state.nodes.get(path) else {
            return;
        };
        let children: Vec<String> = node.children.iter().cloned().collect();
        for child in children {
            self.remove_subtree(state, &super::join_path(path, &child));
        }
        state.nodes.remove(path);
        if let Some(parent) = parent_path(path) {
            if let Some(parent_node) = state.nodes.get_mut(parent) {
                parent_node.children.remove(node_name(path));
            }
        }
        self.notify(state, NodeEventKind::Deleted, path, None);
    }

    async fn create(
        &self,
        session_id: u64,
        path: &str,
        data: &[u8],
        mode: CreateMode,
        create_parents: bool,
    ) -> ClusterResult<String> {
        Self::validate_path(path)?;
        let mut state = self.state.lock().await;
        Self::check_session(&state, session_id)?;

        let parent = parent_path(path).ok_or_else(|| ClusterError::node_exists(path))?;
        if !state.nodes.contains_key(parent) {
            if !create_parents {
                return Err(ClusterError::no_node(parent));
            }
            let mut missing = Vec::new();
            let mut cursor = Some(parent);
            while let Some(current) = cursor {
                if state.nodes.contains_key(current) {
                    break;
                }
                missing.push(current.to_string());
                cursor = parent_path(current);
            }
            for ancestor in missing.iter().rev() {
                self.insert_node(&mut state, ancestor, &[], None)?;
            }
        }

        let actual = match mode {
            CreateMode::EphemeralSequential => {
                let parent_node = state
                    .nodes
                    .get_mut(parent)
                    .ok_or_else(|| ClusterError::no_node(parent))?;
                let sequence = parent_node.next_sequence;
                parent_node.next_sequence += 1;
                format!("{path}{sequence:010}")
            }
            _ => path.to_string(),
        };

        if state.nodes.contains_key(&actual) {
            return Err(ClusterError::node_exists(actual));
        }
        let owner = mode.is_ephemeral().then_some(session_id);
        self.insert_node(&mut state, &actual, data, owner)?;
        debug!("创建节点: {} ({:?})", actual, mode);
        Ok(actual)
    }

    async fn exists(&self, session_id: u64, path: &str) -> ClusterResult<bool> {
        let state = self.state.lock().await;
        Self::check_session(&state, session_id)?;
        Ok(state.nodes.contains_key(path))
    }

    async fn get_data(&self, session_id: u64, path: &str) -> ClusterResult<Option<Vec<u8>>> {
        let state = self.state.lock().await;
        Self::check_session(&state, session_id)?;
        Ok(state.nodes.get(path).map(|node| node.data.clone()))
    }

    async fn set_data(&self, session_id: u64, path: &str, data: &[u8]) -> ClusterResult<()> {
        let mut state = self.state.lock().await;
        Self::check_session(&state, session_id)?;
        let node = state
            .nodes
            .get_mut(path)
            .ok_or_else(|| ClusterError::no_node(path))?;
        node.data = data.to_vec();
        self.notify(&mut state, NodeEventKind::DataChanged, path, Some(data.to_vec()));
        Ok(())
    }

    async fn delete(&self, session_id: u64, path: &str, recursive: bool) -> ClusterResult<()> {
        Self::validate_path(path)?;
        if path == "/" {
            return Err(ClusterError::coordination("不能删除根节点"));
        }
        let mut state = self.state.lock().await;
        Self::check_session(&state, session_id)?;
        let node = state
            .nodes
            .get(path)
            .ok_or_else(|| ClusterError::no_node(path))?;
        if !recursive && !node.children.is_empty() {
            return Err(ClusterError::coordination(format!("节点非空: {path}")));
        }
        self.remove_subtree(&mut state, path);
        debug!("删除节点: {}", path);
        Ok(())
    }

    async fn children(&self, session_id: u64, path: &str) -> ClusterResult<Vec<String>> {
        let state = self.state.lock().await;
        Self::check_session(&state, session_id)?;
        state
            .nodes
            .get(path)
            .map(|node| node.children.iter().cloned().collect())
            .ok_or_else(|| ClusterError::no_node(path))
    }

    async fn watch_node(&self, session_id: u64, path: &str) -> ClusterResult<NodeWatch> {
        Self::validate_path(path)?;
        let mut state = self.state.lock().await;
        Self::check_session(&state, session_id)?;
        let (tx, rx) = oneshot::channel();
        let list = state.watches.entry(path.to_string()).or_default();
        list.retain(|(_, existing)| !existing.is_closed());
        list.push((session_id, tx));
        Ok(rx)
    }

    async fn lock(&self, session_id: u64, path: &str, timeout: Duration) -> ClusterResult<LockGuard> {
        {
            let state = self.state.lock().await;
            Self::check_session(&state, session_id)?;
        }
        let mutex = {
            let mut locks = self.locks.lock().await;
            Arc::clone(locks.entry(path.to_string()).or_default())
        };
        match tokio::time::timeout(timeout, mutex.lock_owned()).await {
            Ok(guard) => {
                debug!("获取分布式锁: {}", path);
                Ok(LockGuard::new(path, Box::new(guard)))
            }
            Err(_) => Err(ClusterError::lock_error(
                path,
                format!("等待超过 {}ms", timeout.as_millis()),
            )),
        }
    }
}

/// 内存协调树上的一个会话
pub struct MemorySession {
    id: u64,
    tree: Arc<MemoryTree>,
    session_tx: broadcast::Sender<SessionEvent>,
}

impl MemorySession {
    pub fn tree(&self) -> &Arc<MemoryTree> {
        &self.tree
    }
}

#[async_trait]
impl CoordinationService for MemorySession {
    fn session_id(&self) -> u64 {
        self.id
    }

    async fn exists(&self, path: &str) -> ClusterResult<bool> {
        self.tree.exists(self.id, path).await
    }

    async fn create(
        &self,
        path: &str,
        data: &[u8],
        mode: CreateMode,
        create_parents: bool,
    ) -> ClusterResult<String> {
        self.tree
            .create(self.id, path, data, mode, create_parents)
            .await
    }

    async fn get_data(&self, path: &str) -> ClusterResult<Option<Vec<u8>>> {
        self.tree.get_data(self.id, path).await
    }

    async fn set_data(&self, path: &str, data: &[u8]) -> ClusterResult<()> {
        self.tree.set_data(self.id, path, data).await
    }

    async fn delete(&self, path: &str, recursive: bool) -> ClusterResult<()> {
        self.tree.delete(self.id, path, recursive).await
    }

    async fn children(&self, path: &str) -> ClusterResult<Vec<String>> {
        self.tree.children(self.id, path).await
    }

    async fn watch_node(&self, path: &str) -> ClusterResult<NodeWatch> {
        self.tree.watch_node(self.id, path).await
    }

    fn subscribe(&self) -> broadcast::Receiver<TreeEvent> {
        self.tree.events.subscribe()
    }

    async fn lock(&self, path: &str, timeout: Duration) -> ClusterResult<LockGuard> {
        self.tree.lock(self.id, path, timeout).await
    }

    fn leader_latch(&self, path: &str, identity: &str) -> Arc<dyn LeaderLatch> {
        let (state, _) = watch::channel(false);
        Arc::new(MemoryLeaderLatch {
            tree: Arc::clone(&self.tree),
            session_id: self.id,
            path: path.to_string(),
            identity: identity.to_string(),
            state: Arc::new(state),
            inner: Mutex::new(LatchInner::default()),
        })
    }

    fn session_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.session_tx.subscribe()
    }

    async fn close(&self) {
        info!("关闭内存协调树会话: {}", self.id);
        self.tree.end_session(self.id, false).await;
    }
}

#[derive(Default)]
struct LatchInner {
    node: Option<String>,
    task: Option<JoinHandle<()>>,
    closed: bool,
}

/// 基于临时顺序节点的选举：序号最小的参与者为领导者
struct MemoryLeaderLatch {
    tree: Arc<MemoryTree>,
    session_id: u64,
    path: String,
    identity: String,
    state: Arc<watch::Sender<bool>>,
    inner: Mutex<LatchInner>,
}

impl MemoryLeaderLatch {
    async fn evaluate(tree: &MemoryTree, latch_path: &str, own_name: &str) -> Option<bool> {
        let state = tree.state.lock().await;
        let node = state.nodes.get(latch_path)?;
        if !node.children.contains(own_name) {
            return None;
        }
        // 序号定长，字典序即创建顺序
        let lowest = node
            .children
            .iter()
            .filter(|name| name.starts_with(LATCH_NODE_PREFIX))
            .min();
        Some(lowest.map(|name| name == own_name).unwrap_or(false))
    }
}

#[async_trait]
impl LeaderLatch for MemoryLeaderLatch {
    async fn start(&self) -> ClusterResult<()> {
        let mut inner = self.inner.lock().await;
        if inner.closed {
            return Err(ClusterError::coordination(format!(
                "选举参与者已关闭: {}",
                self.identity
            )));
        }
        if inner.node.is_some() {
            return Ok(());
        }

        // 先订阅再创建节点，避免漏掉自己创建之后的变更
        let mut events = self.tree.events.subscribe();
        let prefix = super::join_path(&self.path, LATCH_NODE_PREFIX);
        let node = self
            .tree
            .create(
                self.session_id,
                &prefix,
                self.identity.as_bytes(),
                CreateMode::EphemeralSequential,
                true,
            )
            .await?;
        let own_name = node_name(&node).to_string();
        debug!("加入主节点选举: {} -> {}", self.identity, node);

        let tree = Arc::clone(&self.tree);
        let latch_path = self.path.clone();
        let state = Arc::clone(&self.state);
        let identity = self.identity.clone();
        let task = tokio::spawn(async move {
            loop {
                match Self::evaluate(&tree, &latch_path, &own_name).await {
                    Some(leader) => {
                        let changed = state.send_if_modified(|current| {
                            let changed = *current != leader;
                            *current = leader;
                            changed
                        });
                        if changed {
                            info!("选举状态变化: {} leader={}", identity, leader);
                        }
                    }
                    None => {
                        state.send_if_modified(|current| std::mem::replace(current, false));
                        debug!("选举节点已删除，退出选举: {}", identity);
                        break;
                    }
                }

                loop {
                    match events.recv().await {
                        Ok(event) if parent_path(&event.path) == Some(latch_path.as_str()) => break,
                        Ok(_) => continue,
                        Err(broadcast::error::RecvError::Lagged(_)) => break,
                        Err(broadcast::error::RecvError::Closed) => return,
                    }
                }
            }
        });

        inner.node = Some(node);
        inner.task = Some(task);
        Ok(())
    }

    async fn close(&self) -> ClusterResult<()> {
        let mut inner = self.inner.lock().await;
        inner.closed = true;
        if let Some(task) = inner.task.take() {
            task.abort();
        }
        if let Some(node) = inner.node.take() {
            match self.tree.delete(self.session_id, &node, false).await {
                Ok(()) | Err(ClusterError::NoNode { .. }) | Err(ClusterError::SessionExpired) => {}
                Err(e) => return Err(e),
            }
        }
        self.state.send_if_modified(|current| std::mem::replace(current, false));
        debug!("退出主节点选举: {}", self.identity);
        Ok(())
    }

    fn subscribe(&self) -> watch::Receiver<bool> {
        self.state.subscribe()
    }

    fn has_leadership(&self) -> bool {
        *self.state.borrow()
    }

    fn identity(&self) -> &str {
        &self.identity
    }
}

/// 每次连接在同一棵内存树上打开新会话
pub struct MemoryConnector {
    tree: Arc<MemoryTree>,
}

impl MemoryConnector {
    pub fn new(tree: Arc<MemoryTree>) -> Self {
        Self { tree }
    }

    pub fn tree(&self) -> &Arc<MemoryTree> {
        &self.tree
    }
}

#[async_trait]
impl CoordinationConnector for MemoryConnector {
    async fn connect(&self) -> ClusterResult<Arc<dyn CoordinationService>> {
        Ok(Arc::new(self.tree.connect().await))
    }
}
