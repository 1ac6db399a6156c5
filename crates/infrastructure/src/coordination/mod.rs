//! 协调服务抽象
//!
//! 协调服务提供层级节点、临时节点、一次性监听、分布式锁和主节点选举。
//! 集群同步逻辑只依赖这里的接口，嵌入式部署和测试使用 [`memory`] 中的内存实现。

use std::any::Any;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use fleet_core::ClusterResult;
use tokio::sync::{broadcast, oneshot, watch};
use tracing::debug;

pub mod client;
pub mod memory;
pub mod tree_cache;

pub use client::CoordinationClient;
pub use memory::{MemoryConnector, MemorySession, MemoryTree};
pub use tree_cache::{NodeMap, TreeCache};

/// 节点创建模式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateMode {
    Persistent,
    /// 随创建者会话结束自动删除
    Ephemeral,
    /// 临时节点，名称后追加单调递增的10位序号
    EphemeralSequential,
}

impl CreateMode {
    pub fn is_ephemeral(&self) -> bool {
        !matches!(self, CreateMode::Persistent)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeEventKind {
    Created,
    DataChanged,
    Deleted,
}

/// 一次性监听触发时收到的事件
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchedEvent {
    pub kind: NodeEventKind,
    pub path: String,
}

/// 协调树变更流中的事件，携带变更后的数据
#[derive(Debug, Clone)]
pub struct TreeEvent {
    pub kind: NodeEventKind,
    pub path: String,
    pub data: Option<Vec<u8>>,
}

/// 会话连接状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    Connected,
    Suspended,
    Reconnected,
    /// 会话已过期，临时节点和监听全部失效
    Lost,
}

/// 一次性节点监听，触发一次后失效；会话关闭时发送端被丢弃
pub type NodeWatch = oneshot::Receiver<WatchedEvent>;

/// 分布式锁持有凭证，离开作用域即释放
pub struct LockGuard {
    path: String,
    _held: Box<dyn Any + Send + Sync>,
}

impl LockGuard {
    pub fn new(path: impl Into<String>, held: Box<dyn Any + Send + Sync>) -> Self {
        Self {
            path: path.into(),
            _held: held,
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }
}

impl fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockGuard").field("path", &self.path).finish()
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        debug!("释放分布式锁: {}", self.path);
    }
}

/// 主节点选举参与者
#[async_trait]
pub trait LeaderLatch: Send + Sync {
    /// 加入选举
    async fn start(&self) -> ClusterResult<()>;

    /// 退出选举，持有领导权时会立即让出；关闭后不能再次启动
    async fn close(&self) -> ClusterResult<()>;

    /// 领导权变化通知，值为当前是否为领导者
    fn subscribe(&self) -> watch::Receiver<bool>;

    fn has_leadership(&self) -> bool;

    fn identity(&self) -> &str;
}

/// 协调服务原语
#[async_trait]
pub trait CoordinationService: Send + Sync {
    fn session_id(&self) -> u64;

    async fn exists(&self, path: &str) -> ClusterResult<bool>;

    /// 创建节点，返回实际路径（顺序节点会追加序号）。节点已存在时返回 `NodeExists`
    async fn create(
        &self,
        path: &str,
        data: &[u8],
        mode: CreateMode,
        create_parents: bool,
    ) -> ClusterResult<String>;

    /// 节点不存在时返回 `None`
    async fn get_data(&self, path: &str) -> ClusterResult<Option<Vec<u8>>>;

    /// 节点不存在时返回 `NoNode`
    async fn set_data(&self, path: &str, data: &[u8]) -> ClusterResult<()>;

    async fn delete(&self, path: &str, recursive: bool) -> ClusterResult<()>;

    async fn children(&self, path: &str) -> ClusterResult<Vec<String>>;

    /// 在节点上注册一次性监听（节点可以尚不存在）
    async fn watch_node(&self, path: &str) -> ClusterResult<NodeWatch>;

    /// 订阅整棵树的变更
    fn subscribe(&self) -> broadcast::Receiver<TreeEvent>;

    /// 获取路径上的分布式互斥锁
    async fn lock(&self, path: &str, timeout: Duration) -> ClusterResult<LockGuard>;

    fn leader_latch(&self, path: &str, identity: &str) -> Arc<dyn LeaderLatch>;

    fn session_events(&self) -> broadcast::Receiver<SessionEvent>;

    async fn close(&self);
}

/// 建立新的协调服务会话，会话丢失后用它重新连接
#[async_trait]
pub trait CoordinationConnector: Send + Sync {
    async fn connect(&self) -> ClusterResult<Arc<dyn CoordinationService>>;
}

/// 拼接协调树路径
pub fn join_path(parent: &str, child: &str) -> String {
    let child = child.trim_start_matches('/');
    if parent == "/" {
        format!("/{child}")
    } else {
        format!("{}/{}", parent.trim_end_matches('/'), child)
    }
}

/// 父路径，根路径返回 `None`
pub fn parent_path(path: &str) -> Option<&str> {
    if path == "/" {
        return None;
    }
    match path.rfind('/') {
        Some(0) => Some("/"),
        Some(idx) => Some(&path[..idx]),
        None => None,
    }
}

/// 路径最后一段
pub fn node_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}
