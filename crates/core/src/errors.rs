use thiserror::Error;

/// 集群协调错误类型定义
#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("协调服务通信错误: {0}")]
    Coordination(String),

    #[error("协调服务会话已失效")]
    SessionExpired,

    #[error("节点已存在: {path}")]
    NodeExists { path: String },

    #[error("节点不存在: {path}")]
    NoNode { path: String },

    #[error("获取分布式锁失败: {path} - {message}")]
    Lock { path: String, message: String },

    #[error("任务编译失败: {group}/{task} - {message}")]
    Compile {
        group: String,
        task: String,
        message: String,
    },

    #[error("序列化错误: {0}")]
    Serialization(String),

    #[error("IO错误: {0}")]
    Io(#[from] std::io::Error),

    #[error("数据库错误: {0}")]
    Database(#[from] sqlx::Error),

    #[error("配置错误: {0}")]
    Configuration(String),

    #[error("任务未找到: {group}/{name}")]
    TaskNotFound { group: String, name: String },

    #[error("内部错误: {0}")]
    Internal(String),
}

/// 统一的Result类型
pub type ClusterResult<T> = std::result::Result<T, ClusterError>;

impl ClusterError {
    pub fn coordination<S: Into<String>>(msg: S) -> Self {
        Self::Coordination(msg.into())
    }
    pub fn node_exists<S: Into<String>>(path: S) -> Self {
        Self::NodeExists { path: path.into() }
    }
    pub fn no_node<S: Into<String>>(path: S) -> Self {
        Self::NoNode { path: path.into() }
    }
    pub fn lock_error<P: Into<String>, S: Into<String>>(path: P, msg: S) -> Self {
        Self::Lock {
            path: path.into(),
            message: msg.into(),
        }
    }
    pub fn compile_error<S: Into<String>>(group: &str, task: &str, msg: S) -> Self {
        Self::Compile {
            group: group.to_string(),
            task: task.to_string(),
            message: msg.into(),
        }
    }
    pub fn task_not_found(group: &str, name: &str) -> Self {
        Self::TaskNotFound {
            group: group.to_string(),
            name: name.to_string(),
        }
    }
    pub fn config_error<S: Into<String>>(msg: S) -> Self {
        Self::Configuration(msg.into())
    }

    /// 会话丢失需要整体重建，其余错误只在单个分组或任务范围内处理
    pub fn is_session_loss(&self) -> bool {
        matches!(self, ClusterError::SessionExpired)
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ClusterError::Coordination(_) | ClusterError::Lock { .. } | ClusterError::Io(_)
        )
    }

    /// 协调树上节点状态类错误，调用方通常会按竞争条件处理
    pub fn is_node_state(&self) -> bool {
        matches!(
            self,
            ClusterError::NodeExists { .. } | ClusterError::NoNode { .. }
        )
    }
}

impl From<serde_json::Error> for ClusterError {
    fn from(err: serde_json::Error) -> Self {
        ClusterError::Serialization(err.to_string())
    }
}

impl From<anyhow::Error> for ClusterError {
    fn from(err: anyhow::Error) -> Self {
        ClusterError::Internal(err.to_string())
    }
}
