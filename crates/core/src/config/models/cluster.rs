use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// 协调服务配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinationConfig {
    /// 协调树根路径，所有节点都挂在这个前缀下
    pub namespace: String,
    pub connect_timeout_seconds: u64,
    /// 分组锁等待超时，超时后本轮同步放弃
    pub lock_timeout_seconds: u64,
    /// 会话丢失后重建的重试间隔
    pub reconnect_interval_seconds: u64,
}

impl Default for CoordinationConfig {
    fn default() -> Self {
        Self {
            namespace: "/fleet".to_string(),
            connect_timeout_seconds: 15,
            lock_timeout_seconds: 30,
            reconnect_interval_seconds: 1,
        }
    }
}

impl CoordinationConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if !self.namespace.starts_with('/') {
            return Err(anyhow::anyhow!(
                "协调树根路径必须以'/'开头: {}",
                self.namespace
            ));
        }
        if self.namespace.len() > 1 && self.namespace.ends_with('/') {
            return Err(anyhow::anyhow!(
                "协调树根路径不能以'/'结尾: {}",
                self.namespace
            ));
        }
        if self.connect_timeout_seconds == 0 {
            return Err(anyhow::anyhow!("连接超时时间必须大于0"));
        }
        if self.lock_timeout_seconds == 0 {
            return Err(anyhow::anyhow!("分组锁超时时间必须大于0"));
        }
        Ok(())
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_secs(self.lock_timeout_seconds)
    }

    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_secs(self.reconnect_interval_seconds)
    }
}

/// 本机节点配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    pub host: String,
    pub port: u16,
    /// 对外服务是否启用TLS，随HostGroup一起发布
    pub ssl: bool,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 9095,
            ssl: false,
        }
    }
}

impl NodeConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.host.is_empty() {
            return Err(anyhow::anyhow!("主机地址不能为空"));
        }
        if self.host.contains('/') || self.host.contains('_') {
            return Err(anyhow::anyhow!(
                "主机地址不能包含'/'或'_': {}",
                self.host
            ));
        }
        if self.port == 0 {
            return Err(anyhow::anyhow!("端口必须大于0"));
        }
        Ok(())
    }

    /// 集群内标识本机的地址，形如 `127.0.0.1:9095`
    pub fn host_port(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// 本地分组文件配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupsConfig {
    pub root_dir: PathBuf,
    /// 分组根目录下的包描述文件名
    pub descriptor_file: String,
    /// 定期重新同步全部分组的间隔，0 表示只在启动时同步
    pub sync_interval_seconds: u64,
}

impl Default for GroupsConfig {
    fn default() -> Self {
        Self {
            root_dir: PathBuf::from("data/groups"),
            descriptor_file: "manifest.json".to_string(),
            sync_interval_seconds: 300,
        }
    }
}

impl GroupsConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.root_dir.as_os_str().is_empty() {
            return Err(anyhow::anyhow!("分组根目录不能为空"));
        }
        if self.descriptor_file.is_empty() || self.descriptor_file.contains('/') {
            return Err(anyhow::anyhow!(
                "无效的包描述文件名: {}",
                self.descriptor_file
            ));
        }
        Ok(())
    }

    pub fn sync_interval(&self) -> Option<Duration> {
        (self.sync_interval_seconds > 0).then(|| Duration::from_secs(self.sync_interval_seconds))
    }
}
