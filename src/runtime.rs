//! 进程内的默认协作者
//!
//! 代码编译和主节点调度作业由宿主进程提供，这里只有最小实现。

use async_trait::async_trait;
use fleet_core::{ClusterError, ClusterResult};
use fleet_domain::{CodeRunner, MasterJob, Task, TaskStatus};
use tracing::info;

/// 每个启用的任务暴露一个入口方法
#[derive(Debug, Clone)]
pub struct EntryPointRunner {
    entry_point: String,
}

impl EntryPointRunner {
    pub fn new(entry_point: impl Into<String>) -> Self {
        Self {
            entry_point: entry_point.into(),
        }
    }
}

impl Default for EntryPointRunner {
    fn default() -> Self {
        Self::new("run")
    }
}

#[async_trait]
impl CodeRunner for EntryPointRunner {
    async fn compile(&self, task: &Task) -> ClusterResult<Vec<String>> {
        if task.code.trim().is_empty() {
            return Err(ClusterError::compile_error(
                &task.group_name,
                &task.name,
                "任务代码为空",
            ));
        }
        if task.status == TaskStatus::Inactive {
            return Ok(Vec::new());
        }
        Ok(vec![self.entry_point.clone()])
    }
}

/// 只记录主节点身份变化
#[derive(Debug, Default)]
pub struct LoggingMasterJob;

#[async_trait]
impl MasterJob for LoggingMasterJob {
    async fn start(&self) {
        info!("主节点作业已启动");
    }

    async fn stop(&self) {
        info!("主节点作业已停止");
    }
}
