//! 外部协作者抽象
//!
//! 同步引擎只通过这些接口访问任务存储、代码编译和主节点调度作业

use async_trait::async_trait;
use fleet_core::ClusterResult;

use crate::entities::{Group, Task};

/// 任务存储抽象
#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn list_groups(&self) -> ClusterResult<Vec<Group>>;
    async fn find_tasks_by_group(&self, group_name: &str) -> ClusterResult<Vec<Task>>;
    async fn find_task(&self, group_name: &str, task_name: &str) -> ClusterResult<Option<Task>>;
    async fn save_group(&self, group: &Group) -> ClusterResult<Group>;
    async fn save_task(&self, task: &Task) -> ClusterResult<Task>;
}

/// 编译任务代码并返回对外暴露的可调用方法名
#[async_trait]
pub trait CodeRunner: Send + Sync {
    async fn compile(&self, task: &Task) -> ClusterResult<Vec<String>>;
}

/// 主节点上运行的调度作业，只关心启停
#[async_trait]
pub trait MasterJob: Send + Sync {
    async fn start(&self);
    async fn stop(&self);
}
