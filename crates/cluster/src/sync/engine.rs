use fleet_core::{ClusterError, ClusterResult};
use fleet_domain::{
    reasons, CodeRunner, Different, FileInfo, GroupFiles, Task, TaskStore, FILE_NODE_NAME,
};
use fleet_infrastructure::CoordinationClient;
use metrics::{gauge, histogram};
use rand::seq::SliceRandom;
use serde::de::DeserializeOwned;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, instrument, warn};

use super::local_files::LocalGroupFiles;
use crate::host_group::HostGroupPublisher;
use crate::paths::ClusterPaths;
use crate::routing::RoutingTable;

/// 分组同步引擎
///
/// 比较本机分组（任务和文件）与协调树中的集群记录，生成逐项差异，
/// 集群中没有记录时用本机内容初始化，并发布 HostGroup 状态。
pub struct GroupSyncEngine {
    client: CoordinationClient,
    paths: ClusterPaths,
    store: Arc<dyn TaskStore>,
    runner: Arc<dyn CodeRunner>,
    files: LocalGroupFiles,
    publisher: Arc<HostGroupPublisher>,
    routing: Arc<RoutingTable>,
}

impl GroupSyncEngine {
    pub fn new(
        client: CoordinationClient,
        paths: ClusterPaths,
        store: Arc<dyn TaskStore>,
        runner: Arc<dyn CodeRunner>,
        files: LocalGroupFiles,
        publisher: Arc<HostGroupPublisher>,
        routing: Arc<RoutingTable>,
    ) -> Self {
        Self {
            client,
            paths,
            store,
            runner,
            files,
            publisher,
            routing,
        }
    }

    pub fn local_files(&self) -> &LocalGroupFiles {
        &self.files
    }

    /// 启动时同步所有分组
    ///
    /// 分组顺序随机打乱，避免多个节点同时启动时以相同顺序争抢分组锁。
    /// 单个分组失败只记录日志，会话丢失时整体返回错误。
    pub async fn join_cluster_all(&self) -> ClusterResult<HashMap<String, Vec<Different>>> {
        let mut groups = self.store.list_groups().await?;
        groups.shuffle(&mut rand::rng());
        info!("开始同步 {} 个分组", groups.len());

        let mut results = HashMap::new();
        for group in groups {
            match self.join_cluster(&group.name, true).await {
                Ok(diffs) => {
                    results.insert(group.name, diffs);
                }
                Err(e) if e.is_session_loss() => return Err(e),
                Err(e) => warn!(group = %group.name, "分组同步失败，等待下一轮: {}", e),
            }
        }
        Ok(results)
    }

    /// 同步单个分组，返回差异列表（为空表示完全同步）
    #[instrument(skip(self))]
    pub async fn join_cluster(&self, group: &str, publish_mapping: bool) -> ClusterResult<Vec<Different>> {
        let started = Instant::now();
        let tasks = self.store.find_tasks_by_group(group).await?;
        let files = self.scan(group).await?;

        let diffs = {
            let _guard = match self.client.mutex(&self.paths.lock(group)).await {
                Ok(guard) => guard,
                Err(e) => {
                    error!(group, "获取分组锁失败，跳过本轮同步: {}", e);
                    return Err(e);
                }
            };

            if self.client.exists(&self.paths.group(group)).await? {
                self.diff_group(group, &tasks, &files).await?
            } else {
                self.seed(group, &tasks, &files).await?;
                Vec::new()
            }
        };

        histogram!("fleet_reconcile_duration_ms").record(started.elapsed().as_millis() as f64);
        gauge!("fleet_group_diff_count", "group" => group.to_string()).set(diffs.len() as f64);
        if diffs.is_empty() {
            info!(group, "分组已同步");
        } else {
            for diff in &diffs {
                info!(group, "分组差异: {}", diff);
            }
        }

        match self.publisher.publish(group, diffs.len()).await {
            Ok(_) => {}
            Err(e) if e.is_session_loss() => return Err(e),
            Err(e) => error!(group, "发布HostGroup状态失败，继续注册路由: {}", e),
        }

        if publish_mapping {
            self.publish_mappings(group, &tasks).await;
        }
        Ok(diffs)
    }

    /// 编译每个任务并注册其可调用方法，单个任务失败不影响其余任务
    async fn publish_mappings(&self, group: &str, tasks: &[Task]) {
        for task in tasks {
            match self.runner.compile(task).await {
                Ok(methods) => {
                    for method in methods {
                        self.routing.add_mapping(group, &task.name, &method).await;
                    }
                }
                Err(e) => error!(group, task = %task.name, "任务编译失败，跳过路由注册: {}", e),
            }
        }
    }

    async fn scan(&self, group: &str) -> ClusterResult<GroupFiles> {
        let files = self.files.clone();
        let group = group.to_string();
        tokio::task::spawn_blocking(move || files.list_file_infos_by_group(&group))
            .await
            .map_err(|e| ClusterError::Internal(format!("文件扫描任务失败: {e}")))?
    }

    /// 集群中没有分组记录时，写入本机的全部任务和文件
    async fn seed(&self, group: &str, tasks: &[Task], files: &GroupFiles) -> ClusterResult<()> {
        info!(group, "集群中没有分组记录，使用本机内容初始化");
        self.client.ensure_path(&self.paths.group(group)).await?;

        for task in tasks {
            if task.name == FILE_NODE_NAME {
                warn!(group, "任务名与文件树保留名冲突，跳过: {}", task.name);
                continue;
            }
            self.client
                .write_json(&self.paths.task(group, &task.name), task)
                .await?;
        }
        for file in &files.files {
            self.client
                .write_json(&self.paths.file(group, &file.relative_path), file)
                .await?;
        }
        // 根节点最后写入，根哈希存在即表示文件树完整
        self.client
            .write_json(&self.paths.file_root(group), &files.root)
            .await?;
        Ok(())
    }

    /// 计算本机与集群记录之间的差异
    pub async fn diff_group(
        &self,
        group: &str,
        tasks: &[Task],
        files: &GroupFiles,
    ) -> ClusterResult<Vec<Different>> {
        let mut diffs = self.diff_tasks(group, tasks).await?;
        diffs.extend(self.diff_files(group, files).await?);
        Ok(diffs)
    }

    async fn diff_tasks(&self, group: &str, tasks: &[Task]) -> ClusterResult<Vec<Different>> {
        let mut cluster_names: BTreeSet<String> = self
            .client
            .children(&self.paths.group(group))
            .await?
            .into_iter()
            .filter(|name| name != FILE_NODE_NAME)
            .collect();

        let mut diffs = Vec::new();
        for task in tasks {
            let mut diff = Different::task(group, &task.name);
            if cluster_names.remove(&task.name) {
                match self.read_record::<Task>(&self.paths.task(group, &task.name)).await? {
                    Some(cluster_task) => {
                        for reason in task.diff_reasons(&cluster_task) {
                            diff.add_reason(reason);
                        }
                    }
                    None => diff.add_reason(reasons::MISSING_IN_CLUSTER),
                }
            } else {
                diff.add_reason(reasons::MISSING_IN_CLUSTER);
            }
            if diff.has_reasons() {
                diffs.push(diff);
            }
        }

        for name in cluster_names {
            diffs.push(Different::task(group, &name).with_reason(reasons::MISSING_LOCALLY));
        }
        Ok(diffs)
    }

    /// 文件维度：根哈希一致时直接跳过，否则完整遍历集群文件树
    async fn diff_files(&self, group: &str, files: &GroupFiles) -> ClusterResult<Vec<Different>> {
        let file_root = self.paths.file_root(group);
        let cluster_root = self.read_record::<FileInfo>(&file_root).await?;
        if cluster_root.is_some_and(|root| root.hash == files.root.hash) {
            debug!(group, "根哈希一致，跳过文件比较");
            return Ok(Vec::new());
        }

        let mut cluster_paths: BTreeSet<String> = self
            .client
            .walk_leaves(&file_root)
            .await?
            .into_iter()
            .filter_map(|path| self.paths.relative_file_path(group, &path))
            .collect();

        let mut diffs = Vec::new();
        for local in &files.files {
            if !cluster_paths.remove(&local.relative_path) {
                diffs.push(
                    Different::file(group, &local.relative_path)
                        .with_reason(reasons::MISSING_IN_CLUSTER),
                );
                continue;
            }
            let cluster = self
                .read_record::<FileInfo>(&self.paths.file(group, &local.relative_path))
                .await?;
            if cluster.as_ref() != Some(local) {
                diffs.push(
                    Different::file(group, &local.relative_path)
                        .with_reason(reasons::CONTENT_DIFFERS),
                );
            }
        }

        for path in cluster_paths {
            diffs.push(Different::file(group, &path).with_reason(reasons::MISSING_LOCALLY));
        }

        if diffs.is_empty() {
            // 文件逐一一致，刷新集群根哈希供下次快速比较
            self.client.write_json(&file_root, &files.root).await?;
            debug!(group, "刷新集群根哈希: {}", files.root.hash);
        }
        Ok(diffs)
    }

    /// 只检查指定的任务和文件，不加锁、不遍历
    ///
    /// 同步结论与本机上次发布的 HostGroup 不同时才重新发布。
    #[instrument(skip(self, task_names, files))]
    pub async fn flush_host_group(
        &self,
        group: &str,
        task_names: &[String],
        files: &[FileInfo],
    ) -> ClusterResult<Vec<Different>> {
        let mut diffs = Vec::new();

        for name in task_names {
            let local = self.store.find_task(group, name).await?;
            let cluster = self.read_record::<Task>(&self.paths.task(group, name)).await?;
            let mut diff = Different::task(group, name);
            match (local, cluster) {
                (Some(local), Some(cluster)) => {
                    for reason in local.diff_reasons(&cluster) {
                        diff.add_reason(reason);
                    }
                }
                (Some(_), None) => diff.add_reason(reasons::MISSING_IN_CLUSTER),
                (None, Some(_)) => diff.add_reason(reasons::MISSING_LOCALLY),
                (None, None) => {}
            }
            if diff.has_reasons() {
                diffs.push(diff);
            }
        }

        for file in files {
            let cluster = self
                .read_record::<FileInfo>(&self.paths.file(group, &file.relative_path))
                .await?;
            match cluster {
                None => diffs.push(
                    Different::file(group, &file.relative_path)
                        .with_reason(reasons::MISSING_IN_CLUSTER),
                ),
                Some(cluster) if cluster.hash != file.hash => diffs.push(
                    Different::file(group, &file.relative_path)
                        .with_reason(reasons::CONTENT_DIFFERS),
                ),
                Some(_) => {}
            }
        }

        let current = diffs.is_empty();
        let previous = self.publisher.last_published(group).await;
        if previous.map(|record| record.current) != Some(current) {
            self.publisher.publish(group, diffs.len()).await?;
        } else {
            debug!(group, current, "同步结论未变化，不重新发布");
        }
        Ok(diffs)
    }

    /// 更新单个任务的集群记录
    pub async fn add_task(&self, task: &Task) -> ClusterResult<()> {
        if task.name == FILE_NODE_NAME {
            return Err(ClusterError::Internal(format!(
                "任务名与文件树保留名冲突: {}/{}",
                task.group_name, task.name
            )));
        }
        self.client
            .write_json(&self.paths.task(&task.group_name, &task.name), task)
            .await?;
        info!(group = %task.group_name, task = %task.name, "任务已推送到集群");
        Ok(())
    }

    /// 把本机文件推送到集群；本机文件不存在时删除集群中对应的子树
    pub async fn up_cluster(&self, group: &str, relative_path: &str) -> ClusterResult<()> {
        let files = self.files.clone();
        let owned_group = group.to_string();
        let owned_path = relative_path.to_string();
        let info = tokio::task::spawn_blocking(move || files.file_info(&owned_group, &owned_path))
            .await
            .map_err(|e| ClusterError::Internal(format!("文件读取任务失败: {e}")))??;

        let node = self.paths.file(group, relative_path);
        match info {
            Some(info) => {
                self.client.write_json(&node, &info).await?;
                info!(group, path = relative_path, "文件已推送到集群");
            }
            None => {
                match self.client.delete_recursive(&node).await {
                    Ok(()) | Err(ClusterError::NoNode { .. }) => {}
                    Err(e) => return Err(e),
                }
                self.prune_empty_dirs(group, &node).await?;
                info!(group, path = relative_path, "文件已从集群删除");
            }
        }
        Ok(())
    }

    /// 删除文件后清理空的中间目录节点，直到文件树根
    async fn prune_empty_dirs(&self, group: &str, node: &str) -> ClusterResult<()> {
        let file_root = self.paths.file_root(group);
        let mut current = fleet_infrastructure::coordination::parent_path(node);
        while let Some(dir) = current {
            if dir == file_root || !dir.starts_with(&file_root) {
                break;
            }
            match self.client.children(dir).await {
                Ok(children) if children.is_empty() => match self.client.delete(dir).await {
                    Ok(()) | Err(ClusterError::NoNode { .. }) => {}
                    Err(e) => return Err(e),
                },
                Ok(_) | Err(ClusterError::NoNode { .. }) => break,
                Err(e) => return Err(e),
            }
            current = fleet_infrastructure::coordination::parent_path(dir);
        }
        Ok(())
    }

    /// 读取 JSON 记录，内容损坏时按不存在处理
    async fn read_record<T: DeserializeOwned>(&self, path: &str) -> ClusterResult<Option<T>> {
        match self.client.read_json::<T>(path).await {
            Ok(record) => Ok(record),
            Err(ClusterError::Serialization(message)) => {
                warn!("集群记录无法解析，按缺失处理: {} - {}", path, message);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }
}
