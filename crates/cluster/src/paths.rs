use fleet_domain::FILE_NODE_NAME;
use fleet_infrastructure::coordination::join_path;

/// 协调树布局，所有路径都在命名空间根之下
#[derive(Debug, Clone)]
pub struct ClusterPaths {
    namespace: String,
}

impl ClusterPaths {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    fn under(&self, child: &str) -> String {
        join_path(&self.namespace, child)
    }

    pub fn host_group_root(&self) -> String {
        self.under("host_group")
    }

    pub fn group_root(&self) -> String {
        self.under("group")
    }

    pub fn token_root(&self) -> String {
        self.under("token")
    }

    pub fn host_root(&self) -> String {
        self.under("host")
    }

    pub fn mapping_root(&self) -> String {
        self.under("mapping")
    }

    pub fn lock_root(&self) -> String {
        self.under("lock")
    }

    /// 选举路径
    pub fn master(&self) -> String {
        self.under("master")
    }

    /// 启动时需要存在的持久根节点
    pub fn roots(&self) -> Vec<String> {
        vec![
            self.host_group_root(),
            self.group_root(),
            self.token_root(),
            self.host_root(),
            self.mapping_root(),
            self.lock_root(),
        ]
    }

    pub fn host(&self, host: &str) -> String {
        join_path(&self.host_root(), host)
    }

    /// HostGroup 节点名：`<host>_<group>`
    pub fn host_group_name(host: &str, group: &str) -> String {
        format!("{host}_{group}")
    }

    /// 从 HostGroup 节点名拆出主机地址，主机地址中不含'_'
    pub fn split_host_group_name(name: &str) -> Option<(&str, &str)> {
        name.split_once('_')
    }

    pub fn host_group(&self, host: &str, group: &str) -> String {
        join_path(&self.host_group_root(), &Self::host_group_name(host, group))
    }

    pub fn group(&self, group: &str) -> String {
        join_path(&self.group_root(), group)
    }

    pub fn task(&self, group: &str, task: &str) -> String {
        join_path(&self.group(group), task)
    }

    /// 分组文件树根，节点数据为根 FileInfo
    pub fn file_root(&self, group: &str) -> String {
        join_path(&self.group(group), FILE_NODE_NAME)
    }

    pub fn file(&self, group: &str, relative_path: &str) -> String {
        join_path(&self.file_root(group), relative_path)
    }

    /// 由文件节点完整路径还原相对路径
    pub fn relative_file_path(&self, group: &str, node_path: &str) -> Option<String> {
        let root = self.file_root(group);
        node_path
            .strip_prefix(&root)
            .filter(|rest| rest.starts_with('/'))
            .map(str::to_string)
    }

    pub fn lock(&self, group: &str) -> String {
        join_path(&self.lock_root(), group)
    }

    pub fn mapping(&self, group: &str, task: &str, method: &str) -> String {
        join_path(&join_path(&join_path(&self.mapping_root(), group), task), method)
    }

    pub fn mapping_host(&self, group: &str, task: &str, method: &str, host: &str) -> String {
        join_path(&self.mapping(group, task, method), host)
    }

    pub fn token(&self, token_id: &str) -> String {
        join_path(&self.token_root(), token_id)
    }
}
