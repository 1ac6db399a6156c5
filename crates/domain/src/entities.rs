use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;

/// 差异原因，写入 [`Different::reasons`]
pub mod reasons {
    pub const CODE_DIFFERS: &str = "code differs";
    pub const STATUS_DIFFERS: &str = "status differs";
    pub const TYPE_DIFFERS: &str = "type differs";
    pub const SCHEDULE_DIFFERS: &str = "schedule differs";
    pub const DESCRIPTION_DIFFERS: &str = "description differs";
    pub const MISSING_IN_CLUSTER: &str = "missing in cluster";
    pub const MISSING_LOCALLY: &str = "missing locally";
    pub const CONTENT_DIFFERS: &str = "content differs";
}

/// 文件树在协调树中的保留名，任务不能使用
pub const FILE_NODE_NAME: &str = "file";

/// 分组根目录在 FileInfo 中的相对路径
pub const ROOT_RELATIVE_PATH: &str = "/";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Group {
    pub id: i64,
    pub name: String,
}

impl Group {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: 0,
            name: name.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum TaskStatus {
    #[serde(rename = "ACTIVE")]
    Active,
    #[serde(rename = "INACTIVE")]
    Inactive,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Active => "ACTIVE",
            TaskStatus::Inactive => "INACTIVE",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ACTIVE" => Some(TaskStatus::Active),
            "INACTIVE" => Some(TaskStatus::Inactive),
            _ => None,
        }
    }
}

/// 任务类型：立即执行的接口任务，或带有调度表达式的定时任务
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum TaskType {
    #[serde(rename = "IMMEDIATE")]
    Immediate,
    #[serde(rename = "SCHEDULED")]
    Scheduled,
}

impl TaskType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::Immediate => "IMMEDIATE",
            TaskType::Scheduled => "SCHEDULED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "IMMEDIATE" => Some(TaskType::Immediate),
            "SCHEDULED" => Some(TaskType::Scheduled),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: i64,
    pub group_name: String,
    pub name: String,
    pub code: String,
    pub status: TaskStatus,
    pub task_type: TaskType,
    /// 仅定时任务有意义
    pub schedule: Option<String>,
    #[serde(default)]
    pub description: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    pub fn new(group_name: impl Into<String>, name: impl Into<String>, code: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: 0, // 将由任务存储生成
            group_name: group_name.into(),
            name: name.into(),
            code: code.into(),
            status: TaskStatus::Active,
            task_type: TaskType::Immediate,
            schedule: None,
            description: String::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_scheduled(&self) -> bool {
        self.task_type == TaskType::Scheduled
    }

    /// 与集群中记录的同名任务逐字段比较，每个不一致的字段单独给出一条原因。
    ///
    /// 只比较代码、状态、类型、调度表达式（定时任务）和简介，身份和时间戳不参与比较。
    pub fn diff_reasons(&self, cluster: &Task) -> Vec<String> {
        let mut found = Vec::new();
        if self.code != cluster.code {
            found.push(reasons::CODE_DIFFERS.to_string());
        }
        if self.status != cluster.status {
            found.push(reasons::STATUS_DIFFERS.to_string());
        }
        if self.task_type != cluster.task_type {
            found.push(reasons::TYPE_DIFFERS.to_string());
        }
        if self.is_scheduled() && self.schedule != cluster.schedule {
            found.push(reasons::SCHEDULE_DIFFERS.to_string());
        }
        if self.description != cluster.description {
            found.push(reasons::DESCRIPTION_DIFFERS.to_string());
        }
        found
    }
}

/// 分组内单个文件（或分组根目录）的摘要
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileInfo {
    /// 相对分组根目录的路径，以'/'开头；根目录本身为"/"
    pub relative_path: String,
    /// 内容哈希（十六进制SHA-256）
    pub hash: String,
    pub length: u64,
    /// 最后修改时间（毫秒时间戳）
    pub last_modified: i64,
}

impl FileInfo {
    pub fn is_root(&self) -> bool {
        self.relative_path == ROOT_RELATIVE_PATH
    }
}

/// 只比较路径和内容哈希
impl PartialEq for FileInfo {
    fn eq(&self, other: &Self) -> bool {
        self.relative_path == other.relative_path && self.hash == other.hash
    }
}

impl Eq for FileInfo {}

/// 一次本地文件扫描的结果
#[derive(Debug, Clone)]
pub struct GroupFiles {
    pub files: Vec<FileInfo>,
    /// 覆盖整个分组的合成根节点
    pub root: FileInfo,
}

impl GroupFiles {
    /// 先普通文件，最后是根节点
    pub fn all(&self) -> impl Iterator<Item = &FileInfo> {
        self.files.iter().chain(std::iter::once(&self.root))
    }
}

/// 本地分组哈希缓存，修改时间未变化时跳过内容哈希
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct GroupCache {
    /// 按路径排序的文件修改时间和长度的哈希
    pub time_hash: String,
    /// 整个分组的聚合内容哈希
    pub group_hash: String,
    pub descriptor_hash: Option<String>,
    /// 相对路径 -> 内容哈希
    #[serde(default)]
    pub file_hashes: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(into = "u8", try_from = "u8")]
pub enum DiffKind {
    Task = 0,
    File = 1,
}

impl From<DiffKind> for u8 {
    fn from(kind: DiffKind) -> Self {
        kind as u8
    }
}

impl TryFrom<u8> for DiffKind {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(DiffKind::Task),
            1 => Ok(DiffKind::File),
            other => Err(format!("Invalid diff kind: {other}")),
        }
    }
}

/// 一条差异记录
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Different {
    pub group_name: String,
    /// 任务名或文件相对路径
    pub path: String,
    pub kind: DiffKind,
    pub reasons: Vec<String>,
}

impl Different {
    pub fn task(group_name: &str, path: &str) -> Self {
        Self {
            group_name: group_name.to_string(),
            path: path.to_string(),
            kind: DiffKind::Task,
            reasons: Vec::new(),
        }
    }

    pub fn file(group_name: &str, path: &str) -> Self {
        Self {
            group_name: group_name.to_string(),
            path: path.to_string(),
            kind: DiffKind::File,
            reasons: Vec::new(),
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reasons.push(reason.into());
        self
    }

    pub fn add_reason(&mut self, reason: impl Into<String>) {
        self.reasons.push(reason.into());
    }

    pub fn has_reasons(&self) -> bool {
        !self.reasons.is_empty()
    }
}

impl fmt::Display for Different {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.kind {
            DiffKind::Task => "task",
            DiffKind::File => "file",
        };
        write!(
            f,
            "{}:{}:{} [{}]",
            self.group_name,
            kind,
            self.path,
            self.reasons.join(", ")
        )
    }
}

/// 路由权重：与主版本同步时的默认权重
pub const CURRENT_WEIGHT: i32 = 100;

/// 主机在某个分组上的同步状态
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct HostGroup {
    pub current: bool,
    pub weight: i32,
    pub ssl: bool,
}

impl HostGroup {
    /// 差异数为0时才算同步，未同步时权重恒为0
    pub fn from_diff_count(diff_count: usize, ssl: bool) -> Self {
        let current = diff_count == 0;
        Self {
            current,
            weight: if current { CURRENT_WEIGHT } else { 0 },
            ssl,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Token {
    pub token: String,
    pub user: String,
    pub expire_at: DateTime<Utc>,
    #[serde(default)]
    pub params: HashMap<String, String>,
}

impl Token {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expire_at <= now
    }
}
