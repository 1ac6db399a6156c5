use fleet_core::{ClusterResult, GroupsConfig};
use fleet_domain::{FileInfo, GroupCache, GroupFiles, ROOT_RELATIVE_PATH};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::UNIX_EPOCH;
use tracing::{debug, warn};
use walkdir::{DirEntry, WalkDir};

/// 参与同步的分组子目录
const SYNCED_DIRS: [&str; 2] = ["resources", "lib"];

/// 文件内容哈希
pub trait FileHasher: Send + Sync {
    fn hash_file(&self, path: &Path) -> io::Result<String>;
}

/// 十六进制 SHA-256
#[derive(Debug, Default, Clone, Copy)]
pub struct Sha256Hasher;

impl FileHasher for Sha256Hasher {
    fn hash_file(&self, path: &Path) -> io::Result<String> {
        let data = fs::read(path)?;
        Ok(sha256_hex(&data))
    }
}

pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// 扫描到但尚未计算内容哈希的文件
struct ScannedFile {
    relative_path: String,
    absolute_path: PathBuf,
    length: u64,
    last_modified: i64,
}

/// 本地分组文件
///
/// 分组目录为 `<root_dir>/<group>`，同步范围是 `resources/`、`lib/` 和包描述文件。
/// 哈希缓存保存在 `<root_dir>/<group>.cache`。
#[derive(Clone)]
pub struct LocalGroupFiles {
    root_dir: PathBuf,
    descriptor_file: String,
    hasher: Arc<dyn FileHasher>,
}

impl LocalGroupFiles {
    pub fn new(config: &GroupsConfig) -> Self {
        Self {
            root_dir: config.root_dir.clone(),
            descriptor_file: config.descriptor_file.clone(),
            hasher: Arc::new(Sha256Hasher),
        }
    }

    pub fn with_hasher(mut self, hasher: Arc<dyn FileHasher>) -> Self {
        self.hasher = hasher;
        self
    }

    pub fn group_dir(&self, group: &str) -> PathBuf {
        self.root_dir.join(group)
    }

    pub fn cache_path(&self, group: &str) -> PathBuf {
        self.root_dir.join(format!("{group}.cache"))
    }

    fn descriptor_relative_path(&self) -> String {
        format!("/{}", self.descriptor_file)
    }

    /// 计算分组内所有文件和合成根节点的 FileInfo
    ///
    /// 修改时间哈希与缓存一致时直接复用缓存中的内容哈希，不读取文件内容。
    pub fn list_file_infos_by_group(&self, group: &str) -> ClusterResult<GroupFiles> {
        let group_dir = self.group_dir(group);
        if !group_dir.exists() {
            fs::create_dir_all(&group_dir)?;
            debug!(group, "创建分组目录: {}", group_dir.display());
        }

        let scanned = self.scan(&group_dir);
        let time_hash = time_hash(&scanned);
        let cached = self.load_cache(group);

        let (files, cache) = match cached {
            Some(cache)
                if cache.time_hash == time_hash
                    && scanned
                        .iter()
                        .all(|file| cache.file_hashes.contains_key(&file.relative_path)) =>
            {
                debug!(group, "分组哈希缓存命中");
                let files = scanned
                    .iter()
                    .map(|file| {
                        let hash = cache
                            .file_hashes
                            .get(&file.relative_path)
                            .cloned()
                            .unwrap_or_default();
                        to_file_info(file, hash)
                    })
                    .collect();
                (files, cache)
            }
            _ => {
                debug!(group, "分组哈希缓存失效，重新计算 {} 个文件", scanned.len());
                let files = self.hash_all(&scanned)?;
                let cache = self.build_cache(time_hash, &files);
                self.save_cache(group, &cache);
                (files, cache)
            }
        };

        let root = FileInfo {
            relative_path: ROOT_RELATIVE_PATH.to_string(),
            hash: cache.group_hash,
            length: files.iter().map(|f: &FileInfo| f.length).sum(),
            last_modified: files.iter().map(|f| f.last_modified).max().unwrap_or(0),
        };
        Ok(GroupFiles { files, root })
    }

    /// 单个文件的 FileInfo，文件不存在（或不在同步范围内）时返回 `None`
    pub fn file_info(&self, group: &str, relative_path: &str) -> ClusterResult<Option<FileInfo>> {
        if !self.in_sync_scope(relative_path) {
            return Ok(None);
        }
        let absolute_path = self.group_dir(group).join(relative_path.trim_start_matches('/'));
        let metadata = match fs::metadata(&absolute_path) {
            Ok(metadata) if metadata.is_file() => metadata,
            Ok(_) => return Ok(None),
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let scanned = ScannedFile {
            relative_path: relative_path.to_string(),
            length: metadata.len(),
            last_modified: modified_millis(&metadata),
            absolute_path,
        };
        let hash = self.hasher.hash_file(&scanned.absolute_path)?;
        Ok(Some(to_file_info(&scanned, hash)))
    }

    fn in_sync_scope(&self, relative_path: &str) -> bool {
        if relative_path == self.descriptor_relative_path() {
            return true;
        }
        let mut segments = relative_path.trim_start_matches('/').split('/');
        let top = segments.next().unwrap_or_default();
        SYNCED_DIRS.contains(&top) && relative_path.split('/').all(|s| !s.starts_with('.'))
    }

    fn scan(&self, group_dir: &Path) -> Vec<ScannedFile> {
        let mut scanned = Vec::new();

        for dir in SYNCED_DIRS {
            let base = group_dir.join(dir);
            if !base.is_dir() {
                continue;
            }
            let walker = WalkDir::new(&base)
                .follow_links(false)
                .into_iter()
                .filter_entry(|entry| entry.depth() == 0 || !is_hidden(entry));
            for entry in walker {
                let entry = match entry {
                    Ok(entry) => entry,
                    Err(e) => {
                        debug!("跳过无法读取的条目: {}", e);
                        continue;
                    }
                };
                if !entry.file_type().is_file() {
                    continue;
                }
                let metadata = match entry.metadata() {
                    Ok(metadata) => metadata,
                    Err(e) => {
                        debug!("跳过无法读取的文件: {} - {}", entry.path().display(), e);
                        continue;
                    }
                };
                if let Some(relative_path) = relative_to(group_dir, entry.path()) {
                    scanned.push(ScannedFile {
                        relative_path,
                        absolute_path: entry.path().to_path_buf(),
                        length: metadata.len(),
                        last_modified: modified_millis(&metadata),
                    });
                }
            }
        }

        let descriptor = group_dir.join(&self.descriptor_file);
        if let Ok(metadata) = fs::metadata(&descriptor) {
            if metadata.is_file() {
                scanned.push(ScannedFile {
                    relative_path: self.descriptor_relative_path(),
                    absolute_path: descriptor,
                    length: metadata.len(),
                    last_modified: modified_millis(&metadata),
                });
            }
        }

        scanned.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));
        scanned
    }

    fn hash_all(&self, scanned: &[ScannedFile]) -> ClusterResult<Vec<FileInfo>> {
        let mut files = Vec::with_capacity(scanned.len());
        for file in scanned {
            match self.hasher.hash_file(&file.absolute_path) {
                Ok(hash) => files.push(to_file_info(file, hash)),
                // 扫描之后被删除
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    debug!("文件已不存在: {}", file.absolute_path.display())
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(files)
    }

    fn build_cache(&self, time_hash: String, files: &[FileInfo]) -> GroupCache {
        let descriptor_path = self.descriptor_relative_path();
        GroupCache {
            time_hash,
            group_hash: group_hash(files),
            descriptor_hash: files
                .iter()
                .find(|f| f.relative_path == descriptor_path)
                .map(|f| f.hash.clone()),
            file_hashes: files
                .iter()
                .map(|f| (f.relative_path.clone(), f.hash.clone()))
                .collect::<BTreeMap<_, _>>(),
        }
    }

    fn load_cache(&self, group: &str) -> Option<GroupCache> {
        let path = self.cache_path(group);
        let data = fs::read(&path).ok()?;
        match serde_json::from_slice(&data) {
            Ok(cache) => Some(cache),
            Err(e) => {
                warn!(group, "分组哈希缓存损坏，忽略: {}", e);
                None
            }
        }
    }

    fn save_cache(&self, group: &str, cache: &GroupCache) {
        let result = serde_json::to_vec_pretty(cache)
            .map_err(io::Error::from)
            .and_then(|data| write_atomic(&self.cache_path(group), &data));
        if let Err(e) = result {
            warn!(group, "保存分组哈希缓存失败: {}", e);
        }
    }
}

static PARTIAL_SEQ: AtomicU64 = AtomicU64::new(0);

/// 先写临时文件再改名，读者只会看到完整的旧文件或新文件
fn write_atomic(path: &Path, payload: &[u8]) -> io::Result<()> {
    let seq = PARTIAL_SEQ.fetch_add(1, Ordering::Relaxed);
    let tmp_path = path.with_extension(format!("partial.{}.{}", std::process::id(), seq));
    fs::write(&tmp_path, payload)?;
    fs::rename(&tmp_path, path).inspect_err(|_| {
        let _ = fs::remove_file(&tmp_path);
    })
}

fn is_hidden(entry: &DirEntry) -> bool {
    entry
        .file_name()
        .to_str()
        .map(|name| name.starts_with('.'))
        .unwrap_or(false)
}

fn relative_to(group_dir: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(group_dir).ok()?;
    let mut out = String::new();
    for component in relative.components() {
        out.push('/');
        out.push_str(component.as_os_str().to_str()?);
    }
    Some(out)
}

fn modified_millis(metadata: &fs::Metadata) -> i64 {
    metadata
        .modified()
        .ok()
        .and_then(|time| time.duration_since(UNIX_EPOCH).ok())
        .map(|duration| duration.as_millis() as i64)
        .unwrap_or(0)
}

fn to_file_info(file: &ScannedFile, hash: String) -> FileInfo {
    FileInfo {
        relative_path: file.relative_path.clone(),
        hash,
        length: file.length,
        last_modified: file.last_modified,
    }
}

/// 按路径排序的 (路径, 修改时间, 长度) 列表的哈希
fn time_hash(scanned: &[ScannedFile]) -> String {
    let mut hasher = Sha256::new();
    for file in scanned {
        hasher.update(file.relative_path.as_bytes());
        hasher.update(b"=");
        hasher.update(file.last_modified.to_string().as_bytes());
        hasher.update(b":");
        hasher.update(file.length.to_string().as_bytes());
        hasher.update(b"\n");
    }
    hex::encode(hasher.finalize())
}

/// 按路径排序的 (路径, 内容哈希) 列表的哈希
pub fn group_hash(files: &[FileInfo]) -> String {
    let mut entries: Vec<(&str, &str)> = files
        .iter()
        .map(|f| (f.relative_path.as_str(), f.hash.as_str()))
        .collect();
    entries.sort();
    let mut hasher = Sha256::new();
    for (path, hash) in entries {
        hasher.update(path.as_bytes());
        hasher.update(hash.as_bytes());
        hasher.update(b"\n");
    }
    hex::encode(hasher.finalize())
}
