use std::fmt;
use std::path::{Component, Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::engine::EngineHandle;

/// 任务ID，进程生命周期内唯一，不会复用
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskId(Uuid);

impl TaskId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// 分享中的源文件描述，创建后不可变
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRef {
    pub fs_id: String, // 远端文件ID
    pub name: String,  // 文件名
    pub size: u64,     // 文件总大小
    pub path: String,  // 分享内的路径
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Waiting,
    Creating,
    Downloading,
    Paused,
    Processing,
    Completed,
    Error,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Error)
    }

    // 占用并发名额的状态
    pub fn is_busy(self) -> bool {
        matches!(
            self,
            TaskStatus::Creating | TaskStatus::Downloading | TaskStatus::Processing
        )
    }

    pub fn is_pausable(self) -> bool {
        matches!(
            self,
            TaskStatus::Waiting
                | TaskStatus::Creating
                | TaskStatus::Downloading
                | TaskStatus::Processing
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TaskStatus::Waiting => "waiting",
            TaskStatus::Creating => "creating",
            TaskStatus::Downloading => "downloading",
            TaskStatus::Paused => "paused",
            TaskStatus::Processing => "processing",
            TaskStatus::Completed => "completed",
            TaskStatus::Error => "error",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadTask {
    pub id: TaskId,
    pub file: FileRef,
    pub status: TaskStatus,
    pub progress: f64, // 0-100
    pub speed: u64,    // bytes/s
    pub downloaded_bytes: u64,
    pub total_bytes: u64,
    pub engine_handle: Option<EngineHandle>,
    pub retry_count: u32,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub target_directory: PathBuf,
    pub error: Option<String>, // 失败原因，仅 error 状态下存在
}

impl DownloadTask {
    pub fn new(file: FileRef, target_directory: PathBuf) -> Self {
        Self {
            id: TaskId::new(),
            total_bytes: file.size,
            file,
            status: TaskStatus::Waiting,
            progress: 0.0,
            speed: 0,
            downloaded_bytes: 0,
            engine_handle: None,
            retry_count: 0,
            created_at: Utc::now(),
            completed_at: None,
            target_directory,
            error: None,
        }
    }
}

/// 计算任务的目标目录
///
/// `base_path` 是分享链接里的虚拟根目录，文件在分享内的相对目录
/// 会被原样保留到下载目录下；没有基础路径时所有文件平铺到下载目录。
pub fn resolve_target_directory(
    download_dir: &Path,
    base_path: Option<&str>,
    file_path: &str,
) -> PathBuf {
    let Some(base) = base_path else {
        return download_dir.to_path_buf();
    };

    let parent = Path::new(file_path).parent().unwrap_or(Path::new("/"));
    let base = Path::new(base);
    let relative = parent.strip_prefix(base).unwrap_or(parent);

    // 只保留普通路径段，避免 `..` 跳出下载目录
    relative
        .components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part),
            _ => None,
        })
        .fold(download_dir.to_path_buf(), |dir, part| dir.join(part))
}
