use serde::Serialize;

use super::task::{DownloadTask, TaskId, TaskStatus};

/// 进度推送
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct TaskProgress {
    pub task_id: TaskId,
    pub percent: f64,
    pub speed: u64,
    pub downloaded_bytes: u64,
    pub total_bytes: u64,
}

// --------------------------------------------------------------------
/// 推送给观察者（UI）的任务变更
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskEvent {
    Added(Box<DownloadTask>),
    StatusChanged {
        task_id: TaskId,
        status: TaskStatus,
    },
    Progress(TaskProgress),
    Terminal {
        task_id: TaskId,
        success: bool,
        reason: Option<String>,
    },
    Removed {
        task_ids: Vec<TaskId>,
    },
}

// --------------------------------------------------------------------
/// 任务列表快照，计数全部由列表推导
#[derive(Debug, Clone, Default, Serialize)]
pub struct RegistrySnapshot {
    pub active: Vec<DownloadTask>,    // 未结束的任务，按创建顺序
    pub completed: Vec<DownloadTask>, // 已结束的任务，最新的在前
}

impl RegistrySnapshot {
    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    pub fn completed_count(&self) -> usize {
        self.completed.len()
    }

    pub fn busy_count(&self) -> usize {
        self.active.iter().filter(|t| t.status.is_busy()).count()
    }

    pub fn get(&self, task_id: &TaskId) -> Option<&DownloadTask> {
        self.active
            .iter()
            .chain(self.completed.iter())
            .find(|t| &t.id == task_id)
    }

    pub fn is_drained(&self) -> bool {
        self.active.is_empty()
    }
}

/// 界面上显示的计数
#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
pub struct TaskCounts {
    pub active: usize,
    pub completed: usize,
    pub busy: usize, // 正在占用并发名额的任务
}

impl From<&RegistrySnapshot> for TaskCounts {
    fn from(snapshot: &RegistrySnapshot) -> Self {
        Self {
            active: snapshot.active_count(),
            completed: snapshot.completed_count(),
            busy: snapshot.busy_count(),
        }
    }
}
