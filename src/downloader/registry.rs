use std::collections::VecDeque;
use std::path::PathBuf;

use chrono::Utc;
use tokio::sync::broadcast;
use tracing::debug;

use super::models::{RegistrySnapshot, TaskEvent, TaskProgress};
use super::task::{DownloadTask, FileRef, TaskId, TaskStatus};

const EVENT_CAPACITY: usize = 1024;

/// 任务表：进行中列表与已完成列表互斥，只做数据和不变量维护，不含调度逻辑
pub struct TaskRegistry {
    active: Vec<DownloadTask>,         // 按创建顺序
    completed: VecDeque<DownloadTask>, // 最新结束的在前
    events: broadcast::Sender<TaskEvent>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self::with_sender(events)
    }

    pub fn with_sender(events: broadcast::Sender<TaskEvent>) -> Self {
        Self {
            active: Vec::new(),
            completed: VecDeque::new(),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.events.subscribe()
    }

    // 没有订阅者时发送失败是正常情况
    fn emit(&self, event: TaskEvent) {
        let _ = self.events.send(event);
    }

    pub fn create(&mut self, file: FileRef, target_directory: PathBuf) -> TaskId {
        let task = DownloadTask::new(file, target_directory);
        let task_id = task.id;
        debug!("创建任务: {} ({})", task_id, task.file.name);
        self.emit(TaskEvent::Added(Box::new(task.clone())));
        self.active.push(task);
        task_id
    }

    pub fn get(&self, task_id: &TaskId) -> Option<&DownloadTask> {
        self.active
            .iter()
            .find(|t| &t.id == task_id)
            .or_else(|| self.completed.iter().find(|t| &t.id == task_id))
    }

    pub fn is_active(&self, task_id: &TaskId) -> bool {
        self.active.iter().any(|t| &t.id == task_id)
    }

    /// 修改进行中的任务，任务不存在（或已结束）时什么也不做
    ///
    /// 返回任务是否存在。状态或进度字段的变化会推送给订阅者。
    pub fn update<F>(&mut self, task_id: &TaskId, mutator: F) -> bool
    where
        F: FnOnce(&mut DownloadTask),
    {
        let Some(task) = self.active.iter_mut().find(|t| &t.id == task_id) else {
            return false;
        };

        let before_status = task.status;
        let before_progress = (task.progress, task.speed, task.downloaded_bytes);
        mutator(task);

        // 终态只能通过 move_to_terminal 进入
        if task.status.is_terminal() {
            task.status = before_status;
        }
        if task.total_bytes > 0 {
            task.downloaded_bytes = task.downloaded_bytes.min(task.total_bytes);
        }
        task.progress = task.progress.clamp(0.0, 100.0);

        let status = task.status;
        let progress = TaskProgress {
            task_id: task.id,
            percent: task.progress,
            speed: task.speed,
            downloaded_bytes: task.downloaded_bytes,
            total_bytes: task.total_bytes,
        };
        let progress_changed =
            before_progress != (progress.percent, progress.speed, progress.downloaded_bytes);

        if status != before_status {
            debug!("任务 {} 状态变更: {} -> {}", task_id, before_status, status);
            self.emit(TaskEvent::StatusChanged {
                task_id: *task_id,
                status,
            });
        }
        if progress_changed {
            self.emit(TaskEvent::Progress(progress));
        }
        true
    }

    /// 移入已完成列表，幂等：已结束的任务保持不变
    pub fn move_to_terminal(&mut self, task_id: &TaskId, success: bool, reason: Option<String>) -> bool {
        let Some(index) = self.active.iter().position(|t| &t.id == task_id) else {
            return false;
        };

        let mut task = self.active.remove(index);
        task.status = if success {
            TaskStatus::Completed
        } else {
            TaskStatus::Error
        };
        task.speed = 0;
        task.completed_at = Some(Utc::now());
        task.error = if success { None } else { reason.clone() };
        if success {
            task.progress = 100.0;
            task.downloaded_bytes = task.total_bytes;
        }

        debug!("任务 {} 结束: {}", task_id, task.status);
        self.emit(TaskEvent::StatusChanged {
            task_id: *task_id,
            status: task.status,
        });
        self.emit(TaskEvent::Terminal {
            task_id: *task_id,
            success,
            reason,
        });
        self.completed.push_front(task);
        true
    }

    /// 从两个列表中删除任务，返回实际删除的ID
    pub fn remove(&mut self, task_ids: &[TaskId]) -> Vec<TaskId> {
        let mut removed = Vec::new();
        self.active.retain(|t| {
            let hit = task_ids.contains(&t.id);
            if hit {
                removed.push(t.id);
            }
            !hit
        });
        self.completed.retain(|t| {
            let hit = task_ids.contains(&t.id);
            if hit {
                removed.push(t.id);
            }
            !hit
        });

        if !removed.is_empty() {
            self.emit(TaskEvent::Removed {
                task_ids: removed.clone(),
            });
        }
        removed
    }

    /// 只删除已完成列表里的任务
    pub fn remove_completed(&mut self, task_ids: &[TaskId]) -> Vec<TaskId> {
        let ids: Vec<TaskId> = self
            .completed
            .iter()
            .filter(|t| task_ids.contains(&t.id))
            .map(|t| t.id)
            .collect();
        self.remove(&ids)
    }

    pub fn clear_completed(&mut self) -> Vec<TaskId> {
        let ids: Vec<TaskId> = self.completed.iter().map(|t| t.id).collect();
        self.remove(&ids)
    }

    pub fn active(&self) -> impl Iterator<Item = &DownloadTask> {
        self.active.iter()
    }

    pub fn active_ids(&self) -> Vec<TaskId> {
        self.active.iter().map(|t| t.id).collect()
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    pub fn completed_count(&self) -> usize {
        self.completed.len()
    }

    pub fn busy_count(&self) -> usize {
        self.active.iter().filter(|t| t.status.is_busy()).count()
    }

    pub fn snapshot(&self) -> RegistrySnapshot {
        RegistrySnapshot {
            active: self.active.clone(),
            completed: self.completed.iter().cloned().collect(),
        }
    }
}

impl Default for TaskRegistry {
    fn default() -> Self {
        Self::new()
    }
}
