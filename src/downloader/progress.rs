use std::collections::HashMap;

use indicatif::{MultiProgress, ProgressBar, ProgressStyle};

use super::models::TaskEvent;
use super::task::{DownloadTask, TaskId, TaskStatus};

const BAR_TEMPLATE: &str =
    "{msg:30!} [{elapsed_precise}] {wide_bar:.cyan/blue} {bytes}/{total_bytes} {bytes_per_sec} {prefix}";

/// 终端进度面板，每个任务一条进度条
pub struct ProgressBoard {
    multi: MultiProgress,
    style: ProgressStyle,
    bars: HashMap<TaskId, ProgressBar>,
}

impl ProgressBoard {
    pub fn new() -> Self {
        Self::with_target(MultiProgress::new())
    }

    /// 测试时可以传入隐藏的 MultiProgress
    pub fn with_target(multi: MultiProgress) -> Self {
        let style = ProgressStyle::default_bar()
            .template(BAR_TEMPLATE)
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("█▉▊▋▌▍▎▏ ");
        Self {
            multi,
            style,
            bars: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.bars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bars.is_empty()
    }

    fn add_bar(&mut self, task: &DownloadTask) {
        let bar = self.multi.add(ProgressBar::new(task.total_bytes));
        bar.set_style(self.style.clone());
        bar.set_message(task.file.name.clone());
        bar.set_prefix(task.status.to_string());
        bar.set_position(task.downloaded_bytes);
        self.bars.insert(task.id, bar);
    }

    /// 应用一条任务事件
    pub fn handle(&mut self, event: &TaskEvent) {
        match event {
            TaskEvent::Added(task) => self.add_bar(task),
            TaskEvent::StatusChanged { task_id, status } => {
                if let Some(bar) = self.bars.get(task_id) {
                    bar.set_prefix(status.to_string());
                }
            }
            TaskEvent::Progress(progress) => {
                if let Some(bar) = self.bars.get(&progress.task_id) {
                    if bar.length() != Some(progress.total_bytes) && progress.total_bytes > 0 {
                        bar.set_length(progress.total_bytes);
                    }
                    bar.set_position(progress.downloaded_bytes);
                }
            }
            TaskEvent::Terminal {
                task_id,
                success,
                reason,
            } => {
                if let Some(bar) = self.bars.remove(task_id) {
                    if *success {
                        bar.set_prefix(TaskStatus::Completed.to_string());
                        bar.finish();
                    } else {
                        bar.abandon_with_message(format!(
                            "失败: {}",
                            reason.as_deref().unwrap_or("未知错误")
                        ));
                    }
                }
            }
            TaskEvent::Removed { task_ids } => {
                for task_id in task_ids {
                    if let Some(bar) = self.bars.remove(task_id) {
                        bar.finish_and_clear();
                    }
                }
            }
        }
    }

    /// 在进度条上方打印一行，不打乱进度条
    pub fn println(&self, message: impl AsRef<str>) {
        if self.multi.println(message.as_ref()).is_err() {
            println!("{}", message.as_ref());
        }
    }
}

impl Default for ProgressBoard {
    fn default() -> Self {
        Self::new()
    }
}
