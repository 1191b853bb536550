use thiserror::Error;

use super::task::{TaskId, TaskStatus};
use crate::engine::EngineError;
use crate::session::LinkError;

#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("下载链接不可用: {reason}")]
    LinkUnavailable { reason: String, expired: bool },

    #[error("下载引擎不可用: {0}")]
    EngineUnavailable(String),

    #[error("下载引擎拒绝任务: {0}")]
    EngineRejected(String),

    #[error("传输失败: {0}")]
    TransferFailed(String),

    #[error("任务未找到: {0}")]
    TaskNotFound(TaskId),

    #[error("任务 {task_id} 当前状态为 {status}，无法执行该操作")]
    InvalidState { task_id: TaskId, status: TaskStatus },

    #[error("缺少必需的组件: {0}")]
    MissingCapability(&'static str),

    #[error("下载管理器已停止")]
    Closed,
}

impl DownloadError {
    // 可重试的错误在重试次数耗尽之前对用户不可见
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            DownloadError::EngineUnavailable(_) | DownloadError::TransferFailed(_)
        )
    }

    /// 写入已完成列表中的失败原因
    pub fn reason(&self) -> String {
        match self {
            DownloadError::LinkUnavailable { reason, .. } => {
                format!("link-unavailable: {}", reason)
            }
            other => other.to_string(),
        }
    }
}

impl From<EngineError> for DownloadError {
    fn from(error: EngineError) -> Self {
        match error {
            EngineError::Unavailable(msg) => DownloadError::EngineUnavailable(msg),
            EngineError::Rejected(msg) => DownloadError::EngineRejected(msg),
            // 引擎已经忘记的句柄：对调用方来说等同于引擎拒绝
            EngineError::UnknownHandle(handle) => {
                DownloadError::EngineRejected(format!("未知的引擎句柄: {}", handle))
            }
        }
    }
}

impl From<LinkError> for DownloadError {
    fn from(error: LinkError) -> Self {
        DownloadError::LinkUnavailable {
            expired: error.is_expired(),
            reason: error.to_string(),
        }
    }
}
