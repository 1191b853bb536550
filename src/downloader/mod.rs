//! 下载编排：任务表、调度、编排核心与对外门面

pub mod core;
pub mod dispatcher;
pub mod error;
pub mod manager;
pub mod models;
pub mod progress;
pub mod registry;
pub mod task;

pub use error::DownloadError;
pub use manager::{DownloadManager, ManagerBuilder, ManagerOptions};
pub use models::{RegistrySnapshot, TaskCounts, TaskEvent, TaskProgress};
pub use task::{DownloadTask, FileRef, TaskId, TaskStatus};
