use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::core::{Command, CoreConfig, DownloadCore};
use super::dispatcher::Dispatcher;
use super::error::DownloadError;
use super::models::{RegistrySnapshot, TaskCounts, TaskEvent};
use super::registry::TaskRegistry;
use super::task::{FileRef, TaskId};
use crate::common::config::Settings;
use crate::engine::{DownloadEngine, EngineAdapter};
use crate::session::SessionProvider;

const EVENT_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
pub struct ManagerOptions {
    pub download_dir: PathBuf,
    pub max_concurrent_downloads: usize,
    pub retry_limit: u32,
    pub user_agent: Option<String>,
    pub threads: u32,
    pub poll_interval: Option<Duration>, // None 时不轮询，由调用方推送引擎状态
    pub stop_when_idle: bool,
}

impl ManagerOptions {
    pub fn new(download_dir: impl Into<PathBuf>) -> Self {
        Self {
            download_dir: download_dir.into(),
            max_concurrent_downloads: Dispatcher::MAX_CONCURRENT,
            retry_limit: 3,
            user_agent: None,
            threads: 64,
            poll_interval: Some(Duration::from_secs(1)),
            stop_when_idle: false,
        }
    }

    pub fn from_settings(settings: &Settings, download_dir: impl Into<PathBuf>) -> Self {
        Self {
            download_dir: download_dir.into(),
            max_concurrent_downloads: settings.max_concurrent_downloads as usize,
            retry_limit: settings.retry_limit,
            user_agent: Some(settings.user_agent.clone()).filter(|ua| !ua.is_empty()),
            threads: settings.engine.threads,
            poll_interval: Some(Duration::from_millis(settings.engine.poll_interval_ms.max(100))),
            stop_when_idle: settings.engine.stop_when_idle,
        }
    }
}

#[derive(Default)]
pub struct ManagerBuilder {
    engine: Option<Arc<dyn DownloadEngine>>,
    sessions: Option<Arc<dyn SessionProvider>>,
    options: Option<ManagerOptions>,
}

impl ManagerBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn engine(mut self, engine: Arc<dyn DownloadEngine>) -> Self {
        self.engine = Some(engine);
        self
    }

    pub fn session_provider(mut self, sessions: Arc<dyn SessionProvider>) -> Self {
        self.sessions = Some(sessions);
        self
    }

    pub fn options(mut self, options: ManagerOptions) -> Self {
        self.options = Some(options);
        self
    }

    /// 启动编排器，必须在 tokio 运行时内调用
    pub fn build(self) -> Result<DownloadManager, DownloadError> {
        let engine = self
            .engine
            .ok_or(DownloadError::MissingCapability("download engine"))?;
        let sessions = self
            .sessions
            .ok_or(DownloadError::MissingCapability("session provider"))?;
        let options = self
            .options
            .ok_or(DownloadError::MissingCapability("download directory"))?;

        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let registry = TaskRegistry::with_sender(events.clone());
        let (adapter, engine_events) = EngineAdapter::new(engine);
        let (commands, command_rx) = mpsc::unbounded_channel();

        let poller = CancellationToken::new();
        if let Some(interval) = options.poll_interval {
            Arc::clone(&adapter).spawn_poller(interval, poller.clone());
        }

        let core = DownloadCore::new(
            registry,
            Arc::clone(&adapter),
            sessions,
            CoreConfig {
                download_dir: options.download_dir,
                max_concurrent: options.max_concurrent_downloads,
                retry_limit: options.retry_limit,
                user_agent: options.user_agent,
                threads: options.threads,
                stop_when_idle: options.stop_when_idle,
            },
        );
        tokio::spawn(core.run(command_rx, engine_events));

        Ok(DownloadManager {
            commands,
            events,
            adapter,
            poller,
        })
    }
}

/// 下载管理器门面
///
/// 所有操作都转成消息发给编排器，按到达顺序执行；可以随意 clone。
#[derive(Clone)]
pub struct DownloadManager {
    commands: mpsc::UnboundedSender<Command>,
    events: broadcast::Sender<TaskEvent>,
    adapter: Arc<EngineAdapter>,
    poller: CancellationToken,
}

impl DownloadManager {
    pub fn builder() -> ManagerBuilder {
        ManagerBuilder::new()
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, DownloadError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(command(tx))
            .map_err(|_| DownloadError::Closed)?;
        rx.await.map_err(|_| DownloadError::Closed)
    }

    /// 批量添加文件，`base_dir` 是分享中当前浏览的目录，用来计算本地子目录
    pub async fn add_files(
        &self,
        files: Vec<FileRef>,
        base_dir: Option<String>,
    ) -> Result<Vec<TaskId>, DownloadError> {
        self.request(|reply| Command::AddFiles {
            files,
            base_dir,
            reply,
        })
        .await
    }

    pub async fn pause(&self, task_id: TaskId) -> Result<(), DownloadError> {
        self.request(|reply| Command::Pause { task_id, reply }).await?
    }

    pub async fn resume(&self, task_id: TaskId) -> Result<(), DownloadError> {
        self.request(|reply| Command::Resume { task_id, reply }).await?
    }

    pub async fn cancel(&self, task_id: TaskId) -> Result<(), DownloadError> {
        self.request(|reply| Command::Cancel { task_id, reply }).await?
    }

    /// 重新下载失败的任务，返回新的任务ID
    pub async fn retry(&self, task_id: TaskId) -> Result<TaskId, DownloadError> {
        self.request(|reply| Command::Retry { task_id, reply }).await?
    }

    pub async fn pause_all(&self) -> Result<(), DownloadError> {
        self.request(|reply| Command::PauseAll { reply }).await
    }

    pub async fn resume_all(&self) -> Result<(), DownloadError> {
        self.request(|reply| Command::ResumeAll { reply }).await
    }

    pub async fn remove_completed(&self, task_ids: Vec<TaskId>) -> Result<Vec<TaskId>, DownloadError> {
        self.request(|reply| Command::RemoveCompleted { task_ids, reply })
            .await
    }

    pub async fn clear_completed(&self) -> Result<Vec<TaskId>, DownloadError> {
        self.request(|reply| Command::ClearCompleted { reply }).await
    }

    /// 调整并发上限（1-3），返回实际生效的值；调低不会中断正在下载的任务
    pub async fn set_max_concurrent_downloads(&self, value: usize) -> Result<usize, DownloadError> {
        self.request(|reply| Command::SetMaxConcurrent { value, reply })
            .await
    }

    /// 只影响之后添加的任务
    pub async fn set_download_dir(&self, path: impl Into<PathBuf>) -> Result<(), DownloadError> {
        let path = path.into();
        self.request(|reply| Command::SetDownloadDir { path, reply })
            .await
    }

    pub async fn snapshot(&self) -> Result<RegistrySnapshot, DownloadError> {
        self.request(|reply| Command::Snapshot { reply }).await
    }

    pub async fn counts(&self) -> Result<TaskCounts, DownloadError> {
        let snapshot = self.snapshot().await?;
        Ok(TaskCounts::from(&snapshot))
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.events.subscribe()
    }

    pub fn adapter(&self) -> &Arc<EngineAdapter> {
        &self.adapter
    }

    /// 停止轮询和编排器，并关闭本进程启动的引擎
    pub async fn shutdown(&self) -> Result<(), DownloadError> {
        self.poller.cancel();
        if let Err(e) = self.request(|reply| Command::Shutdown { reply }).await {
            debug!("编排器已经退出: {}", e);
        }
        if let Err(e) = self.adapter.stop().await {
            warn!("停止下载引擎失败: {}", e);
            return Err(e.into());
        }
        Ok(())
    }
}
