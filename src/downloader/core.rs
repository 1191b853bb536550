use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::dispatcher::{DispatchKind, Dispatcher};
use super::error::DownloadError;
use super::models::RegistrySnapshot;
use super::registry::TaskRegistry;
use super::task::{FileRef, TaskId, TaskStatus, resolve_target_directory};
use crate::engine::{AdapterEvent, AddRequest, EngineAdapter, EngineError, EngineHandle, TerminalState};
use crate::session::{DownloadLink, SessionProvider};

type Reply<T> = oneshot::Sender<T>;

/// 用户意图，经由门面发给编排器
pub(crate) enum Command {
    AddFiles {
        files: Vec<FileRef>,
        base_dir: Option<String>,
        reply: Reply<Vec<TaskId>>,
    },
    Pause {
        task_id: TaskId,
        reply: Reply<Result<(), DownloadError>>,
    },
    Resume {
        task_id: TaskId,
        reply: Reply<Result<(), DownloadError>>,
    },
    Cancel {
        task_id: TaskId,
        reply: Reply<Result<(), DownloadError>>,
    },
    Retry {
        task_id: TaskId,
        reply: Reply<Result<TaskId, DownloadError>>,
    },
    PauseAll {
        reply: Reply<()>,
    },
    ResumeAll {
        reply: Reply<()>,
    },
    RemoveCompleted {
        task_ids: Vec<TaskId>,
        reply: Reply<Vec<TaskId>>,
    },
    ClearCompleted {
        reply: Reply<Vec<TaskId>>,
    },
    SetMaxConcurrent {
        value: usize,
        reply: Reply<usize>,
    },
    SetDownloadDir {
        path: PathBuf,
        reply: Reply<()>,
    },
    Snapshot {
        reply: Reply<RegistrySnapshot>,
    },
    Shutdown {
        reply: Reply<()>,
    },
}

// 异步引擎调用的结果，回到编排器里统一处理
enum Internal {
    Started {
        task_id: TaskId,
        link: Option<DownloadLink>,
        result: Result<EngineHandle, DownloadError>,
    },
    ResumeFailed {
        task_id: TaskId,
        error: EngineError,
    },
}

pub(crate) struct CoreConfig {
    pub download_dir: PathBuf,
    pub max_concurrent: usize,
    pub retry_limit: u32,
    pub user_agent: Option<String>,
    pub threads: u32,
    pub stop_when_idle: bool,
}

/// 编排核心：唯一持有任务表的一方
///
/// 用户意图、引擎事件、引擎调用结果都在同一个循环里逐个处理，
/// 任务表不会被并发修改。引擎调用一律 spawn 出去，不阻塞循环。
pub(crate) struct DownloadCore {
    registry: TaskRegistry,
    dispatcher: Dispatcher,
    adapter: Arc<EngineAdapter>,
    sessions: Arc<dyn SessionProvider>,
    links: HashMap<TaskId, DownloadLink>, // 已解析的下载链接，未过期时复用
    in_flight: HashSet<TaskId>,           // 提交调用尚未返回的任务
    controls: HashMap<TaskId, JoinHandle<()>>, // 每个任务最近一次引擎控制调用
    config: CoreConfig,
    engine_stopped: bool,
    internal_tx: mpsc::UnboundedSender<Internal>,
    internal_rx: Option<mpsc::UnboundedReceiver<Internal>>,
}

impl DownloadCore {
    pub fn new(
        registry: TaskRegistry,
        adapter: Arc<EngineAdapter>,
        sessions: Arc<dyn SessionProvider>,
        config: CoreConfig,
    ) -> Self {
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        Self {
            registry,
            dispatcher: Dispatcher::new(config.max_concurrent),
            adapter,
            sessions,
            links: HashMap::new(),
            in_flight: HashSet::new(),
            controls: HashMap::new(),
            config,
            engine_stopped: true,
            internal_tx,
            internal_rx: Some(internal_rx),
        }
    }

    pub async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut engine_events: mpsc::UnboundedReceiver<AdapterEvent>,
    ) {
        let Some(mut internal_rx) = self.internal_rx.take() else {
            return;
        };
        info!("下载编排器已启动，最大并发数: {}", self.dispatcher.max_concurrent());
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Shutdown { reply }) => {
                        let _ = reply.send(());
                        break;
                    }
                    Some(command) => self.handle_command(command),
                    None => break,
                },
                Some(event) = engine_events.recv() => self.handle_engine_event(event),
                Some(message) = internal_rx.recv() => self.handle_internal(message),
            }

            // 每次事件之后重新扫描一次
            self.dispatch();
            self.stop_engine_if_idle();
        }
        info!("下载编排器已退出");
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::AddFiles {
                files,
                base_dir,
                reply,
            } => {
                let ids = self.add_files(files, base_dir);
                let _ = reply.send(ids);
            }
            Command::Pause { task_id, reply } => {
                let _ = reply.send(self.pause_one(task_id));
            }
            Command::Resume { task_id, reply } => {
                let _ = reply.send(self.resume_one(task_id));
            }
            Command::Cancel { task_id, reply } => {
                let _ = reply.send(self.cancel_one(task_id));
            }
            Command::Retry { task_id, reply } => {
                let _ = reply.send(self.retry_one(task_id));
            }
            Command::PauseAll { reply } => {
                self.pause_all();
                let _ = reply.send(());
            }
            Command::ResumeAll { reply } => {
                self.resume_all();
                let _ = reply.send(());
            }
            Command::RemoveCompleted { task_ids, reply } => {
                let _ = reply.send(self.registry.remove_completed(&task_ids));
            }
            Command::ClearCompleted { reply } => {
                let _ = reply.send(self.registry.clear_completed());
            }
            Command::SetMaxConcurrent { value, reply } => {
                if self.dispatcher.set_max_concurrent(value) {
                    debug!("并发上限调高，重新调度");
                }
                let _ = reply.send(self.dispatcher.max_concurrent());
            }
            Command::SetDownloadDir { path, reply } => {
                info!("下载目录变更为: {}", path.display());
                self.config.download_dir = path;
                let _ = reply.send(());
            }
            Command::Snapshot { reply } => {
                let _ = reply.send(self.registry.snapshot());
            }
            // 在 run 里处理
            Command::Shutdown { reply } => {
                let _ = reply.send(());
            }
        }
    }

    // ----------------------------------------------------------------
    // 用户意图

    fn add_files(&mut self, files: Vec<FileRef>, base_dir: Option<String>) -> Vec<TaskId> {
        let ids: Vec<TaskId> = files
            .into_iter()
            .map(|file| {
                let target = resolve_target_directory(
                    &self.config.download_dir,
                    base_dir.as_deref(),
                    &file.path,
                );
                self.registry.create(file, target)
            })
            .collect();
        info!("添加 {} 个下载任务", ids.len());
        ids
    }

    fn active_state(&self, task_id: &TaskId) -> Result<(TaskStatus, Option<EngineHandle>), DownloadError> {
        let task = self
            .registry
            .get(task_id)
            .ok_or(DownloadError::TaskNotFound(*task_id))?;
        if task.status.is_terminal() {
            return Err(DownloadError::InvalidState {
                task_id: *task_id,
                status: task.status,
            });
        }
        Ok((task.status, task.engine_handle.clone()))
    }

    fn pause_one(&mut self, task_id: TaskId) -> Result<(), DownloadError> {
        let (status, handle) = self.active_state(&task_id)?;
        if !status.is_pausable() {
            return Ok(());
        }

        self.registry.update(&task_id, |t| {
            t.status = TaskStatus::Paused;
            t.speed = 0;
        });

        // 等待中/创建中的任务还没有进入引擎，无需调用
        if matches!(status, TaskStatus::Downloading | TaskStatus::Processing) {
            if let Some(handle) = handle {
                self.spawn_engine_pause(task_id, handle);
            }
        }
        debug!("任务 {} 已暂停", task_id);
        Ok(())
    }

    fn resume_one(&mut self, task_id: TaskId) -> Result<(), DownloadError> {
        let (status, handle) = self.active_state(&task_id)?;
        if status != TaskStatus::Paused {
            return Ok(());
        }

        match handle {
            // 下载过的任务：有名额就直接恢复，否则排队等名额
            Some(handle) if self.dispatcher.free_slots(&self.registry) > 0 => {
                self.registry
                    .update(&task_id, |t| t.status = TaskStatus::Downloading);
                self.spawn_engine_resume(task_id, handle);
            }
            // 从未开始过的任务回到等待队列，重新走一遍调度
            _ => {
                self.registry
                    .update(&task_id, |t| t.status = TaskStatus::Waiting);
            }
        }
        debug!("任务 {} 已恢复", task_id);
        Ok(())
    }

    fn cancel_one(&mut self, task_id: TaskId) -> Result<(), DownloadError> {
        let (_, handle) = self.active_state(&task_id)?;

        self.registry.remove(&[task_id]);
        self.links.remove(&task_id);
        if let Some(handle) = handle {
            self.spawn_engine_cancel(task_id, handle);
        }
        // 提交中的任务留在 in_flight 里，句柄返回时再取消
        info!("任务 {} 已取消", task_id);
        Ok(())
    }

    /// 失败的任务以新ID重新排队，旧记录删除
    fn retry_one(&mut self, task_id: TaskId) -> Result<TaskId, DownloadError> {
        let task = self
            .registry
            .get(&task_id)
            .ok_or(DownloadError::TaskNotFound(task_id))?;
        if task.status != TaskStatus::Error {
            return Err(DownloadError::InvalidState {
                task_id,
                status: task.status,
            });
        }

        let file = task.file.clone();
        let target = task.target_directory.clone();
        self.registry.remove(&[task_id]);
        self.controls.remove(&task_id);
        let new_id = self.registry.create(file, target);
        info!("任务 {} 重新排队为 {}", task_id, new_id);
        Ok(new_id)
    }

    fn pause_all(&mut self) {
        for task_id in self.registry.active_ids() {
            if let Err(e) = self.pause_one(task_id) {
                debug!("暂停 {} 跳过: {}", task_id, e);
            }
        }
    }

    fn resume_all(&mut self) {
        for task_id in self.registry.active_ids() {
            if let Err(e) = self.resume_one(task_id) {
                debug!("恢复 {} 跳过: {}", task_id, e);
            }
        }
    }

    // ----------------------------------------------------------------
    // 调度

    fn dispatch(&mut self) {
        for dispatch in self.dispatcher.select(&self.registry, &self.in_flight) {
            match dispatch.kind {
                DispatchKind::Fresh => self.start_task(dispatch.task_id),
                DispatchKind::Resume(handle) => {
                    self.registry
                        .update(&dispatch.task_id, |t| t.status = TaskStatus::Downloading);
                    self.spawn_engine_resume(dispatch.task_id, handle);
                }
            }
        }
    }

    fn start_task(&mut self, task_id: TaskId) {
        let Some(task) = self.registry.get(&task_id) else {
            return;
        };
        let file = task.file.clone();
        let dir = task.target_directory.clone();

        self.registry
            .update(&task_id, |t| t.status = TaskStatus::Creating);
        self.in_flight.insert(task_id);
        self.engine_stopped = false;

        let cached = self
            .links
            .get(&task_id)
            .filter(|link| link.is_fresh(Utc::now()))
            .cloned();
        let submit = Submit {
            adapter: Arc::clone(&self.adapter),
            sessions: Arc::clone(&self.sessions),
            task_id,
            file,
            dir,
            cached,
            user_agent: self.config.user_agent.clone(),
            threads: self.config.threads,
        };
        let tx = self.internal_tx.clone();

        info!("开始下载任务: {} ({})", task_id, submit.file.name);
        tokio::spawn(async move {
            let (link, result) = submit.run().await;
            let _ = tx.send(Internal::Started {
                task_id,
                link,
                result,
            });
        });
    }

    /// 同一任务的引擎控制调用按发出的顺序执行
    ///
    /// 新的调用先等上一个调用返回，连续的暂停/恢复不会在引擎端乱序。
    fn spawn_control<F>(&mut self, task_id: TaskId, call: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let previous = self.controls.remove(&task_id);
        let next = tokio::spawn(async move {
            if let Some(previous) = previous {
                let _ = previous.await;
            }
            call.await;
        });
        self.controls.insert(task_id, next);
    }

    fn control_pending(&self, task_id: &TaskId) -> bool {
        self.controls
            .get(task_id)
            .is_some_and(|call| !call.is_finished())
    }

    fn spawn_engine_pause(&mut self, task_id: TaskId, handle: EngineHandle) {
        let adapter = Arc::clone(&self.adapter);
        self.spawn_control(task_id, async move {
            if let Err(e) = adapter.pause(&handle).await {
                // 本地状态为准
                warn!("暂停任务 {} 失败: {}", task_id, e);
            }
        });
    }

    fn spawn_engine_resume(&mut self, task_id: TaskId, handle: EngineHandle) {
        let adapter = Arc::clone(&self.adapter);
        let tx = self.internal_tx.clone();
        self.spawn_control(task_id, async move {
            if let Err(error) = adapter.resume(&handle).await {
                let _ = tx.send(Internal::ResumeFailed { task_id, error });
            }
        });
    }

    // 排在已发出的控制调用之后；任务已经不在了，不再跟踪
    fn spawn_engine_cancel(&mut self, task_id: TaskId, handle: EngineHandle) {
        let adapter = Arc::clone(&self.adapter);
        self.spawn_control(task_id, async move {
            if let Err(e) = adapter.cancel(&handle).await {
                warn!("撤销引擎任务 {} 失败: {}", handle, e);
            }
        });
        self.controls.remove(&task_id);
    }

    /// 引擎报告的状态与本地意图相反时，重新下发本地意图
    ///
    /// 还有控制调用没返回时不处理：那次调用就是最新的意图，
    /// 这条状态多半是在它生效之前查到的。
    fn reconcile(&mut self, task_id: TaskId, handle: EngineHandle, running: bool) {
        if self.control_pending(&task_id) {
            return;
        }
        debug!(
            "任务 {} 的引擎状态与本地不一致，重新{}",
            task_id,
            if running { "恢复" } else { "暂停" }
        );
        let adapter = Arc::clone(&self.adapter);
        self.spawn_control(task_id, async move {
            let result = if running {
                adapter.resume(&handle).await
            } else {
                adapter.pause(&handle).await
            };
            if let Err(e) = result {
                debug!("同步任务 {} 的引擎状态失败: {}", task_id, e);
            }
        });
    }

    fn handle_in(&self, task_id: &TaskId, statuses: &[TaskStatus]) -> Option<EngineHandle> {
        self.registry
            .get(task_id)
            .filter(|t| statuses.contains(&t.status))
            .and_then(|t| t.engine_handle.clone())
    }

    fn stop_engine_if_idle(&mut self) {
        if !self.config.stop_when_idle
            || self.engine_stopped
            || self.registry.active_count() > 0
            || !self.in_flight.is_empty()
        {
            return;
        }
        self.engine_stopped = true;
        let adapter = Arc::clone(&self.adapter);
        tokio::spawn(async move {
            if let Err(e) = adapter.stop().await {
                warn!("停止下载引擎失败: {}", e);
            }
        });
    }

    // ----------------------------------------------------------------
    // 引擎调用结果与引擎事件

    fn handle_internal(&mut self, message: Internal) {
        match message {
            Internal::Started {
                task_id,
                link,
                result,
            } => self.handle_started(task_id, link, result),
            Internal::ResumeFailed { task_id, error } => {
                warn!("恢复任务 {} 失败: {}", task_id, error);
                self.registry.update(&task_id, |t| {
                    if t.status == TaskStatus::Downloading {
                        t.status = TaskStatus::Paused;
                        t.speed = 0;
                    }
                });
            }
        }
    }

    fn handle_started(
        &mut self,
        task_id: TaskId,
        link: Option<DownloadLink>,
        result: Result<EngineHandle, DownloadError>,
    ) {
        self.in_flight.remove(&task_id);
        let status = self
            .registry
            .get(&task_id)
            .map(|t| t.status)
            .filter(|s| !s.is_terminal());

        match result {
            Ok(handle) => {
                let Some(status) = status else {
                    // 提交过程中任务被取消：晚到的句柄立即取消并丢弃
                    info!("任务 {} 已取消，撤销引擎任务 {}", task_id, handle);
                    self.spawn_engine_cancel(task_id, handle);
                    return;
                };

                if let Some(link) = link {
                    self.links.insert(task_id, link);
                }
                match status {
                    TaskStatus::Paused => {
                        self.set_handle(&task_id, handle.clone(), None);
                        self.spawn_engine_pause(task_id, handle);
                    }
                    TaskStatus::Waiting if self.dispatcher.free_slots(&self.registry) == 0 => {
                        // 提交途中被暂停又恢复，名额已被占用：先在引擎里暂停，等调度恢复
                        self.set_handle(&task_id, handle.clone(), None);
                        self.spawn_engine_pause(task_id, handle);
                    }
                    TaskStatus::Creating | TaskStatus::Waiting => {
                        self.set_handle(&task_id, handle, Some(TaskStatus::Downloading));
                        info!("任务 {} 开始传输", task_id);
                    }
                    _ => self.set_handle(&task_id, handle, None),
                }
            }
            Err(error) => {
                if status.is_none() {
                    debug!("已取消的任务 {} 提交失败: {}", task_id, error);
                    return;
                }
                match error {
                    error if error.is_retryable() => {
                        // 链接已经拿到，重试时复用
                        if let Some(link) = link {
                            self.links.insert(task_id, link);
                        }
                        self.fail_or_retry(task_id, error);
                    }
                    error => {
                        warn!("任务 {} 无法开始: {}", task_id, error);
                        self.links.remove(&task_id);
                        self.controls.remove(&task_id);
                        self.registry
                            .move_to_terminal(&task_id, false, Some(error.reason()));
                    }
                }
            }
        }
    }

    fn set_handle(&mut self, task_id: &TaskId, handle: EngineHandle, status: Option<TaskStatus>) {
        self.registry.update(task_id, |t| {
            t.engine_handle = Some(handle);
            if let Some(status) = status {
                t.status = status;
            }
        });
    }

    /// 可恢复的失败：重试次数内回到等待队列（保持原来的排队位置），否则结束
    fn fail_or_retry(&mut self, task_id: TaskId, error: DownloadError) {
        if !self.registry.is_active(&task_id) {
            return;
        }
        let retry_count = self
            .registry
            .get(&task_id)
            .map(|t| t.retry_count)
            .unwrap_or_default();

        if retry_count < self.config.retry_limit {
            warn!("任务 {} 失败，第 {} 次重试: {}", task_id, retry_count + 1, error);
            self.registry.update(&task_id, |t| {
                t.retry_count += 1;
                t.engine_handle = None;
                t.speed = 0;
                if t.status != TaskStatus::Paused {
                    t.status = TaskStatus::Waiting;
                }
            });
        } else {
            error!("任务 {} 重试次数已用完: {}", task_id, error);
            self.links.remove(&task_id);
            self.controls.remove(&task_id);
            self.registry
                .move_to_terminal(&task_id, false, Some(error.reason()));
        }
    }

    fn handle_engine_event(&mut self, event: AdapterEvent) {
        match event {
            AdapterEvent::Progress {
                task_id,
                downloaded_bytes,
                total_bytes,
                speed,
                processing,
            } => {
                self.registry.update(&task_id, |t| {
                    let running = matches!(
                        t.status,
                        TaskStatus::Creating | TaskStatus::Downloading | TaskStatus::Processing
                    );
                    // 传输中进度不回退
                    let downloaded = if running {
                        downloaded_bytes.max(t.downloaded_bytes)
                    } else {
                        downloaded_bytes
                    };
                    let total = if t.total_bytes > 0 {
                        t.total_bytes
                    } else {
                        total_bytes
                    };

                    t.downloaded_bytes = downloaded;
                    t.speed = if running { speed } else { 0 };
                    t.progress = if total > 0 {
                        (downloaded as f64 / total as f64 * 100.0).min(100.0)
                    } else {
                        0.0
                    };
                    if running {
                        t.status = if processing {
                            TaskStatus::Processing
                        } else {
                            TaskStatus::Downloading
                        };
                    }
                });
            }
            // 暂停与否以本地意图为准，引擎状态不改写任务状态
            AdapterEvent::Active { task_id } => {
                // 已暂停或排队等名额的任务在引擎里仍在传输
                if let Some(handle) =
                    self.handle_in(&task_id, &[TaskStatus::Paused, TaskStatus::Waiting])
                {
                    self.reconcile(task_id, handle, false);
                }
            }
            AdapterEvent::Paused { task_id } => {
                if let Some(handle) =
                    self.handle_in(&task_id, &[TaskStatus::Downloading, TaskStatus::Processing])
                {
                    self.reconcile(task_id, handle, true);
                }
            }
            AdapterEvent::Terminal {
                task_id,
                state: TerminalState::Completed,
            } => {
                self.links.remove(&task_id);
                self.controls.remove(&task_id);
                if self.registry.move_to_terminal(&task_id, true, None) {
                    info!("✅ 下载任务完成: {}", task_id);
                }
            }
            AdapterEvent::Terminal {
                task_id,
                state: TerminalState::Failed(reason),
            } => {
                // 链接可能已经失效，重试时重新获取
                self.links.remove(&task_id);
                self.fail_or_retry(task_id, DownloadError::TransferFailed(reason));
            }
        }
    }
}

// 一次提交：获取（或复用）链接，再交给引擎
struct Submit {
    adapter: Arc<EngineAdapter>,
    sessions: Arc<dyn SessionProvider>,
    task_id: TaskId,
    file: FileRef,
    dir: PathBuf,
    cached: Option<DownloadLink>,
    user_agent: Option<String>,
    threads: u32,
}

impl Submit {
    async fn run(self) -> (Option<DownloadLink>, Result<EngineHandle, DownloadError>) {
        let link = match self.cached {
            Some(link) => {
                debug!("复用未过期的下载链接: {}", self.task_id);
                link
            }
            None => match self.sessions.download_link(&self.file).await {
                Ok(link) => link,
                Err(e) => return (None, Err(e.into())),
            },
        };

        let request = AddRequest {
            url: link.url.clone(),
            dir: self.dir,
            out: self.file.name.clone(),
            headers: link.headers.clone(),
            user_agent: link.user_agent.clone().or(self.user_agent),
            split: self.threads,
        };
        let result = self
            .adapter
            .start(self.task_id, &request)
            .await
            .map_err(DownloadError::from);
        (Some(link), result)
    }
}
