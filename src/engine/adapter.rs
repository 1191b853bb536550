use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::future::join_all;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{AddRequest, DownloadEngine, EngineError, EngineHandle, EngineState, EngineStatus};
use crate::downloader::task::TaskId;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminalState {
    Completed,
    Failed(String),
}

/// 归一化后的引擎事件，已经从句柄映射回任务ID
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdapterEvent {
    Progress {
        task_id: TaskId,
        downloaded_bytes: u64,
        total_bytes: u64,
        speed: u64,
        processing: bool, // 数据已下载完，引擎仍在收尾
    },
    Active {
        task_id: TaskId,
    },
    Paused {
        task_id: TaskId,
    },
    Terminal {
        task_id: TaskId,
        state: TerminalState,
    },
}

/// 引擎适配器：把编排层的意图翻译成引擎调用，并维护 句柄 -> 任务ID 映射
pub struct EngineAdapter {
    engine: Arc<dyn DownloadEngine>,
    handles: DashMap<EngineHandle, TaskId>,
    launched: Mutex<bool>,
    events: mpsc::UnboundedSender<AdapterEvent>,
}

impl EngineAdapter {
    pub fn new(engine: Arc<dyn DownloadEngine>) -> (Arc<Self>, mpsc::UnboundedReceiver<AdapterEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let adapter = Self {
            engine,
            handles: DashMap::new(),
            launched: Mutex::new(false),
            events: tx,
        };
        (Arc::new(adapter), rx)
    }

    // 第一次 start 时才拉起引擎
    async fn ensure_started(&self) -> Result<(), EngineError> {
        let mut launched = self.launched.lock().await;
        if !*launched {
            info!("启动下载引擎");
            self.engine.launch().await?;
            *launched = true;
        }
        Ok(())
    }

    pub async fn is_running(&self) -> bool {
        *self.launched.lock().await
    }

    /// 提交新任务，成功后记录句柄映射
    pub async fn start(&self, task_id: TaskId, request: &AddRequest) -> Result<EngineHandle, EngineError> {
        self.ensure_started().await?;
        let handle = self.engine.add_uri(request).await?;
        debug!("任务 {} 已提交到引擎: {}", task_id, handle);
        self.handles.insert(handle.clone(), task_id);
        Ok(handle)
    }

    /// 暂停；引擎已经不认识的句柄视为成功
    pub async fn pause(&self, handle: &EngineHandle) -> Result<(), EngineError> {
        match self.engine.pause(handle).await {
            Err(EngineError::UnknownHandle(_)) => {
                debug!("引擎中已不存在 {}，忽略暂停", handle);
                Ok(())
            }
            other => other,
        }
    }

    pub async fn resume(&self, handle: &EngineHandle) -> Result<(), EngineError> {
        match self.engine.unpause(handle).await {
            Err(EngineError::UnknownHandle(_)) => {
                debug!("引擎中已不存在 {}，忽略恢复", handle);
                Ok(())
            }
            other => other,
        }
    }

    /// 取消并丢弃映射，之后该句柄的事件都会被丢弃
    pub async fn cancel(&self, handle: &EngineHandle) -> Result<(), EngineError> {
        self.handles.remove(handle);
        match self.engine.remove(handle).await {
            Err(EngineError::UnknownHandle(_)) => Ok(()),
            other => other,
        }
    }

    pub fn task_for(&self, handle: &EngineHandle) -> Option<TaskId> {
        self.handles.get(handle).map(|entry| *entry.value())
    }

    pub fn tracked(&self) -> usize {
        self.handles.len()
    }

    /// 归一化一条引擎状态并推送；未知句柄的事件直接丢弃
    pub fn ingest(&self, status: EngineStatus) {
        let Some(task_id) = self.task_for(&status.handle) else {
            debug!("丢弃未知句柄的事件: {}", status.handle);
            return;
        };

        let progress = AdapterEvent::Progress {
            task_id,
            downloaded_bytes: status.completed_length,
            total_bytes: status.total_length,
            speed: status.download_speed,
            processing: status.total_length > 0 && status.completed_length >= status.total_length,
        };

        let events = match status.state {
            EngineState::Active | EngineState::Waiting => {
                vec![progress, AdapterEvent::Active { task_id }]
            }
            EngineState::Paused => vec![progress, AdapterEvent::Paused { task_id }],
            EngineState::Complete => {
                self.handles.remove(&status.handle);
                vec![
                    progress,
                    AdapterEvent::Terminal {
                        task_id,
                        state: TerminalState::Completed,
                    },
                ]
            }
            EngineState::Error => {
                self.handles.remove(&status.handle);
                let reason = status
                    .error_message
                    .unwrap_or_else(|| "引擎报告下载失败".to_string());
                vec![AdapterEvent::Terminal {
                    task_id,
                    state: TerminalState::Failed(reason),
                }]
            }
            EngineState::Removed => {
                self.handles.remove(&status.handle);
                vec![AdapterEvent::Terminal {
                    task_id,
                    state: TerminalState::Failed("任务已被引擎移除".to_string()),
                }]
            }
        };

        for event in events {
            // 接收端关闭说明编排器已经退出
            if self.events.send(event).is_err() {
                break;
            }
        }
    }

    /// 查询所有已知句柄的状态
    pub async fn poll_once(&self) {
        if !self.is_running().await {
            return;
        }

        let handles: Vec<EngineHandle> = self.handles.iter().map(|e| e.key().clone()).collect();
        let results = join_all(handles.iter().map(|handle| self.engine.tell_status(handle))).await;

        let mut unavailable = None;
        for (handle, result) in handles.iter().zip(results) {
            match result {
                Ok(status) => self.ingest(status),
                Err(EngineError::UnknownHandle(_)) => {
                    debug!("引擎已忘记句柄 {}，保持本地状态", handle);
                }
                Err(e) => unavailable = Some(e),
            }
        }
        if let Some(e) = unavailable {
            warn!("查询引擎状态失败: {}", e);
        }
    }

    pub fn spawn_poller(self: Arc<Self>, interval: Duration, token: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => self.poll_once().await,
                }
            }
            debug!("引擎状态轮询已停止");
        })
    }

    /// 停止引擎并清空映射
    pub async fn stop(&self) -> Result<(), EngineError> {
        let mut launched = self.launched.lock().await;
        if *launched {
            info!("停止下载引擎");
            self.handles.clear();
            *launched = false;
            self.engine.shutdown().await?;
        }
        Ok(())
    }
}
