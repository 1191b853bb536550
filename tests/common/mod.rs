#![allow(dead_code)]

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;

use share_downloader::downloader::{
    DownloadManager, FileRef, ManagerOptions, RegistrySnapshot, TaskId,
};
use share_downloader::engine::{
    AddRequest, DownloadEngine, EngineError, EngineHandle, EngineState, EngineStatus,
};
use share_downloader::session::{self, DownloadLink, LinkError, SessionProvider};

/// 记录所有调用的引擎替身，句柄按提交顺序编号 gid-1, gid-2 ...
#[derive(Default)]
pub struct MockEngine {
    next: AtomicU64,
    calls: Mutex<Vec<String>>,
    add_failures: Mutex<VecDeque<EngineError>>,
    launch_failure: Mutex<Option<EngineError>>,
    forgotten: Mutex<HashSet<String>>,
    statuses: Mutex<HashMap<String, EngineStatus>>,
    requests: Mutex<Vec<AddRequest>>,
    pause_delay: Mutex<Option<Duration>>,
}

impl MockEngine {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_next_add(&self, error: EngineError) {
        self.add_failures.lock().unwrap().push_back(error);
    }

    pub fn fail_launch(&self, error: EngineError) {
        *self.launch_failure.lock().unwrap() = Some(error);
    }

    /// 模拟引擎重启后忘记了某个句柄
    pub fn forget(&self, handle: &str) {
        self.forgotten.lock().unwrap().insert(handle.to_string());
    }

    /// 暂停调用要过一段时间才到达引擎
    pub fn delay_pause(&self, delay: Duration) {
        *self.pause_delay.lock().unwrap() = Some(delay);
    }

    pub fn set_status(&self, status: EngineStatus) {
        self.statuses
            .lock()
            .unwrap()
            .insert(status.handle.as_str().to_string(), status);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, call: &str) -> usize {
        self.calls().iter().filter(|c| c.as_str() == call).count()
    }

    pub fn requests(&self) -> Vec<AddRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub async fn wait_call(&self, call: &str) {
        self.wait_calls(call, 1).await;
    }

    pub async fn wait_calls(&self, call: &str, times: usize) {
        for _ in 0..200 {
            if self.count(call) >= times {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("引擎没有收到 {} 次调用 {}，实际调用: {:?}", times, call, self.calls());
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }

    fn check(&self, handle: &EngineHandle) -> Result<(), EngineError> {
        if self.forgotten.lock().unwrap().contains(handle.as_str()) {
            return Err(EngineError::UnknownHandle(handle.to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl DownloadEngine for MockEngine {
    async fn launch(&self) -> Result<(), EngineError> {
        self.record("launch".to_string());
        match self.launch_failure.lock().unwrap().take() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    async fn shutdown(&self) -> Result<(), EngineError> {
        self.record("shutdown".to_string());
        Ok(())
    }

    async fn add_uri(&self, request: &AddRequest) -> Result<EngineHandle, EngineError> {
        self.record(format!("add:{}", request.out));
        if let Some(error) = self.add_failures.lock().unwrap().pop_front() {
            return Err(error);
        }
        self.requests.lock().unwrap().push(request.clone());
        let id = self.next.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(EngineHandle::new(format!("gid-{}", id)))
    }

    async fn pause(&self, handle: &EngineHandle) -> Result<(), EngineError> {
        let delay = *self.pause_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.record(format!("pause:{}", handle));
        self.check(handle)
    }

    async fn unpause(&self, handle: &EngineHandle) -> Result<(), EngineError> {
        self.record(format!("unpause:{}", handle));
        self.check(handle)
    }

    async fn remove(&self, handle: &EngineHandle) -> Result<(), EngineError> {
        self.record(format!("remove:{}", handle));
        self.check(handle)
    }

    async fn tell_status(&self, handle: &EngineHandle) -> Result<EngineStatus, EngineError> {
        self.statuses
            .lock()
            .unwrap()
            .get(handle.as_str())
            .cloned()
            .ok_or_else(|| EngineError::UnknownHandle(handle.to_string()))
    }
}

/// 链接签发替身；可以让某些文件失败，或者卡住直到放行
#[derive(Default)]
pub struct MockSessions {
    calls: AtomicUsize,
    failing: Mutex<HashMap<String, LinkError>>,
    gates: Mutex<HashMap<String, Arc<Notify>>>,
    expires_in: Mutex<Option<chrono::Duration>>,
}

impl MockSessions {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail(&self, name: &str, error: LinkError) {
        self.failing.lock().unwrap().insert(name.to_string(), error);
    }

    pub fn recover(&self, name: &str) {
        self.failing.lock().unwrap().remove(name);
    }

    /// 该文件的链接请求会一直等待，直到调用返回的 Notify
    pub fn gate(&self, name: &str) -> Arc<Notify> {
        let notify = Arc::new(Notify::new());
        self.gates
            .lock()
            .unwrap()
            .insert(name.to_string(), Arc::clone(&notify));
        notify
    }

    pub fn expire_links_in(&self, duration: chrono::Duration) {
        *self.expires_in.lock().unwrap() = Some(duration);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SessionProvider for MockSessions {
    async fn download_link(&self, file: &FileRef) -> session::Result<DownloadLink> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let gate = self.gates.lock().unwrap().get(&file.name).cloned();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        if let Some(error) = self.failing.lock().unwrap().get(&file.name) {
            return Err(error.clone());
        }

        let mut link = DownloadLink::new(format!("https://dl.example.com/{}", file.fs_id));
        link.headers = vec!["Referer: https://pan.example.com/".to_string()];
        link.expires_at = self
            .expires_in
            .lock()
            .unwrap()
            .map(|d| chrono::Utc::now() + d);
        Ok(link)
    }
}

pub fn file(name: &str, size: u64) -> FileRef {
    FileRef {
        fs_id: format!("fs-{}", name),
        name: name.to_string(),
        size,
        path: format!("/share/{}", name),
    }
}

pub fn options(max_concurrent: usize) -> ManagerOptions {
    let mut options = ManagerOptions::new(PathBuf::from("/tmp/sharedl-test"));
    options.max_concurrent_downloads = max_concurrent;
    options.poll_interval = None;
    options
}

pub fn build_manager(
    engine: &Arc<MockEngine>,
    sessions: &Arc<MockSessions>,
    options: ManagerOptions,
) -> DownloadManager {
    DownloadManager::builder()
        .engine(Arc::clone(engine) as Arc<dyn DownloadEngine>)
        .session_provider(Arc::clone(sessions) as Arc<dyn SessionProvider>)
        .options(options)
        .build()
        .unwrap()
}

/// 轮询快照直到条件满足
pub async fn wait_for<F>(manager: &DownloadManager, mut condition: F) -> RegistrySnapshot
where
    F: FnMut(&RegistrySnapshot) -> bool,
{
    let mut last = None;
    for _ in 0..200 {
        let snapshot = manager.snapshot().await.unwrap();
        if condition(&snapshot) {
            return snapshot;
        }
        last = Some(snapshot);
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("等待超时，最后的快照: {:#?}", last);
}

pub fn status_of(snapshot: &RegistrySnapshot, task_id: &TaskId) -> Option<share_downloader::downloader::TaskStatus> {
    snapshot.get(task_id).map(|t| t.status)
}

pub fn handle_of(snapshot: &RegistrySnapshot, task_id: &TaskId) -> EngineHandle {
    snapshot
        .get(task_id)
        .and_then(|t| t.engine_handle.clone())
        .unwrap()
}

pub fn engine_status(handle: &EngineHandle, state: EngineState, completed: u64, total: u64) -> EngineStatus {
    EngineStatus {
        handle: handle.clone(),
        state,
        total_length: total,
        completed_length: completed,
        download_speed: if state == EngineState::Active { 1024 } else { 0 },
        error_message: None,
    }
}
