mod common;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use common::{MockEngine, engine_status};
use share_downloader::downloader::TaskId;
use share_downloader::engine::{
    AdapterEvent, AddRequest, EngineAdapter, EngineError, EngineHandle, EngineState, TerminalState,
};
use tokio_util::sync::CancellationToken;

fn request(name: &str) -> AddRequest {
    AddRequest {
        url: format!("https://dl.example.com/{}", name),
        dir: PathBuf::from("/tmp/sharedl-test"),
        out: name.to_string(),
        headers: Vec::new(),
        user_agent: None,
        split: 8,
    }
}

#[tokio::test]
async fn test_engine_launches_lazily_once() {
    let engine = MockEngine::new();
    let (adapter, _events) = EngineAdapter::new(engine.clone());
    assert!(!adapter.is_running().await);
    assert!(engine.calls().is_empty());

    let first = adapter.start(TaskId::new(), &request("a.bin")).await.unwrap();
    let second = adapter.start(TaskId::new(), &request("b.bin")).await.unwrap();

    assert_ne!(first, second);
    assert_eq!(engine.count("launch"), 1);
    assert!(adapter.is_running().await);
    assert_eq!(adapter.tracked(), 2);
}

#[tokio::test]
async fn test_launch_failure_reaches_start_caller() {
    let engine = MockEngine::new();
    engine.fail_launch(EngineError::Unavailable("aria2c not found".to_string()));
    let (adapter, _events) = EngineAdapter::new(engine.clone());

    let result = adapter.start(TaskId::new(), &request("a.bin")).await;
    assert_eq!(
        result,
        Err(EngineError::Unavailable("aria2c not found".to_string()))
    );
    assert!(!adapter.is_running().await);
    assert_eq!(adapter.tracked(), 0);
    assert_eq!(engine.count("add:a.bin"), 0);
}

#[tokio::test]
async fn test_progress_is_mapped_to_task() {
    let engine = MockEngine::new();
    let (adapter, mut events) = EngineAdapter::new(engine);
    let task_id = TaskId::new();
    let handle = adapter.start(task_id, &request("a.bin")).await.unwrap();

    adapter.ingest(engine_status(&handle, EngineState::Active, 25, 100));
    assert_eq!(
        events.try_recv().unwrap(),
        AdapterEvent::Progress {
            task_id,
            downloaded_bytes: 25,
            total_bytes: 100,
            speed: 1024,
            processing: false,
        }
    );
    assert_eq!(events.try_recv().unwrap(), AdapterEvent::Active { task_id });

    // 数据下载完、引擎仍是 active 时视为收尾阶段
    adapter.ingest(engine_status(&handle, EngineState::Active, 100, 100));
    assert!(matches!(
        events.try_recv().unwrap(),
        AdapterEvent::Progress { processing: true, .. }
    ));
}

#[tokio::test]
async fn test_terminal_states_forget_handle() {
    let engine = MockEngine::new();
    let (adapter, mut events) = EngineAdapter::new(engine);
    let done = TaskId::new();
    let failed = TaskId::new();
    let removed = TaskId::new();
    let done_handle = adapter.start(done, &request("a.bin")).await.unwrap();
    let failed_handle = adapter.start(failed, &request("b.bin")).await.unwrap();
    let removed_handle = adapter.start(removed, &request("c.bin")).await.unwrap();

    adapter.ingest(engine_status(&done_handle, EngineState::Complete, 100, 100));
    assert!(matches!(events.try_recv().unwrap(), AdapterEvent::Progress { .. }));
    assert_eq!(
        events.try_recv().unwrap(),
        AdapterEvent::Terminal {
            task_id: done,
            state: TerminalState::Completed,
        }
    );

    let mut status = engine_status(&failed_handle, EngineState::Error, 10, 100);
    status.error_message = Some("resource not found".to_string());
    adapter.ingest(status);
    assert_eq!(
        events.try_recv().unwrap(),
        AdapterEvent::Terminal {
            task_id: failed,
            state: TerminalState::Failed("resource not found".to_string()),
        }
    );

    adapter.ingest(engine_status(&removed_handle, EngineState::Removed, 0, 100));
    assert!(matches!(
        events.try_recv().unwrap(),
        AdapterEvent::Terminal { task_id, state: TerminalState::Failed(_) } if task_id == removed
    ));

    assert_eq!(adapter.tracked(), 0);
    assert!(adapter.task_for(&done_handle).is_none());

    // 句柄已忘记，重复的终态事件被丢弃
    adapter.ingest(engine_status(&done_handle, EngineState::Complete, 100, 100));
    assert!(events.try_recv().is_err());
}

#[tokio::test]
async fn test_paused_state_emits_pause_event() {
    let engine = MockEngine::new();
    let (adapter, mut events) = EngineAdapter::new(engine);
    let task_id = TaskId::new();
    let handle = adapter.start(task_id, &request("a.bin")).await.unwrap();

    adapter.ingest(engine_status(&handle, EngineState::Paused, 40, 100));
    assert!(matches!(events.try_recv().unwrap(), AdapterEvent::Progress { .. }));
    assert_eq!(events.try_recv().unwrap(), AdapterEvent::Paused { task_id });
    assert_eq!(adapter.tracked(), 1);
}

#[tokio::test]
async fn test_unknown_handle_is_dropped() {
    let engine = MockEngine::new();
    let (adapter, mut events) = EngineAdapter::new(engine);
    adapter.ingest(engine_status(
        &EngineHandle::new("gid-404"),
        EngineState::Complete,
        1,
        1,
    ));
    assert!(events.try_recv().is_err());
}

#[tokio::test]
async fn test_control_calls_on_forgotten_handle_succeed() {
    let engine = MockEngine::new();
    let (adapter, _events) = EngineAdapter::new(engine.clone());
    let handle = adapter.start(TaskId::new(), &request("a.bin")).await.unwrap();
    engine.forget(handle.as_str());

    assert_eq!(adapter.pause(&handle).await, Ok(()));
    assert_eq!(adapter.resume(&handle).await, Ok(()));
    assert_eq!(adapter.cancel(&handle).await, Ok(()));
    assert_eq!(adapter.tracked(), 0);
    assert_eq!(engine.count(&format!("remove:{}", handle)), 1);
}

#[tokio::test]
async fn test_poller_feeds_event_stream() {
    let engine = MockEngine::new();
    let (adapter, mut events) = EngineAdapter::new(engine.clone());
    let task_id = TaskId::new();
    let handle = adapter.start(task_id, &request("a.bin")).await.unwrap();
    engine.set_status(engine_status(&handle, EngineState::Complete, 100, 100));

    let token = CancellationToken::new();
    let poller = Arc::clone(&adapter).spawn_poller(Duration::from_millis(10), token.clone());

    let mut completed = false;
    while !completed {
        let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .unwrap()
            .unwrap();
        completed = matches!(
            event,
            AdapterEvent::Terminal { state: TerminalState::Completed, .. }
        );
    }

    token.cancel();
    poller.await.unwrap();
    assert_eq!(adapter.tracked(), 0);
}

#[tokio::test]
async fn test_stop_shuts_down_launched_engine() {
    let engine = MockEngine::new();
    let (adapter, _events) = EngineAdapter::new(engine.clone());

    // 没启动过的引擎不需要关闭
    adapter.stop().await.unwrap();
    assert_eq!(engine.count("shutdown"), 0);

    adapter.start(TaskId::new(), &request("a.bin")).await.unwrap();
    adapter.stop().await.unwrap();
    assert_eq!(engine.count("shutdown"), 1);
    assert_eq!(adapter.tracked(), 0);
    assert!(!adapter.is_running().await);

    // 再次提交会重新拉起引擎
    adapter.start(TaskId::new(), &request("b.bin")).await.unwrap();
    assert_eq!(engine.count("launch"), 2);
}
