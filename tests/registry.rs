use std::collections::HashSet;
use std::path::{Path, PathBuf};

use share_downloader::downloader::dispatcher::{DispatchKind, Dispatcher};
use share_downloader::downloader::registry::TaskRegistry;
use share_downloader::downloader::task::resolve_target_directory;
use share_downloader::downloader::{FileRef, TaskEvent, TaskId, TaskStatus};
use share_downloader::engine::EngineHandle;

fn file(name: &str, size: u64) -> FileRef {
    FileRef {
        fs_id: name.to_string(),
        name: name.to_string(),
        size,
        path: format!("/{}", name),
    }
}

fn registry_with(names: &[&str]) -> (TaskRegistry, Vec<TaskId>) {
    let mut registry = TaskRegistry::new();
    let ids = names
        .iter()
        .map(|name| registry.create(file(name, 100), PathBuf::from("/downloads")))
        .collect();
    (registry, ids)
}

#[test]
fn test_update_unknown_task_is_noop() {
    let (mut registry, _) = registry_with(&["a.bin"]);
    let mut events = registry.subscribe();

    let touched = registry.update(&TaskId::new(), |t| t.progress = 50.0);
    assert!(!touched);
    assert!(events.try_recv().is_err());
}

#[test]
fn test_update_cannot_reach_terminal_state() {
    let (mut registry, ids) = registry_with(&["a.bin"]);
    registry.update(&ids[0], |t| {
        t.status = TaskStatus::Completed;
        t.downloaded_bytes = 500;
        t.progress = 180.0;
    });

    let task = registry.get(&ids[0]).unwrap();
    assert_eq!(task.status, TaskStatus::Waiting);
    assert_eq!(task.downloaded_bytes, 100);
    assert_eq!(task.progress, 100.0);
    assert!(registry.is_active(&ids[0]));
}

#[test]
fn test_update_emits_deltas() {
    let (mut registry, ids) = registry_with(&["a.bin"]);
    let mut events = registry.subscribe();

    registry.update(&ids[0], |t| t.status = TaskStatus::Creating);
    assert!(matches!(
        events.try_recv().unwrap(),
        TaskEvent::StatusChanged { status: TaskStatus::Creating, .. }
    ));
    assert!(events.try_recv().is_err());

    registry.update(&ids[0], |t| {
        t.downloaded_bytes = 40;
        t.progress = 40.0;
    });
    match events.try_recv().unwrap() {
        TaskEvent::Progress(progress) => {
            assert_eq!(progress.task_id, ids[0]);
            assert_eq!(progress.downloaded_bytes, 40);
            assert_eq!(progress.total_bytes, 100);
        }
        other => panic!("unexpected event: {:?}", other),
    }
}

#[test]
fn test_move_to_terminal_is_idempotent() {
    let (mut registry, ids) = registry_with(&["a.bin", "b.bin"]);

    assert!(registry.move_to_terminal(&ids[0], false, Some("boom".to_string())));
    assert!(!registry.move_to_terminal(&ids[0], true, None));

    let task = registry.get(&ids[0]).unwrap();
    assert_eq!(task.status, TaskStatus::Error);
    assert_eq!(task.error.as_deref(), Some("boom"));
    assert_eq!(registry.completed_count(), 1);
    assert_eq!(registry.active_count(), 1);

    // 已结束的任务不能再被修改
    assert!(!registry.update(&ids[0], |t| t.retry_count = 9));
    assert_eq!(registry.get(&ids[0]).unwrap().retry_count, 0);
}

#[test]
fn test_success_fills_progress() {
    let (mut registry, ids) = registry_with(&["a.bin"]);
    registry.update(&ids[0], |t| {
        t.status = TaskStatus::Downloading;
        t.speed = 2048;
    });
    registry.move_to_terminal(&ids[0], true, None);

    let snapshot = registry.snapshot();
    let task = &snapshot.completed[0];
    assert_eq!(task.progress, 100.0);
    assert_eq!(task.downloaded_bytes, task.total_bytes);
    assert_eq!(task.speed, 0);
    assert!(task.completed_at.is_some());
}

#[test]
fn test_remove_from_both_sets() {
    let (mut registry, ids) = registry_with(&["a.bin", "b.bin", "c.bin"]);
    registry.move_to_terminal(&ids[1], true, None);

    let removed = registry.remove(&[ids[0], ids[1], TaskId::new()]);
    assert_eq!(removed.len(), 2);
    assert_eq!(registry.active_ids(), vec![ids[2]]);
    assert_eq!(registry.completed_count(), 0);
    assert!(registry.remove(&[ids[0]]).is_empty());
}

#[test]
fn test_dispatcher_selects_fifo_within_cap() {
    let (mut registry, ids) = registry_with(&["a.bin", "b.bin", "c.bin", "d.bin"]);
    let dispatcher = Dispatcher::new(2);

    registry.update(&ids[0], |t| t.status = TaskStatus::Downloading);
    let picked = dispatcher.select(&registry, &HashSet::new());
    assert_eq!(picked.len(), 1);
    assert_eq!(picked[0].task_id, ids[1]);
    assert!(matches!(picked[0].kind, DispatchKind::Fresh));

    // 提交中的任务不会被重复挑选
    let in_flight: HashSet<_> = [ids[1]].into_iter().collect();
    let picked = dispatcher.select(&registry, &in_flight);
    assert_eq!(picked[0].task_id, ids[2]);
}

#[test]
fn test_dispatcher_ignores_paused_and_resumes_queued() {
    let (mut registry, ids) = registry_with(&["a.bin", "b.bin"]);
    let dispatcher = Dispatcher::new(1);

    registry.update(&ids[0], |t| {
        t.status = TaskStatus::Paused;
        t.engine_handle = Some(EngineHandle::new("gid-1"));
    });
    assert_eq!(registry.busy_count(), 0);
    assert_eq!(dispatcher.free_slots(&registry), 1);

    let picked = dispatcher.select(&registry, &HashSet::new());
    assert_eq!(picked.len(), 1);
    assert_eq!(picked[0].task_id, ids[1]);

    registry.update(&ids[0], |t| t.status = TaskStatus::Waiting);
    let picked = dispatcher.select(&registry, &HashSet::new());
    assert_eq!(picked[0].task_id, ids[0]);
    assert!(matches!(&picked[0].kind, DispatchKind::Resume(handle) if handle.as_str() == "gid-1"));
}

#[test]
fn test_dispatcher_limit_is_clamped() {
    let mut dispatcher = Dispatcher::new(0);
    assert_eq!(dispatcher.max_concurrent(), 1);
    assert!(dispatcher.set_max_concurrent(8));
    assert_eq!(dispatcher.max_concurrent(), 3);
    assert!(!dispatcher.set_max_concurrent(2));
}

#[test]
fn test_target_directory_keeps_share_layout() {
    let root = Path::new("/downloads");

    assert_eq!(
        resolve_target_directory(root, None, "/share/a/b/file.txt"),
        PathBuf::from("/downloads")
    );
    assert_eq!(
        resolve_target_directory(root, Some("/share"), "/share/a/b/file.txt"),
        PathBuf::from("/downloads/a/b")
    );
    assert_eq!(
        resolve_target_directory(root, Some("/share"), "/share/file.txt"),
        PathBuf::from("/downloads")
    );
    // 不在基础路径下的文件保留完整目录
    assert_eq!(
        resolve_target_directory(root, Some("/other"), "/share/a/file.txt"),
        PathBuf::from("/downloads/share/a")
    );
    // `..` 不能跳出下载目录
    assert_eq!(
        resolve_target_directory(root, Some("/"), "/../../etc/passwd"),
        PathBuf::from("/downloads/etc")
    );
}
