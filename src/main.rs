use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, error, info};

use share_downloader::common::api::ShareClient;
use share_downloader::common::config::{Settings, SettingsStore};
use share_downloader::common::logger::PrettyLogger;
use share_downloader::downloader::progress::ProgressBoard;
use share_downloader::downloader::{
    DownloadManager, FileRef, ManagerOptions, TaskEvent, TaskId, TaskStatus,
};
use share_downloader::engine::Aria2Engine;
use share_downloader::session::{ShareSession, ShareSessionProvider};
use share_downloader::{log_complete, log_error, log_info, log_step, log_success, log_warning};

mod cli;

/// 读取配置，命令行参数覆盖的值会写回配置文件
fn prepare_settings(args: &cli::Cli, store: &SettingsStore) -> Result<(Settings, PathBuf)> {
    let mut settings = store.load();
    if let Some(concurrency) = args.concurrency {
        settings.max_concurrent_downloads = store
            .set_max_concurrent_downloads(concurrency)
            .context("保存并发设置失败")?;
    }

    let download_dir = match &args.output_dir {
        Some(dir) => store.set_download_dir(dir).context("无法创建下载目录")?,
        None => store.current_download_dir().context("无法创建下载目录")?,
    };
    debug!("当前配置: {:?}", settings);
    Ok((settings, download_dir))
}

/// 列出分享目录，返回要下载的文件
async fn collect_files(args: &cli::Cli, provider: &ShareSessionProvider) -> Result<Vec<FileRef>> {
    let base_path = provider.session().await.base_path;
    log_step!("读取分享目录 {}", base_path);
    let items = match provider.list_files(&base_path).await {
        Ok(items) => items,
        Err(e) if e.is_expired() => {
            log_error!("分享会话已失效，请重新输入提取码");
            return Err(e.into());
        }
        Err(e) => return Err(e).context("读取分享目录失败"),
    };

    for (index, item) in items.iter().enumerate() {
        PrettyLogger::share_entry(index + 1, &item.server_filename, item.size, item.isdir);
    }

    let files: Vec<FileRef> = items
        .iter()
        .filter(|item| !item.isdir && args.is_picked(&item.server_filename))
        .map(FileRef::from)
        .collect();
    log_complete!("共 {} 项，{} 个文件待下载", items.len(), files.len());
    Ok(files)
}

/// 渲染进度直到本批任务全部结束；Ctrl-C 时暂停所有任务
async fn watch(
    manager: &DownloadManager,
    batch: &HashSet<TaskId>,
    board: &mut ProgressBoard,
    mut events: broadcast::Receiver<TaskEvent>,
) -> Result<bool> {
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                board.println("收到中断信号，暂停所有任务");
                manager.pause_all().await?;
                return Ok(false);
            }
            event = events.recv() => {
                let check = match event {
                    Ok(event) => {
                        board.handle(&event);
                        matches!(event, TaskEvent::Terminal { .. } | TaskEvent::Removed { .. })
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        debug!("跳过 {} 条任务事件", skipped);
                        true
                    }
                    Err(RecvError::Closed) => return Ok(false),
                };
                if check {
                    let snapshot = manager.snapshot().await?;
                    if !snapshot.active.iter().any(|t| batch.contains(&t.id)) {
                        return Ok(true);
                    }
                }
            }
        }
    }
}

async fn summarize(manager: &DownloadManager, batch: &HashSet<TaskId>) -> Result<()> {
    let snapshot = manager.snapshot().await?;
    let finished: Vec<_> = snapshot
        .completed
        .iter()
        .filter(|t| batch.contains(&t.id))
        .collect();

    let succeeded = finished
        .iter()
        .filter(|t| t.status == TaskStatus::Completed)
        .count();
    let failed: Vec<(String, String)> = finished
        .iter()
        .filter(|t| t.status == TaskStatus::Error)
        .map(|t| {
            (
                t.file.name.clone(),
                t.error.clone().unwrap_or_else(|| "未知错误".to_string()),
            )
        })
        .collect();

    PrettyLogger::completion_summary(succeeded, &failed);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    // 解析命令行参数
    let args = cli::Cli::parse();

    // 初始化日志
    tracing_subscriber::fmt()
        .with_max_level(args.log_level())
        .with_target(false)
        .init();

    PrettyLogger::title("sharedl 分享下载");

    let store = SettingsStore::new(&args.config);
    let (settings, download_dir) = prepare_settings(&args, &store)?;

    let client = ShareClient::new(&settings.api_base).context("分享接口地址无效")?;
    let mut session = ShareSession::new(&args.code);
    session.session = args.session.clone().unwrap_or_default();
    session.base_path = args.path.clone();
    let provider = Arc::new(ShareSessionProvider::new(client, session));

    let files = collect_files(&args, &provider).await?;
    let base_path = provider.session().await.base_path;
    if files.is_empty() {
        log_warning!("没有需要下载的文件");
        return Ok(());
    }
    PrettyLogger::separator();
    PrettyLogger::file_info("下载目录", download_dir.display().to_string());
    log_info!("共 {} 个文件，最多同时下载 {} 个", files.len(), settings.max_concurrent_downloads);

    let engine = Arc::new(Aria2Engine::new(settings.engine.aria2.clone())?);
    let manager = DownloadManager::builder()
        .engine(engine)
        .session_provider(provider)
        .options(ManagerOptions::from_settings(&settings, &download_dir))
        .build()?;

    // 先订阅，才能收到新任务的 Added 事件
    let events = manager.subscribe();
    let batch: HashSet<TaskId> = manager
        .add_files(files, Some(base_path))
        .await?
        .into_iter()
        .collect();

    PrettyLogger::waiting("下载中，按 Ctrl-C 暂停全部任务");
    let mut board = ProgressBoard::new();
    let drained = watch(&manager, &batch, &mut board, events).await?;

    if drained {
        summarize(&manager, &batch).await?;
    } else {
        log_warning!("下载已暂停，未完成的文件下次可以继续");
    }

    if let Err(e) = manager.shutdown().await {
        error!("关闭下载引擎失败: {}", e);
    } else {
        info!("下载引擎已关闭");
    }
    if drained {
        log_success!("全部任务已结束");
    }
    Ok(())
}
