//! 外部多连接下载引擎
//!
//! 编排层只依赖 [`DownloadEngine`] 这一层 RPC 接口（添加/暂停/恢复/删除/查询），
//! [`EngineAdapter`] 负责懒启动、句柄映射和把引擎状态归一化成进度事件。

use std::fmt;
use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod adapter;
pub mod aria2;

pub use adapter::{AdapterEvent, EngineAdapter, TerminalState};
pub use aria2::{Aria2Engine, Aria2Options};

/// 引擎接受任务后返回的句柄（aria2 的 gid）
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EngineHandle(pub String);

impl EngineHandle {
    pub fn new(handle: impl Into<String>) -> Self {
        Self(handle.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EngineHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("无法连接下载引擎: {0}")]
    Unavailable(String),

    #[error("引擎拒绝请求: {0}")]
    Rejected(String),

    #[error("引擎中不存在该任务: {0}")]
    UnknownHandle(String),
}

/// 提交给引擎的下载请求
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddRequest {
    pub url: String,
    pub dir: PathBuf,
    pub out: String,
    pub headers: Vec<String>, // "Name: value"
    pub user_agent: Option<String>,
    pub split: u32, // 单任务连接数
}

// --------------------------------------------------------------------
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Active,
    Waiting,
    Paused,
    Complete,
    Error,
    Removed,
}

impl EngineState {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "active" => Some(EngineState::Active),
            "waiting" => Some(EngineState::Waiting),
            "paused" => Some(EngineState::Paused),
            "complete" => Some(EngineState::Complete),
            "error" => Some(EngineState::Error),
            "removed" => Some(EngineState::Removed),
            _ => None,
        }
    }
}

/// 引擎上报的一次状态，即事件流里的原始事件
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineStatus {
    pub handle: EngineHandle,
    pub state: EngineState,
    pub total_length: u64,
    pub completed_length: u64,
    pub download_speed: u64,
    pub error_message: Option<String>,
}

// --------------------------------------------------------------------
/// 下载引擎的 RPC 能力
#[async_trait]
pub trait DownloadEngine: Send + Sync {
    // 确保引擎进程/服务可用
    async fn launch(&self) -> Result<(), EngineError>;
    async fn shutdown(&self) -> Result<(), EngineError>;

    async fn add_uri(&self, request: &AddRequest) -> Result<EngineHandle, EngineError>;
    async fn pause(&self, handle: &EngineHandle) -> Result<(), EngineError>;
    async fn unpause(&self, handle: &EngineHandle) -> Result<(), EngineError>;
    async fn remove(&self, handle: &EngineHandle) -> Result<(), EngineError>;
    async fn tell_status(&self, handle: &EngineHandle) -> Result<EngineStatus, EngineError>;
}
