mod errors;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info};

pub use errors::{LinkError, Result};

use crate::common::api::ShareClient;
use crate::common::api::models::{DownloadLinkRequest, DownloadLinkResponse, FileItem};
use crate::downloader::task::FileRef;

// 链接到期前这么久就不再复用
const EXPIRY_MARGIN_SECS: i64 = 30;

/// 有时效的下载地址
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadLink {
    pub url: String,
    pub headers: Vec<String>, // "Name: value"
    pub user_agent: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl DownloadLink {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            headers: Vec::new(),
            user_agent: None,
            expires_at: None,
        }
    }

    /// 是否还能复用
    pub fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        match self.expires_at {
            Some(expires_at) => expires_at - Duration::seconds(EXPIRY_MARGIN_SECS) > now,
            None => true,
        }
    }

    fn from_response(resp: DownloadLinkResponse, now: DateTime<Utc>) -> Self {
        let mut headers: Vec<String> = resp
            .headers
            .iter()
            .map(|(name, value)| format!("{}: {}", name, value))
            .collect();
        headers.sort();

        Self {
            url: resp.dlink,
            headers,
            user_agent: resp.ua.filter(|ua| !ua.is_empty()),
            expires_at: resp.expires_in.map(|secs| now + Duration::seconds(secs)),
        }
    }
}

/// 为文件签发下载地址的外部协作方
#[async_trait]
pub trait SessionProvider: Send + Sync {
    async fn download_link(&self, file: &FileRef) -> Result<DownloadLink>;
}

// --------------------------------------------------------------------
/// 当前打开的分享
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ShareSession {
    pub code: String,      // 提取码/分享码
    pub session: String,   // 服务端会话
    pub base_path: String, // 分享的虚拟根目录
}

impl ShareSession {
    pub fn new(code: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            session: String::new(),
            base_path: "/".to_string(),
        }
    }
}

/// 基于分享接口的链接签发
pub struct ShareSessionProvider {
    client: ShareClient,
    session: RwLock<ShareSession>,
}

impl ShareSessionProvider {
    pub fn new(client: ShareClient, session: ShareSession) -> Self {
        Self {
            client,
            session: RwLock::new(session),
        }
    }

    pub async fn session(&self) -> ShareSession {
        self.session.read().await.clone()
    }

    pub async fn set_session(&self, session: ShareSession) {
        *self.session.write().await = session;
    }

    /// 列出分享目录，服务端下发的新会话会被保存
    pub async fn list_files(&self, path: &str) -> Result<Vec<FileItem>> {
        let current = self.session().await;
        let resp = self
            .client
            .get_file_list(&current.code, path, &current.session)
            .await?;

        if let Some(session) = resp.session.filter(|s| !s.is_empty()) {
            let mut guard = self.session.write().await;
            if guard.session != session {
                debug!("分享会话已更新");
                guard.session = session;
            }
        }
        info!("目录 {} 共 {} 项", path, resp.list.len());
        Ok(resp.list)
    }
}

#[async_trait]
impl SessionProvider for ShareSessionProvider {
    async fn download_link(&self, file: &FileRef) -> Result<DownloadLink> {
        let current = self.session().await;
        debug!("请求下载链接: {} ({})", file.name, file.fs_id);

        let resp = self
            .client
            .get_download_link(&DownloadLinkRequest {
                code: &current.code,
                session: &current.session,
                file_id: &file.fs_id,
                path: &file.path,
            })
            .await?;

        if resp.dlink.is_empty() {
            return Err(LinkError::Unavailable("接口返回了空的下载链接".to_string()));
        }
        Ok(DownloadLink::from_response(resp, Utc::now()))
    }
}
