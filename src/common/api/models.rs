use std::collections::HashMap;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::downloader::task::FileRef;

// 分享接口的统一返回格式，code == 200 表示成功
#[derive(Debug, Deserialize)]
pub struct ApiResponse<T> {
    pub code: i64,
    #[serde(default)]
    pub message: String,
    pub data: Option<T>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileItem {
    #[serde(deserialize_with = "string_or_number")]
    pub fs_id: String,
    #[serde(alias = "name", alias = "filename")]
    pub server_filename: String,
    pub path: String,
    #[serde(default)]
    pub size: u64,
    #[serde(default, deserialize_with = "flag")]
    pub isdir: bool,
}

impl From<&FileItem> for FileRef {
    fn from(item: &FileItem) -> Self {
        FileRef {
            fs_id: item.fs_id.clone(),
            name: item.server_filename.clone(),
            size: item.size,
            path: item.path.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct FileListResponse {
    #[serde(default)]
    pub list: Vec<FileItem>,
    #[serde(default)]
    pub session: Option<String>, // 服务端下发的会话，后续请求带上
}

#[derive(Debug, Clone, Serialize)]
pub struct FileListRequest<'a> {
    pub code: &'a str,
    pub path: &'a str,
    pub session: &'a str,
}

#[derive(Debug, Clone, Serialize)]
pub struct DownloadLinkRequest<'a> {
    pub code: &'a str,
    pub session: &'a str,
    pub file_id: &'a str,
    pub path: &'a str,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DownloadLinkResponse {
    #[serde(alias = "url", alias = "download_url")]
    pub dlink: String,
    #[serde(default, alias = "user_agent")]
    pub ua: Option<String>,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub expires_in: Option<i64>, // 秒
}

// fs_id 有时是数字有时是字符串
fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!("无效的 fs_id: {}", other))),
    }
}

fn flag<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::Bool(b) => Ok(b),
        Value::Number(n) => Ok(n.as_i64().unwrap_or(0) != 0),
        Value::Null => Ok(false),
        other => Err(serde::de::Error::custom(format!("无效的标志位: {}", other))),
    }
}
