use std::time::Duration;

use reqwest::header::{ACCEPT, CONTENT_TYPE, HeaderMap, HeaderValue};
use reqwest::{Client, ClientBuilder, Response, Url};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, error};

use super::error::ApiError;
use super::models::{
    ApiResponse, DownloadLinkRequest, DownloadLinkResponse, FileListRequest, FileListResponse,
};

pub const DEFAULT_API_BASE: &str = "https://download.linglong521.cn";

const SUCCESS_CODE: i64 = 200;

// 分享文件列表/下载链接接口的客户端
#[derive(Debug, Clone)]
pub struct ShareClient {
    inner: Client,
    base: Url,
}

impl ShareClient {
    pub fn new(api_base: &str) -> Result<Self, ApiError> {
        Self::with_timeout(api_base, Duration::from_secs(60))
    }

    pub fn with_timeout(api_base: &str, timeout: Duration) -> Result<Self, ApiError> {
        // 保证以 / 结尾，join 时不会吃掉最后一段路径
        let base = if api_base.ends_with('/') {
            Url::parse(api_base)?
        } else {
            Url::parse(&format!("{}/", api_base))?
        };

        let inner = ClientBuilder::new()
            .timeout(timeout)
            .default_headers(Self::get_default_headers())
            .build()?;

        Ok(Self { inner, base })
    }

    pub fn get_default_headers() -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        headers
    }

    pub fn base_url(&self) -> &Url {
        &self.base
    }

    // 获取文件列表
    pub async fn get_file_list(
        &self,
        code: &str,
        path: &str,
        session: &str,
    ) -> Result<FileListResponse, ApiError> {
        self.post(
            "getFileList.php",
            &FileListRequest {
                code,
                path,
                session,
            },
        )
        .await
    }

    // 获取下载链接
    pub async fn get_download_link(
        &self,
        request: &DownloadLinkRequest<'_>,
    ) -> Result<DownloadLinkResponse, ApiError> {
        self.post("getDownloadLink.php", request).await
    }

    async fn post<B: Serialize, T: DeserializeOwned>(
        &self,
        endpoint: &str,
        body: &B,
    ) -> Result<T, ApiError> {
        let url = self.base.join(endpoint)?;
        debug!("POST {}", url);

        let resp = self.inner.post(url).json(body).send().await.map_err(|e| {
            error!("请求失败: {}", e);
            ApiError::Reqwest(e)
        })?;

        Self::handle_response::<T>(resp).await
    }

    // 处理响应
    async fn handle_response<T: DeserializeOwned>(resp: Response) -> Result<T, ApiError> {
        let status = resp.status();
        if status.is_server_error() {
            return Err(ApiError::RetryLater);
        }

        let text = resp.text().await?;
        let json_value: Value = serde_json::from_str(&text)
            .map_err(|_| ApiError::InvalidResponse(text.clone()))?;

        // 先看 code，失败响应的 data 结构不可靠
        let code = json_value.get("code").and_then(Value::as_i64);
        if code != Some(SUCCESS_CODE) {
            let message = json_value
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("Unknown error")
                .to_string();
            return Err(ApiError::ApiError(code.unwrap_or(-1), message));
        }

        let envelope: ApiResponse<T> = serde_json::from_value(json_value).map_err(|e| {
            ApiError::InvalidResponse(format!("解析响应失败: {}. 原始响应: {}", e, text))
        })?;

        envelope
            .data
            .ok_or_else(|| ApiError::InvalidResponse("响应缺少 data 字段".to_string()))
    }
}
