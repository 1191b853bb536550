use thiserror::Error;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("网络请求失败: {0}")]
    Reqwest(#[from] reqwest::Error),

    #[error("无效的接口地址: {0}")]
    InvalidBaseUrl(#[from] url::ParseError),

    #[error("响应解析失败: {0}")]
    InvalidResponse(String),

    #[error("服务暂时不可用，请稍后重试")]
    RetryLater,

    #[error("分享接口错误 ({0}): {1}")]
    ApiError(i64, String),
}

impl ApiError {
    /// 提取码/会话失效，需要用户重新输入
    pub fn is_session_expired(&self) -> bool {
        match self {
            ApiError::ApiError(code, message) => {
                matches!(code, 401 | 403 | 410)
                    || ["过期", "失效", "expired"]
                        .iter()
                        .any(|k| message.to_lowercase().contains(k))
            }
            _ => false,
        }
    }
}

impl From<serde_json::Error> for ApiError {
    fn from(e: serde_json::Error) -> Self {
        Self::InvalidResponse(e.to_string())
    }
}
