use thiserror::Error;

use crate::common::api::ApiError;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LinkError {
    #[error("分享会话已过期: {0}")]
    Expired(String),

    #[error("{0}")]
    Unavailable(String),
}

impl LinkError {
    /// 需要用户重新输入提取码的错误
    pub fn is_expired(&self) -> bool {
        matches!(self, LinkError::Expired(_))
    }
}

impl From<ApiError> for LinkError {
    fn from(error: ApiError) -> Self {
        if error.is_session_expired() {
            LinkError::Expired(error.to_string())
        } else {
            LinkError::Unavailable(error.to_string())
        }
    }
}

pub type Result<T> = std::result::Result<T, LinkError>;
