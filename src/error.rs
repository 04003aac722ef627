use thiserror::Error;

use crate::response::{Encoding, XmlBody};

/// 单个请求内可能出现的错误，全部在请求边界转换成 `<error>` XML。
#[derive(Debug, Error)]
pub enum UploadError {
    /// GET 请求没有携带任何已知参数
    #[error("no parameter")]
    NoParameter,

    /// POST 请求缺少进度 key 字段
    #[error("missing progress key: you have not sent the {0} parameter")]
    MissingParameter(String),

    /// 进度 key 与任何文件字段都不匹配
    #[error("unknown key: no file part matches the progress key {0}")]
    UnknownProgressKey(String),

    #[error("storage failure: {0}")]
    StorageFailure(#[from] std::io::Error),

    /// 文件或会话不存在，消息中带上查询的名称
    #[error("{0}")]
    NotFound(String),

    #[error("size limit exceeded: the request is larger than {limit} bytes")]
    SizeLimitExceeded { limit: u64 },

    #[error("malformed request: {0}")]
    Malformed(String),
}

impl From<multer::Error> for UploadError {
    fn from(err: multer::Error) -> Self {
        match err {
            multer::Error::StreamSizeExceeded { limit } => Self::SizeLimitExceeded { limit },
            other => Self::Malformed(other.to_string()),
        }
    }
}

impl UploadError {
    /// 按给定编码策略生成错误响应体
    pub fn to_xml(&self, encoding: Encoding) -> String {
        let mut body = XmlBody::new();
        body.text("error", &self.to_string());
        body.render(encoding)
    }
}
