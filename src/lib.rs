//! 带进度查询的会话级文件上传端点
//!
//! 浏览器端在上传开始前选定一个进度 key，POST 上传过程中可以用同一个 key
//! 轮询 GET 接口获取已接收的字节数。上传完成的文件按会话保存，之后可以
//! 取回、删除。

pub mod config;
pub mod error;
pub mod progress;
pub mod query;
pub mod response;
pub mod server;
pub mod session;
pub mod state;
pub mod store;
pub mod telemetry;
pub mod transport;
pub mod upload;

pub use config::Config;
pub use error::UploadError;
pub use progress::{Progress, ProgressStore};
pub use server::router;
pub use state::AppState;
pub use store::{FileStore, SessionFiles, StoredFile};
