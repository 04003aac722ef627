use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use serde::Deserialize;

/// 命令行参数，未给出的项回落到配置文件，再回落到默认值
#[derive(Debug, Parser)]
#[command(version, about)]
pub struct Cli {
    /// TOML 配置文件
    #[arg(short, long, env = "PROGRESS_UPLOAD_CONFIG")]
    pub config: Option<PathBuf>,

    /// 监听地址
    #[arg(short, long, env = "PROGRESS_UPLOAD_BIND")]
    pub bind: Option<SocketAddr>,

    /// 会话目录的根
    #[arg(short, long, env = "PROGRESS_UPLOAD_DIR")]
    pub upload_dir: Option<PathBuf>,

    /// 单个请求的最大字节数，0 表示不限制
    #[arg(long, env = "PROGRESS_UPLOAD_MAX_SIZE")]
    pub max_size: Option<u64>,

    #[arg(long, value_enum, env = "PROGRESS_UPLOAD_LOG_FORMAT")]
    pub log_format: Option<LogFormat>,

    /// 日志目录，设置后按天滚动写文件
    #[arg(long, env = "PROGRESS_UPLOAD_LOG_DIR")]
    pub log_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub format: LogFormat,
    pub dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub bind: SocketAddr,
    /// 上传端点的路径
    pub path: String,
    pub upload_dir: PathBuf,
    /// 携带进度 key 的表单字段名
    pub progress_field: String,
    pub session_cookie: String,
    pub max_upload_size: u64,
    pub log: LogConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([0, 0, 0, 0], 8080)),
            path: "/upload".to_string(),
            upload_dir: PathBuf::from("/tmp/progress_upload"),
            progress_field: "APC_UPLOAD_PROGRESS".to_string(),
            session_cookie: "SESSIONID".to_string(),
            max_upload_size: 100 * 1024 * 1024,
            log: LogConfig::default(),
        }
    }
}

impl Config {
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("读取配置文件失败: {}", path.display()))?;
        toml::from_str(&content).with_context(|| format!("解析配置文件失败: {}", path.display()))
    }

    /// 配置文件 + 命令行覆盖
    pub fn load(cli: Cli) -> Result<Self> {
        let mut config = match &cli.config {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };

        if let Some(bind) = cli.bind {
            config.bind = bind;
        }
        if let Some(dir) = cli.upload_dir {
            config.upload_dir = dir;
        }
        if let Some(max) = cli.max_size {
            config.max_upload_size = max;
        }
        if let Some(format) = cli.log_format {
            config.log.format = format;
        }
        if let Some(dir) = cli.log_dir {
            config.log.dir = Some(dir);
        }

        if !config.path.starts_with('/') {
            config.path.insert(0, '/');
        }
        Ok(config)
    }

    /// 0 表示不限制
    pub fn size_limit(&self) -> Option<u64> {
        (self.max_upload_size > 0).then_some(self.max_upload_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_partial_file_keeps_defaults() {
        let config: Config = toml::from_str(
            r#"
            upload_dir = "/srv/uploads"
            max_upload_size = 0

            [log]
            format = "json"
            "#,
        )
        .unwrap();

        assert_eq!(config.upload_dir, PathBuf::from("/srv/uploads"));
        assert_eq!(config.size_limit(), None);
        assert_eq!(config.log.format, LogFormat::Json);
        assert_eq!(config.progress_field, "APC_UPLOAD_PROGRESS");
        assert_eq!(config.path, "/upload");
    }

    #[test]
    fn test_cli_overrides_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "bind = \"127.0.0.1:9000\"\npath = \"jsupload\"").unwrap();

        let cli = Cli::parse_from([
            "progress-upload",
            "--config",
            file.path().to_str().unwrap(),
            "--max-size",
            "1024",
        ]);
        let config = Config::load(cli).unwrap();

        assert_eq!(config.bind, SocketAddr::from(([127, 0, 0, 1], 9000)));
        assert_eq!(config.path, "/jsupload");
        assert_eq!(config.size_limit(), Some(1024));
    }
}
