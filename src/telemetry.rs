use anyhow::{Context, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

use crate::config::{LogConfig, LogFormat};

const DEFAULT_FILTER: &str = "progress_upload=info,tower_http=info";

/// 初始化日志。配置了日志目录时写按天滚动的文件，返回的 guard 需要一直持有
pub fn init(config: &LogConfig) -> Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    let (layer, guard) = match &config.dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("创建日志目录失败: {}", dir.display()))?;
            let appender = tracing_appender::rolling::daily(dir, "progress-upload.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = match config.format {
                LogFormat::Json => fmt::layer().json().with_writer(writer).boxed(),
                LogFormat::Pretty => fmt::layer().with_ansi(false).with_writer(writer).boxed(),
            };
            (layer, Some(guard))
        }
        None => {
            let layer = match config.format {
                LogFormat::Json => fmt::layer().json().boxed(),
                LogFormat::Pretty => fmt::layer().with_ansi(true).boxed(),
            };
            (layer, None)
        }
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(layer)
        .try_init()
        .context("初始化日志失败")?;

    Ok(guard)
}
