use anyhow::Result;
use clap::Parser;

use progress_upload::config::{Cli, Config};
use progress_upload::{server, telemetry};

#[tokio::main]
async fn main() -> Result<()> {
    // 1. 读取配置
    let config = Config::load(Cli::parse())?;

    // 2. 初始化日志
    let _guard = telemetry::init(&config.log)?;

    // 3. 启动服务器
    server::run(config).await
}
