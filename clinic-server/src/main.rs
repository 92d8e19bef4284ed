//! 诊所患者流转服务主程序
//!
//! 从标准输入逐行读取 JSON 请求，向标准输出逐行写出 JSON 响应。

use anyhow::{Context, Result};
use clap::Parser;
use clinic_admin::{init_logging, ClinicRuntime, ConfigManager};
use clinic_workflow::TracingNotifier;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{error, info};

/// 服务命令行参数
#[derive(Parser, Debug)]
#[command(name = "clinic-server")]
#[command(about = "诊所患者流转服务")]
struct Args {
    /// 配置文件路径，不存在时使用默认配置
    #[arg(short, long, default_value = "clinic.toml")]
    config: String,

    /// 快照文件路径，覆盖配置文件
    #[arg(short, long)]
    snapshot: Option<String>,

    /// 日志级别，覆盖配置文件
    #[arg(short, long)]
    log_level: Option<String>,

    /// 关闭命令执行后的自动保存
    #[arg(long)]
    no_autosave: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let manager = ConfigManager::new(&args.config)?;
    let mut config = manager.get_config().await;
    if let Some(snapshot) = args.snapshot {
        config.server.snapshot_path = snapshot;
    }
    if let Some(level) = args.log_level {
        config.logging.level = level;
    }
    if args.no_autosave {
        config.server.autosave = false;
    }

    init_logging(&config.logging)?;

    info!("启动诊所患者流转服务...");
    info!("  配置文件: {}", manager.path().display());
    info!("  快照文件: {}", config.server.snapshot_path);
    info!("  自动保存: {}", config.server.autosave);

    let runtime = ClinicRuntime::start(config, Arc::new(TracingNotifier)).await?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();
    while let Some(line) = lines.next_line().await.context("Failed to read request")? {
        if line.trim().is_empty() {
            continue;
        }

        let response = match runtime.handle_line(&line).await {
            Ok(response) => response,
            Err(e) => {
                error!("快照保存失败: {:#}", e);
                return Err(e);
            }
        };
        stdout.write_all(response.as_bytes()).await?;
        stdout.write_all(b"\n").await?;
        stdout.flush().await?;
    }

    let server = &runtime.config().server;
    if !server.autosave && !server.snapshot_path.trim().is_empty() {
        runtime.persist().await?;
    }
    info!("输入结束，服务退出");
    Ok(())
}
