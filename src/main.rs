use std::time::Duration;

use anyhow::{Context, Result};
use billing_core::{init_logging, AppConfig};
use clap::{Arg, Command};
use tokio::signal;
use tracing::{error, info, warn};

mod app;
mod shutdown;

use app::{AppMode, Application};
use shutdown::ShutdownManager;

#[tokio::main]
async fn main() -> Result<()> {
    let matches = Command::new("billing-pipeline")
        .version(env!("CARGO_PKG_VERSION"))
        .about("账单数据同步流水线")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("配置文件路径, 不指定时依次尝试默认路径"),
        )
        .arg(
            Arg::new("mode")
                .short('m')
                .long("mode")
                .value_name("MODE")
                .help("运行模式")
                .value_parser(["dispatcher", "worker", "api", "all"])
                .default_value("all"),
        )
        .arg(
            Arg::new("cycle-interval")
                .long("cycle-interval")
                .value_name("SECONDS")
                .help("管理器周期间隔 (仅dispatcher和all模式)")
                .value_parser(clap::value_parser!(u64).range(1..))
                .default_value("600"),
        )
        .arg(
            Arg::new("log-level")
                .short('l')
                .long("log-level")
                .value_name("LEVEL")
                .help("日志级别")
                .value_parser(["trace", "debug", "info", "warn", "error"])
                .default_value("info"),
        )
        .arg(
            Arg::new("log-format")
                .long("log-format")
                .value_name("FORMAT")
                .help("日志格式")
                .value_parser(["json", "pretty"])
                .default_value("pretty"),
        )
        .get_matches();

    let config_path = matches.get_one::<String>("config");
    let mode = matches
        .get_one::<String>("mode")
        .map(String::as_str)
        .unwrap_or("all");
    let cycle_interval = matches
        .get_one::<u64>("cycle-interval")
        .copied()
        .unwrap_or(600);
    let log_level = matches
        .get_one::<String>("log-level")
        .map(String::as_str)
        .unwrap_or("info");
    let log_format = matches
        .get_one::<String>("log-format")
        .map(String::as_str)
        .unwrap_or("pretty");

    init_logging(log_level, log_format)?;

    info!("启动账单数据同步流水线, 运行模式: {mode}");
    let config = AppConfig::load(config_path.map(String::as_str)).with_context(|| {
        format!(
            "加载配置失败: {}",
            config_path.map(String::as_str).unwrap_or("默认路径")
        )
    })?;
    let app_mode = AppMode::parse(mode)?;
    if app_mode == AppMode::Api && !config.api.enabled {
        return Err(anyhow::anyhow!("API模式被禁用, 请检查配置"));
    }

    let app = Application::new(config, app_mode, Duration::from_secs(cycle_interval));
    let shutdown_manager = ShutdownManager::new();

    let app_handle = {
        let shutdown_rx = shutdown_manager.subscribe();
        tokio::spawn(async move {
            if let Err(e) = app.run(shutdown_rx).await {
                error!("应用运行失败: {e:#}");
            }
        })
    };

    wait_for_shutdown_signal().await;
    info!("收到关闭信号, 开始优雅关闭...");
    shutdown_manager.shutdown();

    match tokio::time::timeout(Duration::from_secs(30), app_handle).await {
        Ok(Ok(())) => info!("应用已优雅关闭"),
        Ok(Err(e)) => error!("应用关闭时发生错误: {e}"),
        Err(_) => warn!("应用关闭超时, 强制退出"),
    }

    Ok(())
}

/// 等待 Ctrl+C 或 SIGTERM
async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("安装Ctrl+C信号处理器失败: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("安装SIGTERM信号处理器失败: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("收到Ctrl+C信号"),
        _ = terminate => info!("收到SIGTERM信号"),
    }
}
