use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Arg, Command};
use tokio::signal;
use tracing::{error, info, warn};

use taskgrid::app::{AppMode, Application};
use taskgrid::shutdown::ShutdownManager;
use taskgrid_core::{init_logging, AppConfig, LogLevel, OutputFormat};

#[tokio::main]
async fn main() -> Result<()> {
    // 解析命令行参数
    let matches = Command::new("taskgrid")
        .version(env!("CARGO_PKG_VERSION"))
        .about("分布式任务网格")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("配置文件路径，未指定时按默认路径查找"),
        )
        .arg(
            Arg::new("mode")
                .short('m')
                .long("mode")
                .value_name("MODE")
                .help("运行模式")
                .value_parser(["driver", "node", "all"])
                .default_value("all"),
        )
        .arg(
            Arg::new("node-uuid")
                .long("node-uuid")
                .value_name("UUID")
                .help("节点 UUID (仅在node/all模式下使用)"),
        )
        .arg(
            Arg::new("driver-address")
                .long("driver-address")
                .value_name("ADDR")
                .help("节点连接的 Driver 地址"),
        )
        .arg(
            Arg::new("log-level")
                .short('l')
                .long("log-level")
                .value_name("LEVEL")
                .help("日志级别，覆盖配置文件")
                .value_parser(["trace", "debug", "info", "warn", "error"]),
        )
        .arg(
            Arg::new("log-format")
                .long("log-format")
                .value_name("FORMAT")
                .help("日志格式，覆盖配置文件")
                .value_parser(["json", "pretty", "compact"]),
        )
        .get_matches();

    let config_path = matches.get_one::<String>("config");
    let mode_str = matches
        .get_one::<String>("mode")
        .map(String::as_str)
        .unwrap_or("all");

    // 加载配置
    let mut config = AppConfig::load(config_path.map(String::as_str)).with_context(|| {
        format!(
            "加载配置文件失败: {}",
            config_path.map(String::as_str).unwrap_or("<默认路径>")
        )
    })?;

    if let Some(level) = matches.get_one::<String>("log-level") {
        config.logging.level = level
            .parse::<LogLevel>()
            .map_err(|e| anyhow::anyhow!("{e}"))?;
    }
    if let Some(format) = matches.get_one::<String>("log-format") {
        config.logging.format = format
            .parse::<OutputFormat>()
            .map_err(|e| anyhow::anyhow!("{e}"))?;
    }
    if let Some(uuid) = matches.get_one::<String>("node-uuid") {
        config.node.uuid = Some(uuid.clone());
    }
    if let Some(address) = matches.get_one::<String>("driver-address") {
        config.node.driver_address = address.clone();
    }
    config.validate().context("配置校验失败")?;

    // 初始化日志系统
    init_logging(&config.logging)?;

    info!("启动分布式任务网格");
    info!("配置文件: {}", config_path.map(String::as_str).unwrap_or("<默认路径>"));
    info!("运行模式: {mode_str}");

    let app_mode: AppMode = mode_str.parse()?;
    let app = Arc::new(Application::new(config, app_mode));
    let shutdown_manager = ShutdownManager::new();

    // 启动应用
    let mut app_handle = {
        let app = Arc::clone(&app);
        let shutdown_manager = shutdown_manager.clone();
        tokio::spawn(async move {
            if let Err(e) = app.run(shutdown_manager).await {
                error!("应用运行失败: {e:#}");
            }
        })
    };

    // 等待关闭信号，或应用自行结束（例如收到管理命令停止 Driver）
    tokio::select! {
        _ = wait_for_shutdown_signal() => {
            info!("收到关闭信号，开始优雅关闭...");
        }
        result = &mut app_handle => {
            if let Err(e) = result {
                error!("应用任务异常结束: {e}");
            }
            info!("分布式任务网格已退出");
            return Ok(());
        }
    }

    shutdown_manager.shutdown().await;

    // 等待应用关闭，设置超时
    match tokio::time::timeout(Duration::from_secs(30), app_handle).await {
        Ok(Ok(())) => info!("应用已优雅关闭"),
        Ok(Err(e)) => error!("应用关闭时发生错误: {e}"),
        Err(_) => warn!("应用关闭超时，强制退出"),
    }

    info!("分布式任务网格已退出");
    Ok(())
}

/// 等待关闭信号
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
        _ = ctrl_c => {
            info!("收到Ctrl+C信号");
        },
        _ = terminate => {
            info!("收到SIGTERM信号");
        },
    }
}
