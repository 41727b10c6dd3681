use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Arg, ArgAction, Command};
use jobqueue::domain::{FnSection, Occurrence, Queue, Schedule};
use jobqueue::{AppConfig, QueueEngine};
use jobqueue_core::init_logging;
use tokio::signal;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    let matches = Command::new("jobqueue")
        .version(env!("CARGO_PKG_VERSION"))
        .about("周期/延迟作业调度引擎")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("配置文件路径，未指定时按默认路径查找"),
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
                .value_parser(["json", "pretty"]),
        )
        .arg(
            Arg::new("heartbeat-minutes")
                .long("heartbeat-minutes")
                .value_name("MINUTES")
                .help("提交一个按分钟间隔运行的心跳作业")
                .value_parser(clap::value_parser!(u32).range(1..=59)),
        )
        .arg(
            Arg::new("print-config")
                .long("print-config")
                .help("打印生效的配置后退出")
                .action(ArgAction::SetTrue),
        )
        .get_matches();

    let config_path = matches.get_one::<String>("config").map(String::as_str);
    let mut config = AppConfig::load(config_path)
        .with_context(|| format!("加载配置失败: {}", config_path.unwrap_or("<默认路径>")))?;

    if let Some(level) = matches.get_one::<String>("log-level") {
        config.observability.log_level = level.clone();
    }
    if let Some(format) = matches.get_one::<String>("log-format") {
        config.observability.log_format = format.clone();
    }

    if matches.get_flag("print-config") {
        println!("{}", config.to_toml()?);
        return Ok(());
    }

    init_logging(
        &config.observability.log_level,
        &config.observability.log_format,
    )?;
    info!("启动作业调度引擎");

    let heartbeat_queue = Arc::new(Queue::builder("heartbeat").build());
    let engine = QueueEngine::builder(config)
        .register_queue(heartbeat_queue.clone())
        .build()
        .context("创建作业引擎失败")?;

    let owner = engine.config().defaults.owner.clone();
    engine
        .server(&owner)
        .await
        .with_context(|| format!("启动作业服务器失败: {owner}"))?;

    if let Some(minutes) = matches.get_one::<u32>("heartbeat-minutes").copied() {
        let handle = engine
            .process(&heartbeat_queue)
            .name("heartbeat")
            .occurrence(Occurrence::every(Schedule::every_minutes(minutes)))
            .section(FnSection::new("beat", |ctx| {
                info!(run_count = ctx.run_count(), "心跳作业运行");
                Ok(0)
            }))
            .submit()
            .await
            .context("提交心跳作业失败")?;
        info!(
            "心跳作业已提交，下次运行时间: {:?}",
            handle.next_run_time()
        );
    }

    wait_for_shutdown_signal().await;
    info!("收到关闭信号，开始优雅关闭...");

    if engine.shutdown().await {
        info!("作业调度引擎已退出");
    } else {
        warn!("部分作业未在关闭超时内结束");
    }
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
            Ok(mut stream) => {
                stream.recv().await;
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
