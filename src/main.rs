use anyhow::Context;
use clap::{Parser, Subcommand};
use livesync_lib::config::{default_config_dir, DiscoveryConfig, SyncSettings};
use livesync_lib::core::{DeviceAppData, DirectorySyncer, FileScanner};
use livesync_lib::device::{Device, DeviceRegistry, DiscoveryEventKind, Platform};
use livesync_lib::discovery::ios_worker::run_worker_loop;
use livesync_lib::discovery::{
    AndroidDeviceDiscovery, DiscoveryEngine, IosDeviceDiscovery, IosSimulatorDiscovery,
    NativeDeviceNotifier,
};
use livesync_lib::emulator::{AndroidEmulatorServices, IosSimulatorServices};
use livesync_lib::logging::{get_log_dir, LogConfig, SizeRotatingWriter};
use livesync_lib::orchestrator::{DeviceOrchestrator, ExecuteOptions, InitializeOptions};
use livesync_lib::transport::adb::AdbTool;
use livesync_lib::transport::{
    AfcClient, AfcTransport, CommandRunner, DeviceTransport, ProcessRunner, OP_TIMEOUT_SECS,
};
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};
use tracing_subscriber::prelude::*;

#[derive(Parser)]
#[command(version, about = "移动设备发现与增量文件同步", long_about = None)]
struct Cli {
    /// 配置目录，默认为用户配置目录下的 livesync
    #[arg(long, global = true, value_name = "DIR")]
    config_dir: Option<PathBuf>,

    /// 作为 iOS 设备检测子进程运行，向 stdout 输出 JSON 行
    #[arg(long, hide = true)]
    ios_detection_worker: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// 持续检测设备并输出连接变化（默认）
    Watch,
    /// 列出当前连接的设备
    List,
    /// 把本地目录同步到设备
    Sync {
        /// 应用标识符
        app_id: String,
        /// 本地项目目录
        source_dir: PathBuf,
        /// 设备上的项目根目录
        #[arg(long, value_name = "PATH")]
        device_root: String,
        #[arg(long)]
        platform: Option<Platform>,
        /// 设备标识符或序号（从 1 开始）
        #[arg(long)]
        device: Option<String>,
        /// 只在模拟器上执行
        #[arg(long)]
        emulator: bool,
        /// 忽略基线整目录推送
        #[arg(long)]
        force: bool,
        /// 丢弃本地已不存在的基线记录
        #[arg(long)]
        prune_stale: bool,
    },
}

/// 初始化日志系统
fn init_logging(config_dir: &Path) {
    let log_dir = get_log_dir(config_dir);
    let config = LogConfig::load(config_dir);

    if !config.enabled {
        let _ = tracing::subscriber::set_global_default(tracing_subscriber::registry());
        return;
    }

    let env_filter = config.env_filter();

    // stdout 在 worker 模式下用于协议输出，控制台日志统一写 stderr
    match SizeRotatingWriter::new(&log_dir, config.max_size_mb) {
        Ok(file_writer) => {
            let file_layer = tracing_subscriber::fmt::layer()
                .with_writer(file_writer)
                .with_ansi(false)
                .with_target(false);

            #[cfg(debug_assertions)]
            {
                let console_layer = tracing_subscriber::fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_target(false);
                let _ = tracing_subscriber::registry()
                    .with(env_filter)
                    .with(file_layer)
                    .with(console_layer)
                    .try_init();
            }

            #[cfg(not(debug_assertions))]
            {
                let _ = tracing_subscriber::registry()
                    .with(env_filter)
                    .with(file_layer)
                    .try_init();
            }
        }
        Err(e) => {
            eprintln!("无法创建日志文件 {:?}: {}", log_dir, e);
            let _ = tracing_subscriber::fmt()
                .with_writer(std::io::stderr)
                .with_env_filter(env_filter)
                .try_init();
        }
    }
}

/// 当前构建可用的 iOS 原生通知实现
fn native_notifier() -> Option<Box<dyn NativeDeviceNotifier>> {
    None
}

/// 当前构建可用的 AFC 连接
fn native_afc_client(_identifier: &str) -> Option<Arc<dyn AfcClient>> {
    None
}

/// `--ios-detection-worker` 子进程入口，供 `IosDeviceDiscovery::with_worker_process` 启动
fn run_ios_worker(config: &DiscoveryConfig) -> anyhow::Result<()> {
    let mut notifier = native_notifier()
        .context("当前构建不包含 iOS 原生设备通知，无法运行检测子进程")?;
    let stop = AtomicBool::new(false);
    let wake = livesync_lib::discovery::effective_wake_timeout(config.ios_wake_timeout());
    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    run_worker_loop(notifier.as_mut(), wake, &stop, &mut out)
}

/// 按主机组装发现引擎和模拟器服务
fn build_orchestrator(config: &DiscoveryConfig) -> (DeviceOrchestrator, AdbTool) {
    let runner: Arc<dyn CommandRunner> = Arc::new(ProcessRunner::new());
    // 探测命令很快，使用较短的超时，避免卡住的 adb 拖住轮询
    let probe_runner: Arc<dyn CommandRunner> = Arc::new(ProcessRunner::with_timeout(
        Duration::from_secs(OP_TIMEOUT_SECS),
    ));
    let adb = AdbTool::new(runner.clone(), config.adb_path.clone());
    let probe_adb = AdbTool::new(probe_runner.clone(), config.adb_path.clone());
    let registry = Arc::new(DeviceRegistry::new());

    let orchestrator = DeviceOrchestrator::new(registry)
        .with_engine(
            DiscoveryEngine::Android(AndroidDeviceDiscovery::new(probe_adb)),
            config.android_interval(),
        )
        .with_engine(
            DiscoveryEngine::IosDevice(IosDeviceDiscovery::for_host(
                native_notifier(),
                config.ios_wake_timeout(),
            )),
            config.ios_interval(),
        )
        .with_engine(
            DiscoveryEngine::IosSimulator(IosSimulatorDiscovery::new(
                probe_runner,
                &config.simulator_list_command,
            )),
            config.simulator_interval(),
        )
        .with_emulator(Arc::new(AndroidEmulatorServices::new(
            runner.clone(),
            config.emulator_path.clone(),
            config.avd_name.clone(),
            adb.clone(),
        )))
        .with_emulator(Arc::new(IosSimulatorServices::new(
            runner,
            config.simulator_name.clone(),
        )));

    (orchestrator, adb)
}

fn describe(device: &Device) -> String {
    format!(
        "{} [{}{}] {}",
        device.identifier,
        device.platform,
        if device.is_emulator { ", 模拟器" } else { "" },
        device.display_name
    )
}

async fn watch(orchestrator: &DeviceOrchestrator) -> anyhow::Result<()> {
    let mut events = orchestrator.subscribe();
    orchestrator.start_device_detection_interval().await;
    info!("正在检测设备，按 Ctrl-C 退出");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => match event {
                Ok(event) => match event.kind {
                    DiscoveryEventKind::Found => println!("+ {}", describe(&event.device)),
                    DiscoveryEventKind::Lost => println!("- {}", describe(&event.device)),
                },
                Err(RecvError::Lagged(skipped)) => warn!("丢失了 {} 个设备事件", skipped),
                Err(RecvError::Closed) => break,
            },
        }
    }
    Ok(())
}

async fn list(orchestrator: &DeviceOrchestrator) {
    orchestrator.detect_currently_attached_devices().await;
    let devices = orchestrator.devices();
    if devices.is_empty() {
        println!("没有已连接的设备");
    }
    for (index, device) in devices.iter().enumerate() {
        println!("{:>3}. {}", index + 1, describe(device));
    }
}

#[allow(clippy::too_many_arguments)]
async fn sync(
    orchestrator: &DeviceOrchestrator,
    adb: &AdbTool,
    settings: &SyncSettings,
    app: DeviceAppData,
    source_dir: &Path,
    init: InitializeOptions,
    force: bool,
    prune_stale: bool,
) -> anyhow::Result<()> {
    let source_dir = source_dir
        .canonicalize()
        .with_context(|| format!("本地目录不存在: {:?}", source_dir))?;
    let mappings = FileScanner::with_config(settings.scan_config())
        .scan(&source_dir, &app.device_project_root)?;
    info!("扫描到 {} 个路径", mappings.len());

    let mut options = settings.sync_options();
    options.force |= force;
    options.prune_stale |= prune_stale;

    orchestrator.initialize(init).await?;

    let action = |device: Device| {
        let adb = adb.clone();
        let app = app.clone();
        let mappings = mappings.clone();
        let source_dir = source_dir.clone();
        let max_hashes = settings.max_concurrent_hashes;
        async move {
            let transport: Arc<dyn DeviceTransport> = match device.platform {
                Platform::Android => Arc::new(adb.bridge(device.identifier.clone())),
                Platform::Ios => match native_afc_client(&device.identifier) {
                    Some(client) => {
                        Arc::new(AfcTransport::new(client, device.identifier.clone()))
                    }
                    None => anyhow::bail!("当前构建不包含 iOS 文件传输"),
                },
            };
            let syncer = DirectorySyncer::new(transport).with_max_concurrent_hashes(max_hashes);
            let report = syncer
                .transfer_directory(&app, &mappings, &source_dir, &options)
                .await?;
            Ok::<_, anyhow::Error>(report)
        }
    };

    let report = orchestrator
        .execute(action, None, ExecuteOptions::default())
        .await?;

    for outcome in &report.outcomes {
        match &outcome.result {
            Ok(sync_report) => println!("{}", serde_json::to_string_pretty(sync_report)?),
            Err(e) => error!("{}: {:#}", outcome.device.identifier, e),
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config_dir = cli.config_dir.clone().unwrap_or_else(default_config_dir);
    std::fs::create_dir_all(&config_dir)
        .with_context(|| format!("无法创建配置目录 {:?}", config_dir))?;

    init_logging(&config_dir);

    let discovery = DiscoveryConfig::load(&config_dir);
    if cli.ios_detection_worker {
        return run_ios_worker(&discovery);
    }

    let settings = SyncSettings::load(&config_dir);
    let (orchestrator, adb) = build_orchestrator(&discovery);

    let result = match cli.command.unwrap_or(Commands::Watch) {
        Commands::Watch => watch(&orchestrator).await,
        Commands::List => {
            list(&orchestrator).await;
            Ok(())
        }
        Commands::Sync {
            app_id,
            source_dir,
            device_root,
            platform,
            device,
            emulator,
            force,
            prune_stale,
        } => {
            let init = InitializeOptions {
                platform,
                device,
                emulator,
                ..Default::default()
            };
            sync(
                &orchestrator,
                &adb,
                &settings,
                DeviceAppData::new(app_id, device_root),
                &source_dir,
                init,
                force,
                prune_stale,
            )
            .await
        }
    };

    orchestrator.shutdown().await;
    result
}
