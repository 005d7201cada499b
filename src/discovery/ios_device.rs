use super::ios_worker::{
    spawn_process_worker, spawn_thread_worker, NativeDeviceNotifier, WorkerHandle, WorkerMessage,
    APPLE_SERVICE_NOT_STARTED,
};
use crate::device::DeviceSink;
use crate::error::TransportError;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

/// 事件循环默认唤醒间隔
pub const DEFAULT_WAKE_TIMEOUT: Duration = Duration::from_secs(1);

/// 配置的超时只有大于默认值时才生效
pub fn effective_wake_timeout(configured: Option<Duration>) -> Duration {
    match configured {
        Some(timeout) if timeout > DEFAULT_WAKE_TIMEOUT => timeout,
        _ => DEFAULT_WAKE_TIMEOUT,
    }
}

/// worker 的启动方式
enum WorkerSource {
    Thread(Box<dyn NativeDeviceNotifier>),
    Process { program: PathBuf, args: Vec<String> },
}

struct WorkerState {
    source: Option<WorkerSource>,
    handle: Option<WorkerHandle>,
    messages: Option<mpsc::UnboundedReceiver<WorkerMessage>>,
}

enum Mode {
    Worker(Mutex<WorkerState>),
    Stub,
}

/// iOS 物理设备发现
///
/// 原生服务不可用时退化为只输出一次警告的空实现。
pub struct IosDeviceDiscovery {
    mode: Mode,
    wake_timeout: Duration,
    unavailable_reason: std::sync::Mutex<Option<String>>,
    warned: AtomicBool,
}

impl IosDeviceDiscovery {
    fn with_source(source: WorkerSource, wake_timeout: Option<Duration>) -> Self {
        Self {
            mode: Mode::Worker(Mutex::new(WorkerState {
                source: Some(source),
                handle: None,
                messages: None,
            })),
            wake_timeout: effective_wake_timeout(wake_timeout),
            unavailable_reason: std::sync::Mutex::new(None),
            warned: AtomicBool::new(false),
        }
    }

    /// 在本进程的独立线程中运行通知订阅
    pub fn with_notifier(
        notifier: Box<dyn NativeDeviceNotifier>,
        wake_timeout: Option<Duration>,
    ) -> Self {
        Self::with_source(WorkerSource::Thread(notifier), wake_timeout)
    }

    /// 启动子进程运行 worker，读取其 JSON 行输出
    pub fn with_worker_process(program: PathBuf, args: Vec<String>) -> Self {
        Self::with_source(WorkerSource::Process { program, args }, None)
    }

    /// 永远不会发现设备的实现
    pub fn stub(reason: impl Into<String>) -> Self {
        Self {
            mode: Mode::Stub,
            wake_timeout: DEFAULT_WAKE_TIMEOUT,
            unavailable_reason: std::sync::Mutex::new(Some(reason.into())),
            warned: AtomicBool::new(false),
        }
    }

    /// 按当前主机选择实现
    pub fn for_host(
        notifier: Option<Box<dyn NativeDeviceNotifier>>,
        wake_timeout: Option<Duration>,
    ) -> Self {
        Self::for_host_os(cfg!(target_os = "linux"), notifier, wake_timeout)
    }

    /// Linux 上没有 Apple Mobile Device 服务，直接退化为 stub；
    /// 其他系统没有原生服务时同样退化，订阅失败在首次探测时处理。
    pub fn for_host_os(
        is_linux: bool,
        notifier: Option<Box<dyn NativeDeviceNotifier>>,
        wake_timeout: Option<Duration>,
    ) -> Self {
        if is_linux {
            return Self::stub("当前系统不支持连接 iOS 物理设备");
        }
        match notifier {
            Some(notifier) => Self::with_notifier(notifier, wake_timeout),
            None => Self::stub(
                "Apple Mobile Device 服务未启动，无法操作 iOS 设备。请确认已安装并运行 iTunes",
            ),
        }
    }

    pub fn wake_timeout(&self) -> Duration {
        self.wake_timeout
    }

    pub fn is_stub(&self) -> bool {
        matches!(self.mode, Mode::Stub)
            || self
                .unavailable_reason
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .is_some()
    }

    fn warn_once(&self) {
        if self.warned.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(reason) = self
            .unavailable_reason
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_deref()
        {
            warn!("{}", reason);
        }
    }

    fn degrade(&self, reason: String) {
        *self
            .unavailable_reason
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(reason);
        self.warn_once();
    }

    /// 首次调用时启动 worker，之后每次把积压的消息应用到注册表
    pub async fn start_looking_for_devices(
        &self,
        sink: &dyn DeviceSink,
    ) -> Result<(), TransportError> {
        let state = match &self.mode {
            Mode::Stub => {
                self.warn_once();
                return Ok(());
            }
            Mode::Worker(state) => state,
        };

        let mut state = state.lock().await;

        if let Some(source) = state.source.take() {
            match source {
                WorkerSource::Thread(notifier) => {
                    match spawn_thread_worker(notifier, self.wake_timeout).await {
                        Ok((handle, rx)) => {
                            info!("iOS 设备检测已启动 (唤醒间隔 {:?})", self.wake_timeout);
                            state.handle = Some(handle);
                            state.messages = Some(rx);
                        }
                        Err(code) => {
                            let reason = if code == APPLE_SERVICE_NOT_STARTED {
                                "Apple Mobile Device 服务未启动，无法操作 iOS 设备。请确认已安装并运行 iTunes".to_string()
                            } else {
                                format!("无法订阅 iOS 设备通知: 错误码 {:#x}", code)
                            };
                            self.degrade(reason);
                            return Ok(());
                        }
                    }
                }
                WorkerSource::Process { program, args } => {
                    let (handle, rx) = spawn_process_worker(program, args)?;
                    info!("iOS 设备检测进程已启动");
                    state.handle = Some(handle);
                    state.messages = Some(rx);
                }
            }
        }

        let Some(messages) = state.messages.as_mut() else {
            self.warn_once();
            return Ok(());
        };

        while let Ok(message) = messages.try_recv() {
            match message {
                WorkerMessage::DeviceFound(device) => {
                    info!("发现 iOS 设备: {}", device.identifier);
                    sink.add_device(device.into_device());
                }
                WorkerMessage::DeviceLost(identifier) => {
                    info!("iOS 设备已断开: {}", identifier);
                    sink.remove_device(&identifier);
                }
            }
        }

        Ok(())
    }

    /// 停止后台 worker
    pub async fn shutdown(&self) {
        if let Mode::Worker(state) = &self.mode {
            let mut state = state.lock().await;
            state.messages = None;
            if let Some(handle) = state.handle.take() {
                handle.stop().await;
            } else {
                debug!("iOS 检测 worker 未启动");
            }
        }
    }
}
