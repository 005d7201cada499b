//! 设备发现
//!
//! 每个平台一个引擎，每次 `start_looking_for_devices` 执行一轮
//! 探测 + 对比，通过 `DeviceSink` 报告新增和消失的设备。

pub mod android;
pub mod ios_device;
pub mod ios_simulator;
pub mod ios_worker;

pub use android::{parse_adb_devices, AndroidDeviceDiscovery};
pub use ios_device::{effective_wake_timeout, IosDeviceDiscovery};
pub use ios_simulator::{parse_booted_simulator, IosSimulatorDiscovery};
pub use ios_worker::{NativeDeviceNotifier, NativeNotification, WorkerDevice, WorkerMessage};

use crate::device::{DeviceSink, Platform};
use crate::error::TransportError;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// 与已知集合对比，返回 (新增, 消失)
///
/// 两个结果都保持输入中的顺序。
pub fn reconcile(known: &[String], current: &[String]) -> (Vec<String>, Vec<String>) {
    let known_set: HashSet<&String> = known.iter().collect();
    let current_set: HashSet<&String> = current.iter().collect();

    let mut added = Vec::new();
    for id in current {
        if !known_set.contains(id) && !added.contains(id) {
            added.push(id.clone());
        }
    }
    let removed = known
        .iter()
        .filter(|id| !current_set.contains(id))
        .cloned()
        .collect();

    (added, removed)
}

/// 各平台的发现引擎
pub enum DiscoveryEngine {
    Android(AndroidDeviceDiscovery),
    IosDevice(IosDeviceDiscovery),
    IosSimulator(IosSimulatorDiscovery),
}

impl DiscoveryEngine {
    pub fn name(&self) -> &'static str {
        match self {
            DiscoveryEngine::Android(_) => "android",
            DiscoveryEngine::IosDevice(_) => "ios-device",
            DiscoveryEngine::IosSimulator(_) => "ios-simulator",
        }
    }

    pub fn platform(&self) -> Platform {
        match self {
            DiscoveryEngine::Android(_) => Platform::Android,
            DiscoveryEngine::IosDevice(_) | DiscoveryEngine::IosSimulator(_) => Platform::Ios,
        }
    }

    /// 执行一轮探测并更新注册表
    pub async fn start_looking_for_devices(
        &self,
        sink: &dyn DeviceSink,
    ) -> Result<(), TransportError> {
        match self {
            DiscoveryEngine::Android(engine) => engine.start_looking_for_devices(sink).await,
            DiscoveryEngine::IosDevice(engine) => engine.start_looking_for_devices(sink).await,
            DiscoveryEngine::IosSimulator(engine) => engine.start_looking_for_devices(sink).await,
        }
    }

    /// 释放后台资源（iOS worker）
    pub async fn shutdown(&self) {
        if let DiscoveryEngine::IosDevice(engine) = self {
            engine.shutdown().await;
        }
    }
}

/// 轮询状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollState {
    Idle,
    Polling,
    Stopped,
}

/// 单个引擎的定时轮询
///
/// 每个引擎独立的定时任务，慢的探测不会拖慢其他平台。
pub struct DevicePoller {
    engine: Arc<DiscoveryEngine>,
    interval: Duration,
    state: Arc<Mutex<PollState>>,
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl DevicePoller {
    pub fn new(engine: Arc<DiscoveryEngine>, interval: Duration) -> Self {
        Self {
            engine,
            interval,
            state: Arc::new(Mutex::new(PollState::Idle)),
            cancel: CancellationToken::new(),
            handle: None,
        }
    }

    pub fn state(&self) -> PollState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// 开始轮询，重复调用无效果
    pub fn start(&mut self, sink: Arc<dyn DeviceSink>) {
        if self.state() != PollState::Idle {
            trace!("{} 轮询已启动或已停止，忽略", self.engine.name());
            return;
        }
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = PollState::Polling;

        let engine = self.engine.clone();
        let cancel = self.cancel.clone();
        let period = self.interval;

        self.handle = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            debug!("{} 设备轮询已启动 (间隔 {:?})", engine.name(), period);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => poll_once(&engine, sink.as_ref()).await,
                }
            }

            debug!("{} 设备轮询已停止", engine.name());
        }));
    }

    /// 停止轮询并等待任务退出，可重复调用
    pub async fn stop(&mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = PollState::Stopped;
    }
}

/// 执行一轮探测，错误只记录日志，视为没有变化
pub async fn poll_once(engine: &DiscoveryEngine, sink: &dyn DeviceSink) {
    if let Err(e) = engine.start_looking_for_devices(sink).await {
        trace!("{} 设备探测失败: {}", engine.name(), e);
    }
}
