//! 设备选择与跨设备执行

use crate::device::{Device, DeviceRegistry, DeviceSink, DiscoveryEvent, Platform};
use crate::discovery::{poll_once, DevicePoller, DiscoveryEngine};
use crate::emulator::EmulatorServices;
use crate::error::DeviceError;
use futures::future::join_all;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, trace, warn};

/// 默认设备检测间隔
pub const DEVICE_LOOKING_INTERVAL: Duration = Duration::from_millis(2200);

/// 初始化选项
#[derive(Debug, Clone, Default)]
pub struct InitializeOptions {
    pub platform: Option<Platform>,
    /// 设备标识符，或从 1 开始的序号
    pub device: Option<String>,
    pub skip_infer_platform: bool,
    /// 只在模拟器上执行
    pub emulator: bool,
}

/// 执行选项
#[derive(Debug, Clone, Copy, Default)]
pub struct ExecuteOptions {
    /// 没有设备时直接返回，不启动模拟器
    pub allow_no_devices: bool,
}

/// 单台设备的执行结果
#[derive(Debug)]
pub struct DeviceOutcome<T, E> {
    pub device: Device,
    pub result: Result<T, E>,
}

/// 一次执行中每台设备的结果
#[derive(Debug)]
pub struct ExecutionReport<T, E> {
    pub outcomes: Vec<DeviceOutcome<T, E>>,
    /// 被 `can_execute` 过滤掉的设备
    pub skipped: Vec<String>,
}

impl<T, E> ExecutionReport<T, E> {
    fn empty() -> Self {
        Self {
            outcomes: Vec::new(),
            skipped: Vec::new(),
        }
    }

    pub fn succeeded(&self) -> impl Iterator<Item = &DeviceOutcome<T, E>> {
        self.outcomes.iter().filter(|o| o.result.is_ok())
    }

    pub fn failed(&self) -> impl Iterator<Item = &DeviceOutcome<T, E>> {
        self.outcomes.iter().filter(|o| o.result.is_err())
    }
}

#[derive(Debug, Default, Clone)]
struct Selection {
    initialized: bool,
    platform: Option<Platform>,
    device: Option<Device>,
    emulator: bool,
}

/// 设备编排器
///
/// 持有注册表和各平台发现引擎，负责设备选择和在多台设备上并发执行。
pub struct DeviceOrchestrator {
    registry: Arc<DeviceRegistry>,
    engines: Vec<(Arc<DiscoveryEngine>, Duration)>,
    emulators: Vec<Arc<dyn EmulatorServices>>,
    is_darwin: bool,
    selection: Mutex<Selection>,
    pollers: Mutex<Vec<DevicePoller>>,
}

impl DeviceOrchestrator {
    pub fn new(registry: Arc<DeviceRegistry>) -> Self {
        Self {
            registry,
            engines: Vec::new(),
            emulators: Vec::new(),
            is_darwin: cfg!(target_os = "macos"),
            selection: Mutex::new(Selection::default()),
            pollers: Mutex::new(Vec::new()),
        }
    }

    /// 注册发现引擎及其轮询间隔
    pub fn with_engine(mut self, engine: DiscoveryEngine, interval: Duration) -> Self {
        self.engines.push((Arc::new(engine), interval));
        self
    }

    pub fn with_emulator(mut self, services: Arc<dyn EmulatorServices>) -> Self {
        self.emulators.push(services);
        self
    }

    pub fn with_host_darwin(mut self, is_darwin: bool) -> Self {
        self.is_darwin = is_darwin;
        self
    }

    pub fn registry(&self) -> &Arc<DeviceRegistry> {
        &self.registry
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DiscoveryEvent> {
        self.registry.subscribe()
    }

    /// 当前设备，按平台名和标识符排序
    pub fn devices(&self) -> Vec<Device> {
        let mut devices = self.registry.list_devices();
        sort_devices(&mut devices);
        devices
    }

    pub fn devices_for_platform(&self, platform: Platform) -> Vec<Device> {
        let mut devices = self.registry.devices_for_platform(platform);
        sort_devices(&mut devices);
        devices
    }

    pub async fn platform(&self) -> Option<Platform> {
        self.selection.lock().await.platform
    }

    pub async fn device_count(&self) -> usize {
        let selection = self.selection.lock().await.clone();
        if selection.device.is_some() {
            1
        } else {
            self.connected_devices(selection.platform).len()
        }
    }

    pub async fn has_devices(&self) -> bool {
        let platform = self.selection.lock().await.platform;
        !self.connected_devices(platform).is_empty()
    }

    fn connected_devices(&self, platform: Option<Platform>) -> Vec<Device> {
        match platform {
            Some(platform) => self.devices_for_platform(platform),
            None => self.devices(),
        }
    }

    fn sink(&self) -> Arc<dyn DeviceSink> {
        self.registry.clone()
    }

    fn engine_enabled(&self, engine: &DiscoveryEngine) -> bool {
        !matches!(engine, DiscoveryEngine::IosSimulator(_)) || self.is_darwin
    }

    /// 对所有引擎执行一轮探测，错误只记录日志
    pub async fn detect_currently_attached_devices(&self) {
        for (engine, _) in &self.engines {
            if self.engine_enabled(engine) {
                poll_once(engine, self.registry.as_ref()).await;
            }
        }
    }

    /// 探测指定平台的设备，未指定平台时探测全部
    pub async fn start_looking_for_devices(&self, platform: Option<Platform>) {
        trace!("start_looking_for_devices; platform = {:?}", platform);
        for (engine, _) in &self.engines {
            if !self.engine_enabled(engine) {
                continue;
            }
            if platform.map_or(true, |p| engine.platform() == p) {
                poll_once(engine, self.registry.as_ref()).await;
            }
        }
    }

    /// 按标识符或 1 开始的序号查找设备
    async fn resolve_device(&self, option: &str) -> Result<Device, DeviceError> {
        self.detect_currently_attached_devices().await;

        if let Some(device) = self.registry.get(option) {
            return Ok(device);
        }

        if let Ok(index) = option.trim().parse::<usize>() {
            let devices = self.devices();
            if index >= 1 && index <= devices.len() {
                return Ok(devices[index - 1].clone());
            }
        }

        Err(DeviceError::NotFound(option.to_string()))
    }

    /// 初始化设备选择，重复调用直接返回
    pub async fn initialize(&self, options: InitializeOptions) -> Result<(), DeviceError> {
        let mut selection = self.selection.lock().await;
        if selection.initialized {
            return Ok(());
        }

        let mut next = Selection {
            emulator: options.emulator,
            ..Default::default()
        };

        match (options.platform, options.device.as_deref()) {
            (Some(platform), Some(device_option)) => {
                let device = self.resolve_device(device_option).await?;
                if device.platform != platform {
                    return Err(DeviceError::PlatformMismatch {
                        device: device.identifier,
                        requested: platform,
                        actual: device.platform,
                    });
                }
                warn!("应用只会部署到指定的设备 {}", device.identifier);
                next.platform = Some(device.platform);
                next.device = Some(device);
            }
            (None, Some(device_option)) => {
                let device = self.resolve_device(device_option).await?;
                next.platform = Some(device.platform);
                next.device = Some(device);
            }
            (Some(platform), None) => {
                next.platform = Some(platform);
                self.start_looking_for_devices(Some(platform)).await;
            }
            (None, None) => {
                if options.skip_infer_platform {
                    self.start_looking_for_devices(None).await;
                } else {
                    self.detect_currently_attached_devices().await;
                    let mut candidates: Vec<Platform> = Vec::new();
                    for device in self.devices() {
                        if !candidates.contains(&device.platform) {
                            candidates.push(device.platform);
                        }
                    }
                    match candidates.len() {
                        0 => return Err(DeviceError::NoDevices),
                        1 => next.platform = Some(candidates[0]),
                        _ => {
                            debug!("检测到多个平台: {:?}", candidates);
                            return Err(DeviceError::SelectionAmbiguity { candidates });
                        }
                    }
                }
            }
        }

        if !self.is_darwin && next.platform == Some(Platform::Ios) && next.emulator {
            return Err(DeviceError::UnsupportedEnvironment(
                "iOS 模拟器只能在 macOS 上使用".to_string(),
            ));
        }

        next.initialized = true;
        *selection = next;
        info!(
            "设备服务初始化完成: platform = {:?}, device = {:?}",
            selection.platform,
            selection.device.as_ref().map(|d| &d.identifier)
        );
        Ok(())
    }

    fn only_ios_simulator_running(&self, platform: Option<Platform>) -> bool {
        let devices = self.devices();
        platform == Some(Platform::Ios)
            && devices.iter().any(|d| d.is_emulator)
            && !devices.iter().any(|d| !d.is_emulator)
    }

    /// 启动目标平台的模拟器并重新探测
    async fn start_emulator(&self, platform: Option<Platform>) -> Result<(), DeviceError> {
        let services = platform
            .filter(|p| *p == Platform::Android || self.is_darwin)
            .and_then(|p| self.emulators.iter().find(|s| s.platform() == p))
            .ok_or_else(|| {
                DeviceError::UnsupportedEnvironment("无法确定要启动模拟器的平台".to_string())
            })?;

        services
            .start_emulator()
            .await
            .map_err(DeviceError::EmulatorStart)?;

        for (engine, _) in &self.engines {
            let rediscover = match engine.as_ref() {
                DiscoveryEngine::Android(_) => platform == Some(Platform::Android),
                DiscoveryEngine::IosSimulator(_) => platform == Some(Platform::Ios) && self.is_darwin,
                DiscoveryEngine::IosDevice(_) => false,
            };
            if rediscover {
                poll_once(engine, self.registry.as_ref()).await;
            }
        }
        Ok(())
    }

    /// 在选中的设备上并发执行 `action`
    ///
    /// 选定单台设备时只在该设备上执行，否则在所有匹配平台的设备上执行。
    /// 等待所有设备完成后返回；只有全部设备失败时才返回错误。
    pub async fn execute<T, E, F, Fut>(
        &self,
        action: F,
        can_execute: Option<&(dyn Fn(&Device) -> bool + Sync)>,
        options: ExecuteOptions,
    ) -> Result<ExecutionReport<T, E>, DeviceError>
    where
        F: Fn(Device) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        let selection = self.selection.lock().await.clone();
        if !selection.initialized {
            return Err(DeviceError::NotInitialized);
        }

        let has_devices = !self.connected_devices(selection.platform).is_empty();

        if has_devices {
            let simulators_only = self.is_darwin
                && selection.platform == Some(Platform::Ios)
                && selection.emulator
                && !self.only_ios_simulator_running(selection.platform);
            if simulators_only {
                self.start_emulator(selection.platform).await?;
            }
            let filter = |device: &Device| {
                (!simulators_only || device.is_ios_simulator())
                    && can_execute.map_or(true, |f| f(device))
            };
            return self.execute_core(&selection, &action, &filter).await;
        }

        if options.allow_no_devices {
            info!("{}", DeviceError::NoDevices);
            return Ok(ExecutionReport::empty());
        }

        if !self.is_darwin && selection.platform == Some(Platform::Ios) {
            return Err(DeviceError::NoDevices);
        }

        // 没有设备时启动一次模拟器后重试，不再循环
        self.start_emulator(selection.platform).await?;
        if self.connected_devices(selection.platform).is_empty() {
            return Err(DeviceError::NoDevices);
        }
        let filter = |device: &Device| can_execute.map_or(true, |f| f(device));
        self.execute_core(&selection, &action, &filter).await
    }

    async fn execute_core<T, E, F, Fut>(
        &self,
        selection: &Selection,
        action: &F,
        can_execute: &(dyn Fn(&Device) -> bool + Sync),
    ) -> Result<ExecutionReport<T, E>, DeviceError>
    where
        F: Fn(Device) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        let targets = match &selection.device {
            Some(device) => vec![device.clone()],
            None => self.connected_devices(selection.platform),
        };

        let mut report = ExecutionReport::empty();
        let mut runnable = Vec::new();
        for device in targets {
            if can_execute(&device) {
                runnable.push(device);
            } else {
                report.skipped.push(device.identifier);
            }
        }

        let results = join_all(runnable.iter().cloned().map(action)).await;

        let mut failures = Vec::new();
        for (device, result) in runnable.into_iter().zip(results) {
            if let Err(e) = &result {
                warn!("设备 {} 执行失败: {}", device.identifier, e);
                failures.push(format!("{}: {}", device.identifier, e));
            }
            report.outcomes.push(DeviceOutcome { device, result });
        }

        if !report.outcomes.is_empty() && failures.len() == report.outcomes.len() {
            return Err(DeviceError::AllDevicesFailed(failures));
        }
        Ok(report)
    }

    /// 启动所有引擎的定时检测，已启动时忽略
    pub async fn start_device_detection_interval(&self) {
        let mut pollers = self.pollers.lock().await;
        if !pollers.is_empty() {
            trace!("设备检测已启动，不会重复启动");
            return;
        }

        for (engine, interval) in &self.engines {
            if !self.engine_enabled(engine) {
                continue;
            }
            let mut poller = DevicePoller::new(engine.clone(), *interval);
            poller.start(self.sink());
            pollers.push(poller);
        }
        info!("设备检测已启动 ({} 个引擎)", pollers.len());
    }

    /// 停止定时检测，未启动时忽略
    pub async fn stop_device_detection_interval(&self) {
        let mut pollers = self.pollers.lock().await;
        if pollers.is_empty() {
            trace!("设备检测未启动，无需停止");
            return;
        }
        for poller in pollers.iter_mut() {
            poller.stop().await;
        }
        pollers.clear();
        info!("设备检测已停止");
    }

    /// 停止检测并释放各引擎的后台资源
    pub async fn shutdown(&self) {
        self.stop_device_detection_interval().await;
        for (engine, _) in &self.engines {
            engine.shutdown().await;
        }
    }
}

fn sort_devices(devices: &mut [Device]) {
    devices.sort_by(|a, b| {
        a.platform
            .to_string()
            .cmp(&b.platform.to_string())
            .then_with(|| a.identifier.cmp(&b.identifier))
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransportError;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn registry_with(devices: Vec<Device>) -> Arc<DeviceRegistry> {
        let registry = Arc::new(DeviceRegistry::new());
        for device in devices {
            registry.add_device(device);
        }
        registry
    }

    fn ios_device(id: &str) -> Device {
        let mut device = Device::ios_simulator(id, "iPhone");
        device.is_emulator = false;
        device
    }

    /// 启动时向注册表加入一台设备
    struct FakeEmulator {
        platform: Platform,
        registry: Arc<DeviceRegistry>,
        starts: AtomicUsize,
        device: Device,
    }

    #[async_trait]
    impl EmulatorServices for FakeEmulator {
        fn platform(&self) -> Platform {
            self.platform
        }

        async fn start_emulator(&self) -> Result<(), TransportError> {
            self.starts.fetch_add(1, Ordering::SeqCst);
            self.registry.add_device(self.device.clone());
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_execute_settles_all_devices() {
        let registry = registry_with(vec![
            Device::android("device-x"),
            Device::android("device-y"),
        ]);
        let orchestrator = DeviceOrchestrator::new(registry);
        orchestrator
            .initialize(InitializeOptions {
                platform: Some(Platform::Android),
                ..Default::default()
            })
            .await
            .unwrap();

        let report = orchestrator
            .execute(
                |device: Device| async move {
                    if device.identifier == "device-x" {
                        Err("push failed".to_string())
                    } else {
                        Ok(device.identifier)
                    }
                },
                None,
                ExecuteOptions::default(),
            )
            .await
            .unwrap();

        assert_eq!(report.outcomes.len(), 2);
        let succeeded: Vec<_> = report.succeeded().map(|o| o.device.identifier.clone()).collect();
        assert_eq!(succeeded, vec!["device-y"]);
        assert_eq!(report.failed().count(), 1);
    }

    #[tokio::test]
    async fn test_execute_fails_when_every_device_fails() {
        let registry = registry_with(vec![Device::android("a"), Device::android("b")]);
        let orchestrator = DeviceOrchestrator::new(registry);
        orchestrator
            .initialize(InitializeOptions::default())
            .await
            .unwrap();

        let result = orchestrator
            .execute(
                |_device: Device| async { Err::<(), _>("boom") },
                None,
                ExecuteOptions::default(),
            )
            .await;

        match result {
            Err(DeviceError::AllDevicesFailed(failures)) => assert_eq!(failures.len(), 2),
            other => panic!("unexpected: {:?}", other.map(|r| r.outcomes.len())),
        }
    }

    #[tokio::test]
    async fn test_can_execute_filters_devices() {
        let registry = registry_with(vec![Device::android("a"), Device::android("b")]);
        let orchestrator = DeviceOrchestrator::new(registry);
        orchestrator
            .initialize(InitializeOptions::default())
            .await
            .unwrap();

        let only_b = |d: &Device| d.identifier == "b";
        let report = orchestrator
            .execute(
                |_device: Device| async { Ok::<_, String>(()) },
                Some(&only_b),
                ExecuteOptions::default(),
            )
            .await
            .unwrap();

        assert_eq!(report.outcomes.len(), 1);
        assert_eq!(report.skipped, vec!["a"]);
    }

    #[tokio::test]
    async fn test_execute_requires_initialize() {
        let orchestrator = DeviceOrchestrator::new(Arc::new(DeviceRegistry::new()));
        let result = orchestrator
            .execute(
                |_device: Device| async { Ok::<_, String>(()) },
                None,
                ExecuteOptions::default(),
            )
            .await;
        assert!(matches!(result, Err(DeviceError::NotInitialized)));
    }

    #[tokio::test]
    async fn test_initialize_is_idempotent() {
        let registry = registry_with(vec![Device::android("a")]);
        let orchestrator = DeviceOrchestrator::new(registry);

        orchestrator
            .initialize(InitializeOptions::default())
            .await
            .unwrap();
        orchestrator
            .initialize(InitializeOptions {
                platform: Some(Platform::Ios),
                ..Default::default()
            })
            .await
            .unwrap();

        assert_eq!(orchestrator.platform().await, Some(Platform::Android));
    }

    #[tokio::test]
    async fn test_multiple_platforms_is_ambiguous() {
        let registry = registry_with(vec![Device::android("a"), ios_device("b")]);
        let orchestrator = DeviceOrchestrator::new(registry);

        let result = orchestrator.initialize(InitializeOptions::default()).await;

        match result {
            Err(DeviceError::SelectionAmbiguity { candidates }) => {
                assert_eq!(candidates, vec![Platform::Android, Platform::Ios]);
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_no_devices_without_platform() {
        let orchestrator = DeviceOrchestrator::new(Arc::new(DeviceRegistry::new()));
        let result = orchestrator.initialize(InitializeOptions::default()).await;
        assert!(matches!(result, Err(DeviceError::NoDevices)));
    }

    #[tokio::test]
    async fn test_skip_infer_platform_allows_no_devices() {
        let orchestrator = DeviceOrchestrator::new(Arc::new(DeviceRegistry::new()));
        orchestrator
            .initialize(InitializeOptions {
                skip_infer_platform: true,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(orchestrator.platform().await, None);
    }

    #[tokio::test]
    async fn test_device_by_index() {
        let registry = registry_with(vec![Device::android("b"), Device::android("a")]);
        let orchestrator = DeviceOrchestrator::new(registry);

        orchestrator
            .initialize(InitializeOptions {
                device: Some("2".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();

        assert_eq!(orchestrator.device_count().await, 1);
        let report = orchestrator
            .execute(
                |device: Device| async move { Ok::<_, String>(device.identifier) },
                None,
                ExecuteOptions::default(),
            )
            .await
            .unwrap();
        assert_eq!(report.outcomes[0].device.identifier, "b");
    }

    #[tokio::test]
    async fn test_unknown_device_option() {
        let registry = registry_with(vec![Device::android("a")]);
        let orchestrator = DeviceOrchestrator::new(registry);

        let result = orchestrator
            .initialize(InitializeOptions {
                device: Some("5".to_string()),
                ..Default::default()
            })
            .await;

        assert!(matches!(result, Err(DeviceError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_platform_must_match_device() {
        let registry = registry_with(vec![Device::android("emulator-5554")]);
        let orchestrator = DeviceOrchestrator::new(registry);

        let result = orchestrator
            .initialize(InitializeOptions {
                platform: Some(Platform::Ios),
                device: Some("emulator-5554".to_string()),
                ..Default::default()
            })
            .await;

        assert!(matches!(result, Err(DeviceError::PlatformMismatch { .. })));
    }

    #[tokio::test]
    async fn test_ios_emulator_requires_darwin() {
        let orchestrator =
            DeviceOrchestrator::new(Arc::new(DeviceRegistry::new())).with_host_darwin(false);

        let result = orchestrator
            .initialize(InitializeOptions {
                platform: Some(Platform::Ios),
                emulator: true,
                ..Default::default()
            })
            .await;

        assert!(matches!(result, Err(DeviceError::UnsupportedEnvironment(_))));
    }

    #[tokio::test]
    async fn test_no_devices_starts_emulator_once() {
        let registry = Arc::new(DeviceRegistry::new());
        let emulator = Arc::new(FakeEmulator {
            platform: Platform::Android,
            registry: registry.clone(),
            starts: AtomicUsize::new(0),
            device: Device::android("emulator-5554"),
        });
        let orchestrator = DeviceOrchestrator::new(registry).with_emulator(emulator.clone());
        orchestrator
            .initialize(InitializeOptions {
                platform: Some(Platform::Android),
                ..Default::default()
            })
            .await
            .unwrap();

        let report = orchestrator
            .execute(
                |device: Device| async move { Ok::<_, String>(device.identifier) },
                None,
                ExecuteOptions::default(),
            )
            .await
            .unwrap();

        assert_eq!(emulator.starts.load(Ordering::SeqCst), 1);
        assert_eq!(report.outcomes.len(), 1);
    }

    #[tokio::test]
    async fn test_allow_no_devices() {
        let orchestrator = DeviceOrchestrator::new(Arc::new(DeviceRegistry::new()));
        orchestrator
            .initialize(InitializeOptions {
                platform: Some(Platform::Android),
                ..Default::default()
            })
            .await
            .unwrap();

        let report = orchestrator
            .execute(
                |_device: Device| async { Ok::<_, String>(()) },
                None,
                ExecuteOptions {
                    allow_no_devices: true,
                },
            )
            .await
            .unwrap();

        assert!(report.outcomes.is_empty());
    }

    #[tokio::test]
    async fn test_ios_without_darwin_fails_without_devices() {
        let orchestrator =
            DeviceOrchestrator::new(Arc::new(DeviceRegistry::new())).with_host_darwin(false);
        orchestrator
            .initialize(InitializeOptions {
                platform: Some(Platform::Ios),
                ..Default::default()
            })
            .await
            .unwrap();

        let result = orchestrator
            .execute(
                |_device: Device| async { Ok::<_, String>(()) },
                None,
                ExecuteOptions::default(),
            )
            .await;

        assert!(matches!(result, Err(DeviceError::NoDevices)));
    }

    #[tokio::test]
    async fn test_detection_interval_start_stop_idempotent() {
        use crate::discovery::AndroidDeviceDiscovery;
        use crate::transport::adb::AdbTool;
        use crate::transport::testing::ScriptedRunner;

        let runner = Arc::new(ScriptedRunner::new());
        let engine = DiscoveryEngine::Android(AndroidDeviceDiscovery::new(AdbTool::new(
            runner, "adb",
        )));
        let orchestrator = DeviceOrchestrator::new(Arc::new(DeviceRegistry::new()))
            .with_engine(engine, Duration::from_millis(10));

        orchestrator.stop_device_detection_interval().await;
        orchestrator.start_device_detection_interval().await;
        orchestrator.start_device_detection_interval().await;
        assert_eq!(orchestrator.pollers.lock().await.len(), 1);

        orchestrator.stop_device_detection_interval().await;
        orchestrator.stop_device_detection_interval().await;
        assert!(orchestrator.pollers.lock().await.is_empty());
    }
}
