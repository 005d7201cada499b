use super::reconcile;
use crate::device::{Device, DeviceSink};
use crate::error::TransportError;
use crate::transport::adb::{AdbTool, AndroidDebugBridge};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use tracing::{debug, info};

/// 就绪设备在 `adb devices` 中的状态
const READY_STATE: &str = "device";

/// 解析 `adb devices` 输出，只返回状态为 `device` 的标识符
///
/// `List of devices attached` 表头和空行没有状态列，自然被过滤。
pub fn parse_adb_devices(output: &str) -> Vec<String> {
    output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .filter_map(|line| {
            let mut parts = line.split('\t');
            let identifier = parts.next()?.trim();
            let state = parts.next()?.trim();
            (state == READY_STATE && !identifier.is_empty()).then(|| identifier.to_string())
        })
        .collect()
}

/// Android 设备发现
///
/// 与自己跟踪的列表对比，而不是与注册表对比。
pub struct AndroidDeviceDiscovery {
    tool: AdbTool,
    tracked: Mutex<Vec<String>>,
    server_started: AtomicBool,
}

impl AndroidDeviceDiscovery {
    pub fn new(tool: AdbTool) -> Self {
        Self {
            tool,
            tracked: Mutex::new(Vec::new()),
            server_started: AtomicBool::new(false),
        }
    }

    pub fn tool(&self) -> &AdbTool {
        &self.tool
    }

    /// 为已发现的设备创建传输
    pub fn bridge(&self, identifier: &str) -> AndroidDebugBridge {
        self.tool.bridge(identifier)
    }

    /// 首次探测前启动 adb 守护进程，只执行一次
    pub async fn ensure_adb_server_started(&self) -> Result<(), TransportError> {
        if self.server_started.load(Ordering::SeqCst) {
            return Ok(());
        }
        self.tool.start_server().await?;
        self.server_started.store(true, Ordering::SeqCst);
        debug!("adb server 已启动");
        Ok(())
    }

    pub fn tracked_devices(&self) -> Vec<String> {
        self.tracked.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub async fn start_looking_for_devices(
        &self,
        sink: &dyn DeviceSink,
    ) -> Result<(), TransportError> {
        self.ensure_adb_server_started().await?;

        let output = self.tool.devices().await?;
        let current = parse_adb_devices(&output);

        let (added, removed) = {
            let mut tracked = self.tracked.lock().unwrap_or_else(|e| e.into_inner());
            let diff = reconcile(&tracked, &current);
            *tracked = current;
            diff
        };

        for identifier in added {
            info!("发现 Android 设备: {}", identifier);
            sink.add_device(Device::android(identifier));
        }
        for identifier in removed {
            info!("Android 设备已断开: {}", identifier);
            sink.remove_device(&identifier);
        }

        Ok(())
    }
}
