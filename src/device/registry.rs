//! 设备注册表 - 当前已知设备的唯一数据源

use super::{Device, DiscoveryEvent, DiscoveryEventKind, Platform};
use std::collections::HashMap;
use std::sync::RwLock;
use tokio::sync::broadcast;
use tracing::trace;

/// 事件通道容量，慢订阅者会丢失最旧的事件
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// 发现引擎向外报告设备变化的接口
pub trait DeviceSink: Send + Sync {
    fn add_device(&self, device: Device);
    fn remove_device(&self, identifier: &str);
}

/// 设备注册表
///
/// 所有修改都经过 `add_device` / `remove_device`，同一标识符后写入者覆盖。
pub struct DeviceRegistry {
    devices: RwLock<HashMap<String, Device>>,
    events: broadcast::Sender<DiscoveryEvent>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            devices: RwLock::new(HashMap::new()),
            events,
        }
    }

    /// 订阅 Found/Lost 事件
    pub fn subscribe(&self) -> broadcast::Receiver<DiscoveryEvent> {
        self.events.subscribe()
    }

    /// 当前设备快照（顺序不保证）
    pub fn list_devices(&self) -> Vec<Device> {
        let devices = self.devices.read().unwrap_or_else(|e| e.into_inner());
        devices.values().cloned().collect()
    }

    pub fn get(&self, identifier: &str) -> Option<Device> {
        let devices = self.devices.read().unwrap_or_else(|e| e.into_inner());
        devices.get(identifier).cloned()
    }

    pub fn devices_for_platform(&self, platform: Platform) -> Vec<Device> {
        let devices = self.devices.read().unwrap_or_else(|e| e.into_inner());
        devices
            .values()
            .filter(|d| d.platform == platform)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.devices.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn emit(&self, kind: DiscoveryEventKind, device: Device) {
        // 没有订阅者时发送失败，忽略即可
        let _ = self.events.send(DiscoveryEvent { kind, device });
    }
}

impl DeviceSink for DeviceRegistry {
    fn add_device(&self, device: Device) {
        trace!(
            "发现设备 '{}' ({}), pid = {}",
            device.identifier,
            device.platform,
            std::process::id()
        );
        {
            let mut devices = self.devices.write().unwrap_or_else(|e| e.into_inner());
            devices.insert(device.identifier.clone(), device.clone());
        }
        self.emit(DiscoveryEventKind::Found, device);
    }

    fn remove_device(&self, identifier: &str) {
        let removed = {
            let mut devices = self.devices.write().unwrap_or_else(|e| e.into_inner());
            devices.remove(identifier)
        };

        if let Some(device) = removed {
            trace!("设备已断开 '{}', pid = {}", identifier, std::process::id());
            self.emit(DiscoveryEventKind::Lost, device);
        }
    }
}

impl Default for DeviceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(rx: &mut broadcast::Receiver<DiscoveryEvent>) -> Vec<DiscoveryEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[test]
    fn test_add_twice_keeps_single_entry() {
        let registry = DeviceRegistry::new();
        registry.add_device(Device::android("emulator-5554"));
        registry.add_device(Device::android("emulator-5554"));

        assert_eq!(registry.len(), 1);
        assert!(registry.get("emulator-5554").is_some());
    }

    #[test]
    fn test_last_write_wins() {
        let registry = DeviceRegistry::new();
        let mut first = Device::android("serial-1");
        first.model = "Pixel 6".to_string();
        let mut second = Device::android("serial-1");
        second.model = "Pixel 8".to_string();

        registry.add_device(first);
        registry.add_device(second);

        assert_eq!(registry.get("serial-1").unwrap().model, "Pixel 8");
    }

    #[test]
    fn test_add_then_remove_fires_one_lost() {
        let registry = DeviceRegistry::new();
        let mut rx = registry.subscribe();

        registry.add_device(Device::android("emulator-5554"));
        registry.remove_device("emulator-5554");
        registry.remove_device("emulator-5554");

        assert!(registry.list_devices().is_empty());

        let events = drain(&mut rx);
        let lost: Vec<_> = events
            .iter()
            .filter(|e| e.kind == DiscoveryEventKind::Lost)
            .collect();
        assert_eq!(lost.len(), 1);
        assert_eq!(lost[0].device.identifier, "emulator-5554");
    }

    #[test]
    fn test_remove_unknown_is_noop() {
        let registry = DeviceRegistry::new();
        let mut rx = registry.subscribe();

        registry.remove_device("missing");

        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn test_devices_for_platform() {
        let registry = DeviceRegistry::new();
        registry.add_device(Device::android("emulator-5554"));
        registry.add_device(Device::ios_simulator("sim-1", "iPhone 6"));

        assert_eq!(registry.devices_for_platform(Platform::Ios).len(), 1);
        assert_eq!(registry.devices_for_platform(Platform::Android).len(), 1);
    }
}
