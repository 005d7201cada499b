pub mod registry;

pub use registry::{DeviceRegistry, DeviceSink};

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// 设备平台
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Platform {
    Android,
    #[serde(rename = "iOS")]
    Ios,
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Platform::Android => write!(f, "Android"),
            Platform::Ios => write!(f, "iOS"),
        }
    }
}

impl FromStr for Platform {
    type Err = String;

    /// 平台名称不区分大小写
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "android" => Ok(Platform::Android),
            "ios" => Ok(Platform::Ios),
            other => Err(format!("未知平台: {}", other)),
        }
    }
}

/// 连接状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Connected,
    Lost,
}

/// 已发现的设备
///
/// 设备信息不可变，重新连接时整体替换。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Device {
    pub identifier: String,
    pub platform: Platform,
    pub is_emulator: bool,
    pub display_name: String,
    pub model: String,
    pub os_version: String,
    pub status: ConnectionStatus,
}

impl Device {
    pub fn android(identifier: impl Into<String>) -> Self {
        let identifier = identifier.into();
        Self {
            is_emulator: identifier.starts_with("emulator-"),
            display_name: identifier.clone(),
            model: String::new(),
            os_version: String::new(),
            identifier,
            platform: Platform::Android,
            status: ConnectionStatus::Connected,
        }
    }

    pub fn ios_simulator(identifier: impl Into<String>, name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            identifier: identifier.into(),
            platform: Platform::Ios,
            is_emulator: true,
            model: name.clone(),
            display_name: name,
            os_version: String::new(),
            status: ConnectionStatus::Connected,
        }
    }

    pub fn is_ios_simulator(&self) -> bool {
        self.platform == Platform::Ios && self.is_emulator
    }
}

/// 发现事件类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryEventKind {
    Found,
    Lost,
}

/// 设备发现事件，不持久化
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryEvent {
    pub kind: DiscoveryEventKind,
    pub device: Device,
}
