//! 应用配置模块
//!
//! 所有配置保存在同一个 `config.json` 中，每个模块占一个顶层字段。

use crate::core::scanner::default_exclude_patterns;
use crate::core::{ScanConfig, SyncOptions};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const CONFIG_FILE_NAME: &str = "config.json";

/// 默认配置目录（`<用户配置目录>/livesync`）
pub fn default_config_dir() -> PathBuf {
    crate::dirs::config_dir()
        .map(|p| p.join("livesync"))
        .unwrap_or_else(|| PathBuf::from(".livesync"))
}

/// 读取 `config.json` 中的一个字段，缺失或格式错误时返回默认值
pub(crate) fn load_section<T: DeserializeOwned + Default>(config_dir: &Path, key: &str) -> T {
    let config_file = config_dir.join(CONFIG_FILE_NAME);
    fs::read_to_string(&config_file)
        .ok()
        .and_then(|content| serde_json::from_str::<serde_json::Value>(&content).ok())
        .and_then(|config| config.get(key).cloned())
        .and_then(|section| {
            serde_json::from_value::<T>(section)
                .inspect_err(|e| tracing::warn!("配置项 {} 格式错误，使用默认值: {}", key, e))
                .ok()
        })
        .unwrap_or_default()
}

/// 更新 `config.json` 中的一个字段，其余字段保持不变
pub(crate) fn save_section<T: Serialize>(
    config_dir: &Path,
    key: &str,
    value: &T,
) -> anyhow::Result<()> {
    fs::create_dir_all(config_dir)?;
    let config_file = config_dir.join(CONFIG_FILE_NAME);

    let mut config: serde_json::Value = if config_file.exists() {
        let content = fs::read_to_string(&config_file)?;
        serde_json::from_str(&content).unwrap_or_else(|_| serde_json::json!({}))
    } else {
        serde_json::json!({})
    };
    if !config.is_object() {
        config = serde_json::json!({});
    }

    config[key] = serde_json::to_value(value)?;
    fs::write(&config_file, serde_json::to_string_pretty(&config)?)?;
    Ok(())
}

/// 设备发现配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveryConfig {
    #[serde(default = "default_adb_path")]
    pub adb_path: String,
    #[serde(default = "default_emulator_path")]
    pub emulator_path: String,
    /// 要启动的 AVD，为空时使用第一个
    #[serde(default)]
    pub avd_name: Option<String>,
    /// 要启动的 iOS 模拟器名称，为空时使用第一个
    #[serde(default)]
    pub simulator_name: Option<String>,
    /// 列出模拟器的命令，为空时使用 `xcrun simctl list`
    #[serde(default)]
    pub simulator_list_command: Vec<String>,
    #[serde(default = "default_poll_interval_ms")]
    pub android_poll_interval_ms: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub ios_poll_interval_ms: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub simulator_poll_interval_ms: u64,
    /// iOS 事件循环唤醒间隔，小于 1 秒时按 1 秒处理
    #[serde(default)]
    pub ios_wake_timeout_ms: Option<u64>,
}

fn default_adb_path() -> String {
    "adb".to_string()
}

fn default_emulator_path() -> String {
    "emulator".to_string()
}

fn default_poll_interval_ms() -> u64 {
    2200
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            adb_path: default_adb_path(),
            emulator_path: default_emulator_path(),
            avd_name: None,
            simulator_name: None,
            simulator_list_command: Vec::new(),
            android_poll_interval_ms: default_poll_interval_ms(),
            ios_poll_interval_ms: default_poll_interval_ms(),
            simulator_poll_interval_ms: default_poll_interval_ms(),
            ios_wake_timeout_ms: None,
        }
    }
}

impl DiscoveryConfig {
    pub fn load(config_dir: &Path) -> Self {
        load_section(config_dir, "discovery")
    }

    pub fn save(&self, config_dir: &Path) -> anyhow::Result<()> {
        save_section(config_dir, "discovery", self)
    }

    pub fn android_interval(&self) -> Duration {
        Duration::from_millis(self.android_poll_interval_ms.max(1))
    }

    pub fn ios_interval(&self) -> Duration {
        Duration::from_millis(self.ios_poll_interval_ms.max(1))
    }

    pub fn simulator_interval(&self) -> Duration {
        Duration::from_millis(self.simulator_poll_interval_ms.max(1))
    }

    pub fn ios_wake_timeout(&self) -> Option<Duration> {
        self.ios_wake_timeout_ms.map(Duration::from_millis)
    }
}

/// 同步配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncSettings {
    #[serde(default = "default_exclude_patterns")]
    pub exclude_patterns: Vec<String>,
    /// 默认忽略基线整目录推送
    #[serde(default)]
    pub force: bool,
    #[serde(default)]
    pub prune_stale: bool,
    #[serde(default = "default_max_concurrent_hashes")]
    pub max_concurrent_hashes: usize,
}

fn default_max_concurrent_hashes() -> usize {
    crate::core::engine::DEFAULT_MAX_CONCURRENT_HASHES
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            exclude_patterns: default_exclude_patterns(),
            force: false,
            prune_stale: false,
            max_concurrent_hashes: default_max_concurrent_hashes(),
        }
    }
}

impl SyncSettings {
    pub fn load(config_dir: &Path) -> Self {
        load_section(config_dir, "sync")
    }

    pub fn save(&self, config_dir: &Path) -> anyhow::Result<()> {
        save_section(config_dir, "sync", self)
    }

    pub fn scan_config(&self) -> ScanConfig {
        ScanConfig {
            exclude_patterns: self.exclude_patterns.clone(),
            ..Default::default()
        }
    }

    pub fn sync_options(&self) -> SyncOptions {
        SyncOptions {
            force: self.force,
            prune_stale: self.prune_stale,
        }
    }
}
