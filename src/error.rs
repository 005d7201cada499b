//! 错误类型定义

use crate::device::Platform;
use std::path::PathBuf;
use thiserror::Error;

/// 单次设备传输/探测调用失败（进程退出码、socket、AFC 错误）
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("无法启动外部命令 {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("命令执行失败 `{command}` (exit code {code:?}): {stderr}")]
    CommandFailed {
        command: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("命令执行超时 `{command}` ({secs}s)")]
    Timeout { command: String, secs: u64 },

    #[error("AFC 操作失败 {operation} {path}: 错误码 {code:#x}")]
    Afc {
        operation: &'static str,
        path: String,
        code: u32,
    },

    #[error("本地 IO 错误 {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("当前设备不支持该操作: {0}")]
    Unsupported(&'static str),
}

impl TransportError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// 同步失败，携带出错的设备和文件
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("设备 {device} 传输 {path} 失败: {source}")]
    Transfer {
        device: String,
        path: String,
        #[source]
        source: TransportError,
    },

    #[error("设备 {device} 读写 hash 文件失败: {source}")]
    HashStore {
        device: String,
        #[source]
        source: TransportError,
    },

    #[error("计算文件 hash 失败 {path:?}: {source}")]
    Hash {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("设备 {device} 权限设置失败: {source}")]
    Permissions {
        device: String,
        #[source]
        source: TransportError,
    },
}

/// 设备选择与编排错误
#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("设备服务尚未初始化")]
    NotInitialized,

    #[error("未找到已连接的设备")]
    NoDevices,

    #[error("找不到标识符或序号为 '{0}' 的设备")]
    NotFound(String),

    #[error("检测到多个设备平台 ({}), 请指定平台或设备", format_platforms(.candidates))]
    SelectionAmbiguity { candidates: Vec<Platform> },

    #[error("指定的平台 {requested} 与设备 {device} 的平台 {actual} 不匹配")]
    PlatformMismatch {
        device: String,
        requested: Platform,
        actual: Platform,
    },

    #[error("当前环境不支持: {0}")]
    UnsupportedEnvironment(String),

    #[error("启动模拟器失败: {0}")]
    EmulatorStart(#[source] TransportError),

    #[error("所有设备执行失败: {}", .0.join("; "))]
    AllDevicesFailed(Vec<String>),
}

fn format_platforms(platforms: &[Platform]) -> String {
    platforms
        .iter()
        .map(|p| p.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}
