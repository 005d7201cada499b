pub mod adb;
pub mod afc;

use crate::error::TransportError;
use async_trait::async_trait;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::trace;

pub use adb::AndroidDebugBridge;
pub use afc::{AfcClient, AfcFileHandle, AfcOpenMode, AfcTransport};

// ============ 公共常量 ============

/// 非 IO 操作超时（秒）- devices, ls, chmod 等
pub const OP_TIMEOUT_SECS: u64 = 60;
/// IO 操作超时（秒）- push, pull 等
pub const IO_TIMEOUT_SECS: u64 = 300;

/// 外部命令执行接口（adb、xcrun 等）
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// 执行命令并返回 stdout，非零退出码视为失败
    async fn run(&self, program: &str, args: &[String]) -> Result<String, TransportError>;

    /// 启动长期运行的进程（模拟器等），不等待退出
    async fn spawn_detached(&self, program: &str, args: &[String]) -> Result<(), TransportError>;
}

/// 基于 tokio::process 的命令执行器
#[derive(Debug, Clone)]
pub struct ProcessRunner {
    timeout: Duration,
}

impl ProcessRunner {
    pub fn new() -> Self {
        Self {
            timeout: Duration::from_secs(IO_TIMEOUT_SECS),
        }
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Default for ProcessRunner {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn run(&self, program: &str, args: &[String]) -> Result<String, TransportError> {
        let command_line = format!("{} {}", program, args.join(" "));
        trace!("执行命令: {}", command_line);

        let output = Command::new(program)
            .args(args)
            .kill_on_drop(true)
            .output();

        let output = match tokio::time::timeout(self.timeout, output).await {
            Ok(result) => result.map_err(|source| TransportError::Spawn {
                program: program.to_string(),
                source,
            })?,
            Err(_) => {
                return Err(TransportError::Timeout {
                    command: command_line,
                    secs: self.timeout.as_secs(),
                })
            }
        };

        if !output.status.success() {
            return Err(TransportError::CommandFailed {
                command: command_line,
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn spawn_detached(&self, program: &str, args: &[String]) -> Result<(), TransportError> {
        trace!("启动后台进程: {} {}", program, args.join(" "));
        Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map(|_| ())
            .map_err(|source| TransportError::Spawn {
                program: program.to_string(),
                source,
            })
    }
}

/// 设备文件传输接口，每个平台一个实现
#[async_trait]
pub trait DeviceTransport: Send + Sync {
    /// 目标设备标识符（用于日志和错误信息）
    fn device_identifier(&self) -> &str;

    /// 应用 hash 文件在设备上的固定位置
    fn hash_file_path(&self, app_identifier: &str) -> String;

    /// 推送单个文件
    async fn push_file(&self, local_path: &Path, device_path: &str) -> Result<(), TransportError>;

    /// 一次性推送整个目录
    async fn push_directory(&self, local_dir: &Path, device_dir: &str)
        -> Result<(), TransportError>;

    /// 在一条远程命令中把所有路径设置为可读写
    async fn normalize_permissions(&self, device_paths: &[String]) -> Result<(), TransportError>;

    /// 读取设备文件，不存在时返回 None
    async fn read_file(&self, device_path: &str) -> Result<Option<Vec<u8>>, TransportError>;

    /// 写入设备文件（覆盖原有内容）
    async fn write_file(&self, device_path: &str, contents: &[u8]) -> Result<(), TransportError>;

    /// 删除设备上的文件或目录，不存在时不报错
    async fn remove_path(&self, device_path: &str) -> Result<(), TransportError>;
}

/// 拼接设备路径（设备端总是使用 /）
pub fn build_device_path(parts: &[&str]) -> String {
    let mut path = String::new();
    for part in parts {
        let trimmed = part.trim_matches('/');
        if trimmed.is_empty() {
            continue;
        }
        path.push('/');
        path.push_str(trimmed);
    }
    if path.is_empty() {
        path.push('/');
    }
    path
}

/// 设备端父目录
pub fn device_parent(device_path: &str) -> Option<&str> {
    let trimmed = device_path.trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(0) => Some("/"),
        Some(idx) => Some(&trimmed[..idx]),
        None => None,
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_device_path() {
        assert_eq!(
            build_device_path(&["/data/local/tmp", "org.app", "hashes"]),
            "/data/local/tmp/org.app/hashes"
        );
        assert_eq!(build_device_path(&["/", ""]), "/");
    }

    #[test]
    fn test_device_parent() {
        assert_eq!(device_parent("/data/local/tmp/a.js"), Some("/data/local/tmp"));
        assert_eq!(device_parent("/a.js"), Some("/"));
        assert_eq!(device_parent("a.js"), None);
    }

    #[tokio::test]
    async fn test_process_runner_reports_missing_program() {
        let runner = ProcessRunner::with_timeout(Duration::from_secs(5));
        let result = runner
            .run("livesync-definitely-missing-binary", &[])
            .await;
        assert!(matches!(result, Err(TransportError::Spawn { .. })));
    }
}
