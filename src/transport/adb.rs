//! Android Debug Bridge 传输实现

use super::{build_device_path, device_parent, CommandRunner, DeviceTransport};
use crate::error::TransportError;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, trace};

/// Android 设备上存放 hash 文件和临时脚本的根目录
pub const DEVICE_ROOT_PATH: &str = "/data/local/tmp";
/// hash 文件名
pub const HASH_FILE_NAME: &str = "hashes";
/// 批量 chmod 脚本
const COMMANDS_FILE_NAME: &str = "livesync.commands.sh";

/// adb 工具本身（不绑定具体设备）
#[derive(Clone)]
pub struct AdbTool {
    runner: Arc<dyn CommandRunner>,
    adb_path: String,
}

impl AdbTool {
    pub fn new(runner: Arc<dyn CommandRunner>, adb_path: impl Into<String>) -> Self {
        Self {
            runner,
            adb_path: adb_path.into(),
        }
    }

    /// `adb devices` 的原始输出
    pub async fn devices(&self) -> Result<String, TransportError> {
        self.runner
            .run(&self.adb_path, &["devices".to_string()])
            .await
    }

    /// 确保 adb 守护进程已启动
    pub async fn start_server(&self) -> Result<(), TransportError> {
        self.runner
            .run(&self.adb_path, &["start-server".to_string()])
            .await
            .map(|_| ())
    }

    /// 阻塞直到有设备上线（模拟器启动后使用）
    pub async fn wait_for_device(&self) -> Result<(), TransportError> {
        self.runner
            .run(&self.adb_path, &["wait-for-device".to_string()])
            .await
            .map(|_| ())
    }

    /// 为指定设备创建传输
    pub fn bridge(&self, identifier: impl Into<String>) -> AndroidDebugBridge {
        AndroidDebugBridge {
            tool: self.clone(),
            identifier: identifier.into(),
        }
    }
}

/// 绑定到单台 Android 设备的 adb 传输
pub struct AndroidDebugBridge {
    tool: AdbTool,
    identifier: String,
}

impl AndroidDebugBridge {
    /// `adb -s <id> <args...>`
    pub async fn execute_command(&self, args: &[&str]) -> Result<String, TransportError> {
        let mut full_args = vec!["-s".to_string(), self.identifier.clone()];
        full_args.extend(args.iter().map(|a| a.to_string()));
        self.tool.runner.run(&self.tool.adb_path, &full_args).await
    }

    /// `adb -s <id> shell <args...>`
    pub async fn execute_shell_command(&self, args: &[&str]) -> Result<String, TransportError> {
        let mut shell_args = vec!["shell"];
        shell_args.extend_from_slice(args);
        self.execute_command(&shell_args).await
    }

    /// 检查设备文件是否存在（`ls` 输出恰好是该路径）
    async fn file_exists(&self, device_path: &str) -> Result<bool, TransportError> {
        match self.execute_shell_command(&["ls", device_path]).await {
            Ok(output) => Ok(output.trim() == device_path),
            Err(TransportError::CommandFailed { stderr, .. })
                if stderr.contains("No such file") =>
            {
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    fn commands_file_path(&self) -> String {
        build_device_path(&[DEVICE_ROOT_PATH, COMMANDS_FILE_NAME])
    }
}

/// 创建本地临时目录，调用方负责清理
async fn create_temp_dir() -> Result<PathBuf, TransportError> {
    let dir = std::env::temp_dir().join(format!("livesync-{}", uuid::Uuid::new_v4()));
    tokio::fs::create_dir_all(&dir)
        .await
        .map_err(|e| TransportError::io(&dir, e))?;
    Ok(dir)
}

fn local_str(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

#[async_trait]
impl DeviceTransport for AndroidDebugBridge {
    fn device_identifier(&self) -> &str {
        &self.identifier
    }

    fn hash_file_path(&self, app_identifier: &str) -> String {
        build_device_path(&[DEVICE_ROOT_PATH, app_identifier, HASH_FILE_NAME])
    }

    async fn push_file(&self, local_path: &Path, device_path: &str) -> Result<(), TransportError> {
        trace!("传输 {} -> {}", local_path.display(), device_path);
        self.execute_command(&["push", &local_str(local_path), device_path])
            .await
            .map(|_| ())
    }

    async fn push_directory(
        &self,
        local_dir: &Path,
        device_dir: &str,
    ) -> Result<(), TransportError> {
        debug!("整目录推送 {} -> {}", local_dir.display(), device_dir);
        self.execute_command(&["push", &local_str(local_dir), device_dir])
            .await
            .map(|_| ())
    }

    async fn normalize_permissions(&self, device_paths: &[String]) -> Result<(), TransportError> {
        if device_paths.is_empty() {
            return Ok(());
        }

        // 路径可能很多，写成脚本后一次执行，避免命令行过长
        let quoted: Vec<String> = device_paths.iter().map(|p| format!("\"{}\"", p)).collect();
        let script = format!("chmod 0777 {}", quoted.join(" "));
        let script_path = self.commands_file_path();

        self.write_file(&script_path, script.as_bytes()).await?;
        self.execute_shell_command(&["sh", &script_path])
            .await
            .map(|_| ())
    }

    async fn read_file(&self, device_path: &str) -> Result<Option<Vec<u8>>, TransportError> {
        if !self.file_exists(device_path).await? {
            return Ok(None);
        }

        let temp_dir = create_temp_dir().await?;
        let cleanup_dir = temp_dir.clone();
        scopeguard::defer! {
            let _ = std::fs::remove_dir_all(&cleanup_dir);
        }

        self.execute_command(&["pull", device_path, &local_str(&temp_dir)])
            .await?;

        let file_name = device_path.rsplit('/').next().unwrap_or(HASH_FILE_NAME);
        let local_path = temp_dir.join(file_name);
        match tokio::fs::read(&local_path).await {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(TransportError::io(local_path, e)),
        }
    }

    async fn write_file(&self, device_path: &str, contents: &[u8]) -> Result<(), TransportError> {
        let temp_dir = create_temp_dir().await?;
        let cleanup_dir = temp_dir.clone();
        scopeguard::defer! {
            let _ = std::fs::remove_dir_all(&cleanup_dir);
        }

        let local_path = temp_dir.join("payload");
        tokio::fs::write(&local_path, contents)
            .await
            .map_err(|e| TransportError::io(&local_path, e))?;

        if let Some(parent) = device_parent(device_path) {
            self.execute_shell_command(&["mkdir", "-p", parent]).await?;
        }
        self.push_file(&local_path, device_path).await
    }

    async fn remove_path(&self, device_path: &str) -> Result<(), TransportError> {
        self.execute_shell_command(&["rm", "-rf", device_path])
            .await
            .map(|_| ())
    }
}
