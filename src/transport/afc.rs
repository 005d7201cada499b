//! iOS 物理设备的 AFC 文件传输
//!
//! 原生 AFC 接口是阻塞调用，所有操作都放到 `spawn_blocking` 中执行。

use super::{build_device_path, device_parent, DeviceTransport};
use crate::error::TransportError;
use async_trait::async_trait;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, trace};
use walkdir::WalkDir;

/// 应用沙盒内存放 hash 文件的目录
pub const DEVICE_ROOT_PATH: &str = "/Library/Application Support/LiveSync";
/// 对象不存在
pub const AFC_E_OBJECT_NOT_FOUND: u32 = 8;

/// 每次读写的块大小
const CHUNK_SIZE: usize = 64 * 1024;

/// 打开模式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum AfcOpenMode {
    Read = 1,
    /// 只写，文件不存在时创建，存在时截断
    Write = 3,
}

/// 打开文件后得到的句柄
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AfcFileHandle(pub u64);

/// 原生 AFC 服务接口，错误返回 AFC 错误码
pub trait AfcClient: Send + Sync {
    fn open(&self, path: &str, mode: AfcOpenMode) -> Result<AfcFileHandle, u32>;
    /// 读取至多 `len` 字节，返回空表示已到文件末尾
    fn read(&self, handle: AfcFileHandle, len: usize) -> Result<Vec<u8>, u32>;
    fn write(&self, handle: AfcFileHandle, data: &[u8]) -> Result<(), u32>;
    fn close(&self, handle: AfcFileHandle) -> Result<(), u32>;
    fn remove(&self, path: &str) -> Result<(), u32>;
    /// 递归创建目录，已存在时不报错
    fn make_directory(&self, path: &str) -> Result<(), u32>;
}

/// 通过 AFC 访问单台 iOS 设备上应用沙盒的传输
pub struct AfcTransport {
    client: Arc<dyn AfcClient>,
    identifier: String,
}

impl AfcTransport {
    pub fn new(client: Arc<dyn AfcClient>, identifier: impl Into<String>) -> Self {
        Self {
            client,
            identifier: identifier.into(),
        }
    }

    async fn run_blocking<T, F>(&self, f: F) -> Result<T, TransportError>
    where
        T: Send + 'static,
        F: FnOnce(&dyn AfcClient) -> Result<T, TransportError> + Send + 'static,
    {
        let client = self.client.clone();
        tokio::task::spawn_blocking(move || f(client.as_ref()))
            .await
            .map_err(|e| TransportError::io(PathBuf::new(), io::Error::new(io::ErrorKind::Other, e)))?
    }
}

fn afc_error(operation: &'static str, path: &str, code: u32) -> TransportError {
    TransportError::Afc {
        operation,
        path: path.to_string(),
        code,
    }
}

fn ensure_parent(client: &dyn AfcClient, device_path: &str) -> Result<(), TransportError> {
    if let Some(parent) = device_parent(device_path) {
        client
            .make_directory(parent)
            .map_err(|code| afc_error("mkdir", parent, code))?;
    }
    Ok(())
}

fn write_blocking(
    client: &dyn AfcClient,
    device_path: &str,
    contents: &[u8],
) -> Result<(), TransportError> {
    ensure_parent(client, device_path)?;

    let handle = client
        .open(device_path, AfcOpenMode::Write)
        .map_err(|code| afc_error("open", device_path, code))?;

    let written = contents
        .chunks(CHUNK_SIZE)
        .try_for_each(|chunk| client.write(handle, chunk))
        .map_err(|code| afc_error("write", device_path, code));

    // 写入失败也要关闭句柄
    let closed = client
        .close(handle)
        .map_err(|code| afc_error("close", device_path, code));

    written.and(closed)
}

fn read_blocking(
    client: &dyn AfcClient,
    device_path: &str,
) -> Result<Option<Vec<u8>>, TransportError> {
    let handle = match client.open(device_path, AfcOpenMode::Read) {
        Ok(handle) => handle,
        Err(AFC_E_OBJECT_NOT_FOUND) => return Ok(None),
        Err(code) => return Err(afc_error("open", device_path, code)),
    };

    let mut data = Vec::new();
    let result = loop {
        match client.read(handle, CHUNK_SIZE) {
            Ok(chunk) if chunk.is_empty() => break Ok(()),
            Ok(chunk) => data.extend_from_slice(&chunk),
            Err(code) => break Err(afc_error("read", device_path, code)),
        }
    };

    let closed = client
        .close(handle)
        .map_err(|code| afc_error("close", device_path, code));

    result.and(closed).map(|_| Some(data))
}

fn push_directory_blocking(
    client: &dyn AfcClient,
    local_dir: &Path,
    device_dir: &str,
) -> Result<usize, TransportError> {
    let mut pushed = 0;

    for entry in WalkDir::new(local_dir).follow_links(false) {
        let entry = entry.map_err(|e| {
            let path = e.path().map(Path::to_path_buf).unwrap_or_default();
            TransportError::io(path, e.into())
        })?;

        let relative = match entry.path().strip_prefix(local_dir) {
            Ok(rel) => rel.to_string_lossy().replace('\\', "/"),
            Err(_) => continue,
        };
        let target = build_device_path(&[device_dir, &relative]);

        if entry.file_type().is_dir() {
            client
                .make_directory(&target)
                .map_err(|code| afc_error("mkdir", &target, code))?;
        } else if entry.file_type().is_file() {
            let contents =
                std::fs::read(entry.path()).map_err(|e| TransportError::io(entry.path(), e))?;
            write_blocking(client, &target, &contents)?;
            pushed += 1;
        }
    }

    Ok(pushed)
}

#[async_trait]
impl DeviceTransport for AfcTransport {
    fn device_identifier(&self) -> &str {
        &self.identifier
    }

    fn hash_file_path(&self, app_identifier: &str) -> String {
        build_device_path(&[DEVICE_ROOT_PATH, app_identifier, "hashes"])
    }

    async fn push_file(&self, local_path: &Path, device_path: &str) -> Result<(), TransportError> {
        trace!("AFC 传输 {} -> {}", local_path.display(), device_path);
        let contents = tokio::fs::read(local_path)
            .await
            .map_err(|e| TransportError::io(local_path, e))?;
        let device_path = device_path.to_string();
        self.run_blocking(move |client| write_blocking(client, &device_path, &contents))
            .await
    }

    async fn push_directory(
        &self,
        local_dir: &Path,
        device_dir: &str,
    ) -> Result<(), TransportError> {
        let local_dir = local_dir.to_path_buf();
        let target = device_dir.to_string();
        let pushed = self
            .run_blocking(move |client| push_directory_blocking(client, &local_dir, &target))
            .await?;
        debug!("AFC 整目录推送完成: {} 个文件 -> {}", pushed, device_dir);
        Ok(())
    }

    /// 沙盒内文件本身可读写，无需额外处理
    async fn normalize_permissions(&self, _device_paths: &[String]) -> Result<(), TransportError> {
        Ok(())
    }

    async fn read_file(&self, device_path: &str) -> Result<Option<Vec<u8>>, TransportError> {
        let device_path = device_path.to_string();
        self.run_blocking(move |client| read_blocking(client, &device_path))
            .await
    }

    async fn write_file(&self, device_path: &str, contents: &[u8]) -> Result<(), TransportError> {
        let device_path = device_path.to_string();
        let contents = contents.to_vec();
        self.run_blocking(move |client| write_blocking(client, &device_path, &contents))
            .await
    }

    async fn remove_path(&self, device_path: &str) -> Result<(), TransportError> {
        let device_path = device_path.to_string();
        self.run_blocking(move |client| match client.remove(&device_path) {
            Ok(()) | Err(AFC_E_OBJECT_NOT_FOUND) => Ok(()),
            Err(code) => Err(afc_error("remove", &device_path, code)),
        })
        .await
    }
}
