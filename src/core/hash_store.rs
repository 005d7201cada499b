//! 设备端 hash 基线文件
//!
//! 文件格式为 UTF-8 文本，每行一条 `<path> <hash>`，按路径排序。

use crate::error::SyncError;
use crate::transport::DeviceTransport;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, trace};

/// 解析 hash 文件内容，忽略空行和首尾空白
///
/// 路径中可能含空格，以最后一个空白分隔 hash。
pub fn parse_hashes(text: &str) -> HashMap<String, String> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .filter_map(|line| {
            line.rsplit_once(char::is_whitespace)
                .map(|(path, hash)| (path.trim().to_string(), hash.trim().to_string()))
        })
        .collect()
}

/// 序列化为 hash 文件内容，输出顺序确定
pub fn serialize_hashes(hashes: &HashMap<String, String>) -> String {
    let sorted: BTreeMap<&String, &String> = hashes.iter().collect();
    sorted
        .into_iter()
        .map(|(path, hash)| format!("{} {}", path, hash))
        .collect::<Vec<_>>()
        .join("\n")
}

/// 单个应用在单台设备上的 hash 基线
pub struct HashStore {
    transport: Arc<dyn DeviceTransport>,
    device_path: String,
}

impl HashStore {
    pub fn new(transport: Arc<dyn DeviceTransport>, app_identifier: &str) -> Self {
        let device_path = transport.hash_file_path(app_identifier);
        Self {
            transport,
            device_path,
        }
    }

    pub fn device_path(&self) -> &str {
        &self.device_path
    }

    fn error(&self, source: crate::error::TransportError) -> SyncError {
        SyncError::HashStore {
            device: self.transport.device_identifier().to_string(),
            source,
        }
    }

    /// 读取基线，文件不存在时返回 None
    pub async fn read(&self) -> Result<Option<HashMap<String, String>>, SyncError> {
        let contents = self
            .transport
            .read_file(&self.device_path)
            .await
            .map_err(|e| self.error(e))?;

        Ok(contents.map(|bytes| {
            let hashes = parse_hashes(&String::from_utf8_lossy(&bytes));
            trace!("读取 hash 文件 {}: {} 条记录", self.device_path, hashes.len());
            hashes
        }))
    }

    /// 整体覆盖基线
    pub async fn write(&self, hashes: &HashMap<String, String>) -> Result<(), SyncError> {
        debug!("写入 hash 文件 {}: {} 条记录", self.device_path, hashes.len());
        self.transport
            .write_file(&self.device_path, serialize_hashes(hashes).as_bytes())
            .await
            .map_err(|e| self.error(e))
    }

    /// 删除基线文件
    pub async fn remove(&self) -> Result<(), SyncError> {
        self.transport
            .remove_path(&self.device_path)
            .await
            .map_err(|e| self.error(e))
    }

    /// 把新的 hash 合并进已有基线，基线不存在时返回 false
    pub async fn update(&self, updates: &HashMap<String, String>) -> Result<bool, SyncError> {
        let Some(mut hashes) = self.read().await? else {
            return Ok(false);
        };
        hashes.extend(updates.iter().map(|(p, h)| (p.clone(), h.clone())));
        self.write(&hashes).await?;
        Ok(true)
    }

    /// 从基线中删除指定路径，基线不存在时返回 false
    pub async fn remove_paths(&self, paths: &[String]) -> Result<bool, SyncError> {
        let Some(mut hashes) = self.read().await? else {
            return Ok(false);
        };
        for path in paths {
            hashes.remove(path);
        }
        self.write(&hashes).await?;
        Ok(true)
    }
}
