use crate::core::scanner::LocalToDevicePathMapping;
use crate::error::SyncError;
use std::collections::HashMap;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Semaphore;

/// 流式读取的缓冲区大小
const READ_BUFFER_SIZE: usize = 64 * 1024;

/// 计算内存数据的 hash（十六进制）
pub fn calculate_hash(data: &[u8]) -> String {
    blake3::hash(data).to_hex().to_string()
}

fn hash_file_blocking(path: &Path) -> std::io::Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = blake3::Hasher::new();
    let mut buffer = vec![0u8; READ_BUFFER_SIZE];
    loop {
        let n = file.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }
    Ok(hasher.finalize().to_hex().to_string())
}

/// 在阻塞线程上计算文件内容 hash
pub async fn hash_file(path: &Path) -> Result<String, SyncError> {
    let owned = path.to_path_buf();
    tokio::task::spawn_blocking(move || hash_file_blocking(&owned))
        .await
        .map_err(|e| SyncError::Hash {
            path: path.to_path_buf(),
            source: std::io::Error::new(std::io::ErrorKind::Other, e),
        })?
        .map_err(|source| SyncError::Hash {
            path: path.to_path_buf(),
            source,
        })
}

/// 判断本地路径是否为普通文件，目录返回 false
pub async fn is_regular_file(path: &Path) -> Result<bool, SyncError> {
    tokio::fs::metadata(path)
        .await
        .map(|m| m.is_file())
        .map_err(|source| SyncError::Hash {
            path: path.to_path_buf(),
            source,
        })
}

/// 并发计算所有普通文件映射的 hash，键为本地路径
///
/// 目录映射不参与计算。
pub async fn hash_mappings(
    mappings: &[LocalToDevicePathMapping],
    max_concurrent: usize,
) -> Result<HashMap<String, String>, SyncError> {
    let semaphore = Arc::new(Semaphore::new(max_concurrent.max(1)));
    let mut handles = Vec::new();

    for mapping in mappings {
        if !is_regular_file(&mapping.local_path).await? {
            continue;
        }

        let local_path: PathBuf = mapping.local_path.clone();
        let semaphore = semaphore.clone();
        handles.push(tokio::spawn(async move {
            let _permit = semaphore.acquire_owned().await;
            let hash = hash_file(&local_path).await?;
            Ok::<_, SyncError>((local_path, hash))
        }));
    }

    let mut hashes = HashMap::with_capacity(handles.len());
    for handle in handles {
        let (path, hash) = handle.await.map_err(|e| SyncError::Hash {
            path: PathBuf::new(),
            source: std::io::Error::new(std::io::ErrorKind::Other, e),
        })??;
        hashes.insert(path.to_string_lossy().into_owned(), hash);
    }

    Ok(hashes)
}
