use crate::core::comparator::FileComparator;
use crate::core::hash_store::HashStore;
use crate::core::hashing::{hash_mappings, is_regular_file};
use crate::core::scanner::LocalToDevicePathMapping;
use crate::error::SyncError;
use crate::transport::DeviceTransport;
use serde::Serialize;
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tracing::{debug, info, trace};

/// 默认并发 hash 计算数
pub const DEFAULT_MAX_CONCURRENT_HASHES: usize = 8;

/// 应用在设备上的位置
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceAppData {
    pub app_identifier: String,
    /// 项目文件在设备上的根目录，整目录推送的目标
    pub device_project_root: String,
}

impl DeviceAppData {
    pub fn new(app_identifier: impl Into<String>, device_project_root: impl Into<String>) -> Self {
        Self {
            app_identifier: app_identifier.into(),
            device_project_root: device_project_root.into(),
        }
    }
}

/// 同步选项
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncOptions {
    /// 忽略基线，删除 hash 文件后整目录推送
    pub force: bool,
    /// 增量同步后丢弃本地已不存在的基线记录
    pub prune_stale: bool,
}

/// 同步方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncMode {
    Full,
    Incremental,
}

/// 同步报告
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncReport {
    pub device: String,
    pub app_identifier: String,
    pub mode: SyncMode,
    pub start_time: i64,
    pub files_hashed: usize,
    pub files_transferred: usize,
    pub files_skipped: usize,
    pub paths_normalized: usize,
    /// 基线中保留的过期记录数
    pub stale_entries: usize,
    pub duration_ms: u64,
}

/// 单台设备上的目录同步器
///
/// 每个应用的 `HashStore` 按需创建并缓存在同步器内。
pub struct DirectorySyncer {
    transport: Arc<dyn DeviceTransport>,
    hash_stores: Mutex<HashMap<String, Arc<HashStore>>>,
    max_concurrent_hashes: usize,
}

impl DirectorySyncer {
    pub fn new(transport: Arc<dyn DeviceTransport>) -> Self {
        Self {
            transport,
            hash_stores: Mutex::new(HashMap::new()),
            max_concurrent_hashes: DEFAULT_MAX_CONCURRENT_HASHES,
        }
    }

    pub fn with_max_concurrent_hashes(mut self, max: usize) -> Self {
        self.max_concurrent_hashes = max.max(1);
        self
    }

    pub fn device_identifier(&self) -> &str {
        self.transport.device_identifier()
    }

    /// 获取应用的 hash 基线句柄
    pub fn hash_store(&self, app_identifier: &str) -> Arc<HashStore> {
        let mut stores = self.hash_stores.lock().unwrap_or_else(|e| e.into_inner());
        stores
            .entry(app_identifier.to_string())
            .or_insert_with(|| Arc::new(HashStore::new(self.transport.clone(), app_identifier)))
            .clone()
    }

    fn transfer_error(&self, path: &str, source: crate::error::TransportError) -> SyncError {
        SyncError::Transfer {
            device: self.device_identifier().to_string(),
            path: path.to_string(),
            source,
        }
    }

    async fn normalize(&self, device_paths: &[String]) -> Result<(), SyncError> {
        if device_paths.is_empty() {
            return Ok(());
        }
        self.transport
            .normalize_permissions(device_paths)
            .await
            .map_err(|source| SyncError::Permissions {
                device: self.device_identifier().to_string(),
                source,
            })
    }

    /// 同步整个项目目录
    ///
    /// 没有基线或强制同步时整目录推送，否则只推送 hash 变化的文件。
    /// 基线只在所有传输完成后才会改写。
    pub async fn transfer_directory(
        &self,
        app: &DeviceAppData,
        mappings: &[LocalToDevicePathMapping],
        source_dir: &Path,
        options: &SyncOptions,
    ) -> Result<SyncReport, SyncError> {
        let started = Instant::now();
        let start_time = chrono::Utc::now().timestamp();
        let device = self.device_identifier().to_string();

        info!(
            "开始同步 {} -> 设备 {} (force={})",
            app.app_identifier, device, options.force
        );

        let current_hashes = hash_mappings(mappings, self.max_concurrent_hashes).await?;
        let store = self.hash_store(&app.app_identifier);

        let previous_hashes = if options.force {
            None
        } else {
            store.read().await?
        };

        let mut report = SyncReport {
            device,
            app_identifier: app.app_identifier.clone(),
            mode: SyncMode::Full,
            start_time,
            files_hashed: current_hashes.len(),
            files_transferred: 0,
            files_skipped: 0,
            paths_normalized: 0,
            stale_entries: 0,
            duration_ms: 0,
        };

        match previous_hashes {
            None => {
                if options.force {
                    store.remove().await?;
                } else {
                    debug!("设备上没有 hash 文件，执行整目录推送");
                }

                self.transport
                    .push_directory(source_dir, &app.device_project_root)
                    .await
                    .map_err(|e| self.transfer_error(&app.device_project_root, e))?;

                let all_paths: Vec<String> =
                    mappings.iter().map(|m| m.device_path.clone()).collect();
                self.normalize(&all_paths).await?;

                store.write(&current_hashes).await?;

                report.files_transferred = current_hashes.len();
                report.paths_normalized = all_paths.len();
            }
            Some(previous_hashes) => {
                report.mode = SyncMode::Incremental;

                let diff = FileComparator::new().compare(&current_hashes, &previous_hashes);
                trace!("变化的文件: {:?}", diff.changed);

                let by_local: HashMap<String, &LocalToDevicePathMapping> =
                    mappings.iter().map(|m| (m.local_key(), m)).collect();

                let mut to_normalize = Vec::with_capacity(diff.changed.len());
                for local_key in &diff.changed {
                    let Some(mapping) = by_local.get(local_key) else {
                        continue;
                    };
                    self.transport
                        .push_file(&mapping.local_path, &mapping.device_path)
                        .await
                        .map_err(|e| self.transfer_error(&mapping.device_path, e))?;
                    to_normalize.push(mapping.device_path.clone());
                }

                // 有文件变化时目录也一起设置权限，新文件可能落在新目录中
                if !to_normalize.is_empty() {
                    to_normalize.extend(
                        mappings
                            .iter()
                            .filter(|m| !current_hashes.contains_key(&m.local_key()))
                            .map(|m| m.device_path.clone()),
                    );
                }
                self.normalize(&to_normalize).await?;

                let baseline = if options.prune_stale {
                    current_hashes.clone()
                } else {
                    let mut merged = previous_hashes;
                    merged.extend(current_hashes.iter().map(|(p, h)| (p.clone(), h.clone())));
                    report.stale_entries = diff.stale.len();
                    merged
                };
                store.write(&baseline).await?;

                report.files_transferred = diff.changed.len();
                report.files_skipped = diff.unchanged;
                report.paths_normalized = to_normalize.len();
            }
        }

        report.duration_ms = started.elapsed().as_millis() as u64;
        info!(
            "同步完成 ({:?}): 传输 {} 个, 跳过 {} 个, 耗时 {}ms",
            report.mode, report.files_transferred, report.files_skipped, report.duration_ms
        );
        Ok(report)
    }

    /// 推送给定文件并把它们的 hash 合并进已有基线
    pub async fn transfer_files(
        &self,
        app: &DeviceAppData,
        mappings: &[LocalToDevicePathMapping],
    ) -> Result<(), SyncError> {
        let mut files = Vec::new();
        let mut directories = Vec::new();
        for mapping in mappings {
            if is_regular_file(&mapping.local_path).await? {
                files.push(mapping.clone());
            } else {
                directories.push(mapping.device_path.clone());
            }
        }

        for mapping in &files {
            self.transport
                .push_file(&mapping.local_path, &mapping.device_path)
                .await
                .map_err(|e| self.transfer_error(&mapping.device_path, e))?;
        }

        self.normalize(&directories).await?;

        let hashes = hash_mappings(&files, self.max_concurrent_hashes).await?;
        let store = self.hash_store(&app.app_identifier);
        if !store.update(&hashes).await? {
            trace!("设备上没有 hash 文件，下次同步时会创建");
        }
        Ok(())
    }

    /// 从基线中删除给定映射的记录，基线不存在时返回 false
    pub async fn remove_hashes(
        &self,
        app: &DeviceAppData,
        mappings: &[LocalToDevicePathMapping],
    ) -> Result<bool, SyncError> {
        let paths: Vec<String> = mappings.iter().map(|m| m.local_key()).collect();
        self.hash_store(&app.app_identifier)
            .remove_paths(&paths)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::hash_store::{parse_hashes, serialize_hashes};
    use crate::core::hashing::calculate_hash;
    use crate::core::testing::{RecordingTransport, TransportOp};
    use std::path::PathBuf;

    const APP_ID: &str = "org.nativescript.app";
    const HASH_PATH: &str = "/data/local/tmp/org.nativescript.app/hashes";

    struct Fixture {
        _dir: tempfile::TempDir,
        root: PathBuf,
        transport: Arc<RecordingTransport>,
        syncer: DirectorySyncer,
        app: DeviceAppData,
    }

    impl Fixture {
        fn new(files: &[(&str, &str)]) -> Self {
            let dir = tempfile::tempdir().unwrap();
            let root = dir.path().to_path_buf();
            for (name, contents) in files {
                std::fs::write(root.join(name), contents).unwrap();
            }
            let transport = Arc::new(RecordingTransport::new("emulator-5554"));
            let syncer = DirectorySyncer::new(transport.clone());
            Self {
                _dir: dir,
                root,
                transport,
                syncer,
                app: DeviceAppData::new(APP_ID, "/data/local/tmp/sync/app"),
            }
        }

        fn local(&self, name: &str) -> String {
            self.root.join(name).to_string_lossy().into_owned()
        }

        fn mappings(&self, names: &[&str]) -> Vec<LocalToDevicePathMapping> {
            names
                .iter()
                .map(|n| {
                    LocalToDevicePathMapping::new(
                        self.root.join(n),
                        format!("/data/local/tmp/sync/app/{}", n),
                    )
                })
                .collect()
        }

        fn seed_baseline(&self, entries: &[(&str, &str)]) {
            let hashes: HashMap<String, String> = entries
                .iter()
                .map(|(n, h)| (self.local(n), h.to_string()))
                .collect();
            self.transport
                .put_file(HASH_PATH, serialize_hashes(&hashes).into_bytes());
        }

        fn baseline(&self) -> HashMap<String, String> {
            let bytes = self.transport.file(HASH_PATH).unwrap();
            parse_hashes(&String::from_utf8(bytes).unwrap())
        }

        async fn sync(&self, names: &[&str], options: SyncOptions) -> SyncReport {
            self.syncer
                .transfer_directory(&self.app, &self.mappings(names), &self.root, &options)
                .await
                .unwrap()
        }
    }

    #[tokio::test]
    async fn test_no_baseline_pushes_directory_once() {
        let fx = Fixture::new(&[("A.js", "a"), ("B.js", "b")]);

        let report = fx.sync(&["A.js", "B.js"], SyncOptions::default()).await;

        assert_eq!(report.mode, SyncMode::Full);
        let ops = fx.transport.ops();
        assert_eq!(
            ops.iter()
                .filter(|op| matches!(op, TransportOp::PushDirectory { .. }))
                .count(),
            1
        );
        assert!(!ops.iter().any(|op| matches!(op, TransportOp::PushFile { .. })));
        assert_eq!(fx.baseline().len(), 2);
    }

    #[tokio::test]
    async fn test_only_changed_file_is_transferred() {
        let fx = Fixture::new(&[("A.js", "a"), ("B.js", "b-new")]);
        let h1 = calculate_hash(b"a");
        fx.seed_baseline(&[("A.js", &h1), ("B.js", "h3")]);

        let report = fx.sync(&["A.js", "B.js"], SyncOptions::default()).await;

        assert_eq!(report.mode, SyncMode::Incremental);
        assert_eq!(report.files_transferred, 1);
        assert_eq!(report.files_skipped, 1);
        assert_eq!(
            fx.transport.pushed_files(),
            vec!["/data/local/tmp/sync/app/B.js".to_string()]
        );
        assert_eq!(
            fx.transport.normalized(),
            vec![vec!["/data/local/tmp/sync/app/B.js".to_string()]]
        );

        let baseline = fx.baseline();
        assert_eq!(baseline[&fx.local("A.js")], h1);
        assert_eq!(baseline[&fx.local("B.js")], calculate_hash(b"b-new"));
    }

    #[tokio::test]
    async fn test_stale_entry_kept_without_prune() {
        let fx = Fixture::new(&[("A.js", "a")]);
        let h1 = calculate_hash(b"a");
        fx.seed_baseline(&[("A.js", &h1), ("B.js", "h2")]);

        let report = fx.sync(&["A.js"], SyncOptions::default()).await;

        assert_eq!(report.files_transferred, 0);
        assert_eq!(report.stale_entries, 1);
        assert!(fx.transport.pushed_files().is_empty());
        assert!(fx.transport.normalized().is_empty());
        assert!(fx.baseline().contains_key(&fx.local("B.js")));
    }

    #[tokio::test]
    async fn test_stale_entry_dropped_with_prune() {
        let fx = Fixture::new(&[("A.js", "a")]);
        fx.seed_baseline(&[("A.js", &calculate_hash(b"a")), ("B.js", "h2")]);

        fx.sync(
            &["A.js"],
            SyncOptions {
                prune_stale: true,
                ..Default::default()
            },
        )
        .await;

        let baseline = fx.baseline();
        assert_eq!(baseline.len(), 1);
        assert!(!baseline.contains_key(&fx.local("B.js")));
    }

    #[tokio::test]
    async fn test_force_removes_baseline_then_pushes() {
        let fx = Fixture::new(&[("A.js", "a")]);
        fx.seed_baseline(&[("A.js", &calculate_hash(b"a"))]);

        let report = fx
            .sync(
                &["A.js"],
                SyncOptions {
                    force: true,
                    ..Default::default()
                },
            )
            .await;

        assert_eq!(report.mode, SyncMode::Full);
        let ops = fx.transport.ops();
        let remove_at = ops
            .iter()
            .position(|op| *op == TransportOp::Remove(HASH_PATH.to_string()))
            .unwrap();
        let push_at = ops
            .iter()
            .position(|op| matches!(op, TransportOp::PushDirectory { .. }))
            .unwrap();
        assert!(remove_at < push_at);
        assert!(fx.transport.file(HASH_PATH).is_some());
    }

    #[tokio::test]
    async fn test_failed_transfer_keeps_old_baseline() {
        let fx = Fixture::new(&[("A.js", "a2"), ("B.js", "b2")]);
        fx.seed_baseline(&[("A.js", "old-a"), ("B.js", "old-b")]);
        fx.transport.fail_push("/data/local/tmp/sync/app/B.js");

        let result = fx
            .syncer
            .transfer_directory(
                &fx.app,
                &fx.mappings(&["A.js", "B.js"]),
                &fx.root,
                &SyncOptions::default(),
            )
            .await;

        match result {
            Err(SyncError::Transfer { device, path, .. }) => {
                assert_eq!(device, "emulator-5554");
                assert!(path.ends_with("B.js"));
            }
            other => panic!("unexpected result: {:?}", other.map(|r| r.mode)),
        }
        assert_eq!(fx.baseline()[&fx.local("A.js")], "old-a");
    }

    #[tokio::test]
    async fn test_directory_mappings_normalized_only_with_changes() {
        let fx = Fixture::new(&[("A.js", "a")]);
        std::fs::create_dir(fx.root.join("views")).unwrap();
        std::fs::write(fx.root.join("views/main.xml"), "<Page/>").unwrap();
        fx.seed_baseline(&[("A.js", &calculate_hash(b"a"))]);

        let report = fx
            .sync(&["A.js", "views", "views/main.xml"], SyncOptions::default())
            .await;

        assert_eq!(report.files_transferred, 1);
        let normalized = fx.transport.normalized();
        assert_eq!(normalized.len(), 1);
        assert!(normalized[0].contains(&"/data/local/tmp/sync/app/views".to_string()));
        assert!(normalized[0].contains(&"/data/local/tmp/sync/app/views/main.xml".to_string()));
    }

    #[tokio::test]
    async fn test_transfer_files_updates_existing_baseline() {
        let fx = Fixture::new(&[("A.js", "a"), ("C.js", "c")]);
        fx.seed_baseline(&[("A.js", "h1")]);

        fx.syncer
            .transfer_files(&fx.app, &fx.mappings(&["C.js"]))
            .await
            .unwrap();

        assert_eq!(
            fx.transport.pushed_files(),
            vec!["/data/local/tmp/sync/app/C.js".to_string()]
        );
        let baseline = fx.baseline();
        assert_eq!(baseline[&fx.local("A.js")], "h1");
        assert_eq!(baseline[&fx.local("C.js")], calculate_hash(b"c"));
    }

    #[tokio::test]
    async fn test_transfer_files_without_baseline_does_not_create_one() {
        let fx = Fixture::new(&[("A.js", "a")]);

        fx.syncer
            .transfer_files(&fx.app, &fx.mappings(&["A.js"]))
            .await
            .unwrap();

        assert!(fx.transport.file(HASH_PATH).is_none());
    }

    #[tokio::test]
    async fn test_remove_hashes() {
        let fx = Fixture::new(&[]);
        fx.seed_baseline(&[("A.js", "h1"), ("B.js", "h2")]);

        let existed = fx
            .syncer
            .remove_hashes(&fx.app, &fx.mappings(&["B.js"]))
            .await
            .unwrap();

        assert!(existed);
        assert_eq!(fx.baseline().len(), 1);
    }

    #[test]
    fn test_hash_stores_are_cached_per_app() {
        let transport = Arc::new(RecordingTransport::new("emulator-5554"));
        let syncer = DirectorySyncer::new(transport);

        let a1 = syncer.hash_store("org.a");
        let a2 = syncer.hash_store("org.a");
        let b = syncer.hash_store("org.b");

        assert!(Arc::ptr_eq(&a1, &a2));
        assert!(!Arc::ptr_eq(&a1, &b));
    }
}
