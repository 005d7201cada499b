//! 日志模块 - 文件日志与大小轮转

use crate::config::{load_section, save_section};
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::EnvFilter;

pub const LOG_FILE_NAME: &str = "livesync.log";

/// 日志配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// 单个日志文件上限（MB）
    #[serde(default = "default_max_size_mb")]
    pub max_size_mb: u32,
    /// "error" / "warn" / "info" / "debug" / "trace"
    #[serde(default = "default_level")]
    pub level: String,
}

fn default_enabled() -> bool {
    true
}

fn default_max_size_mb() -> u32 {
    5
}

fn default_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            max_size_mb: default_max_size_mb(),
            level: default_level(),
        }
    }
}

impl LogConfig {
    pub fn load(config_dir: &Path) -> Self {
        load_section(config_dir, "log")
    }

    pub fn save(&self, config_dir: &Path) -> anyhow::Result<()> {
        save_section(config_dir, "log", self)
    }

    pub fn tracing_level(&self) -> tracing::Level {
        match self.level.to_lowercase().as_str() {
            "error" => tracing::Level::ERROR,
            "warn" => tracing::Level::WARN,
            "debug" => tracing::Level::DEBUG,
            "trace" => tracing::Level::TRACE,
            _ => tracing::Level::INFO,
        }
    }

    /// `RUST_LOG` 优先，再叠加配置的级别，并压低依赖库的输出
    pub fn env_filter(&self) -> EnvFilter {
        let mut filter = EnvFilter::from_default_env().add_directive(self.tracing_level().into());
        for directive in ["tokio_util=warn", "mio=warn"] {
            if let Ok(directive) = directive.parse() {
                filter = filter.add_directive(directive);
            }
        }
        filter
    }
}

type SharedFile = Arc<Mutex<Option<BufWriter<File>>>>;

fn lock(file: &SharedFile) -> MutexGuard<'_, Option<BufWriter<File>>> {
    file.lock().unwrap_or_else(|e| e.into_inner())
}

/// 超过大小上限时把当前日志改名为 `.old` 并重新开始
#[derive(Clone)]
pub struct SizeRotatingWriter {
    file_path: PathBuf,
    max_size: u64,
    file: SharedFile,
}

impl SizeRotatingWriter {
    pub fn new(log_dir: &Path, max_size_mb: u32) -> io::Result<Self> {
        fs::create_dir_all(log_dir)?;
        let file_path = log_dir.join(LOG_FILE_NAME);
        let max_size = u64::from(max_size_mb.max(1)) * 1024 * 1024;

        if Self::exceeds(&file_path, max_size) {
            Self::rotate(&file_path)?;
        }
        let file = Self::open(&file_path)?;

        Ok(Self {
            file_path,
            max_size,
            file: Arc::new(Mutex::new(Some(file))),
        })
    }

    pub fn file_path(&self) -> &Path {
        &self.file_path
    }

    fn open(file_path: &Path) -> io::Result<BufWriter<File>> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(file_path)?;
        Ok(BufWriter::new(file))
    }

    fn exceeds(file_path: &Path, max_size: u64) -> bool {
        fs::metadata(file_path)
            .map(|m| m.len() > max_size)
            .unwrap_or(false)
    }

    fn rotate(file_path: &Path) -> io::Result<()> {
        let backup = file_path.with_extension("log.old");
        if backup.exists() {
            fs::remove_file(&backup)?;
        }
        fs::rename(file_path, backup)
    }

    /// 持有锁时调用
    fn rotate_locked(&self, guard: &mut Option<BufWriter<File>>) -> io::Result<()> {
        if let Some(mut current) = guard.take() {
            let _ = current.flush();
        }
        Self::rotate(&self.file_path)?;
        *guard = Some(Self::open(&self.file_path)?);
        Ok(())
    }
}

/// 单条日志的写入句柄
pub struct RotatingHandle {
    owner: SizeRotatingWriter,
}

impl Write for RotatingHandle {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut guard = lock(&self.owner.file);
        let written = match guard.as_mut() {
            Some(file) => {
                let n = file.write(buf)?;
                file.flush()?;
                n
            }
            None => return Err(io::Error::new(io::ErrorKind::Other, "日志文件不可用")),
        };

        if SizeRotatingWriter::exceeds(&self.owner.file_path, self.owner.max_size) {
            // 轮转失败不影响本次写入
            let _ = self.owner.rotate_locked(&mut guard);
        }
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        match lock(&self.owner.file).as_mut() {
            Some(file) => file.flush(),
            None => Ok(()),
        }
    }
}

impl<'a> MakeWriter<'a> for SizeRotatingWriter {
    type Writer = RotatingHandle;

    fn make_writer(&'a self) -> Self::Writer {
        RotatingHandle {
            owner: self.clone(),
        }
    }
}

/// 日志目录：`<配置目录>/logs`
pub fn get_log_dir(config_dir: &Path) -> PathBuf {
    config_dir.join("logs")
}
