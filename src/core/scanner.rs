use crate::transport::build_device_path;
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use walkdir::WalkDir;

/// 本地路径到设备路径的映射，每个待评估的文件或目录一条
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalToDevicePathMapping {
    /// 主机上的绝对路径
    pub local_path: PathBuf,
    /// 设备上的绝对路径
    pub device_path: String,
}

impl LocalToDevicePathMapping {
    pub fn new(local_path: impl Into<PathBuf>, device_path: impl Into<String>) -> Self {
        Self {
            local_path: local_path.into(),
            device_path: device_path.into(),
        }
    }

    /// hash 文件中使用的键
    pub fn local_key(&self) -> String {
        self.local_path.to_string_lossy().into_owned()
    }
}

/// 文件扫描器配置
#[derive(Debug, Clone)]
pub struct ScanConfig {
    /// 是否包含目录映射
    pub include_dirs: bool,
    /// 排除规则（glob patterns）
    pub exclude_patterns: Vec<String>,
    /// 最大文件大小（0 表示不限制）
    pub max_file_size: u64,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            include_dirs: true,
            exclude_patterns: default_exclude_patterns(),
            max_file_size: 0,
        }
    }
}

pub fn default_exclude_patterns() -> Vec<String> {
    vec![
        ".git/**".to_string(),
        ".svn/**".to_string(),
        ".DS_Store".to_string(),
        "Thumbs.db".to_string(),
        "*.tmp".to_string(),
        "*.temp".to_string(),
        "~*".to_string(),
    ]
}

/// 扫描本地项目目录，生成路径映射
pub struct FileScanner {
    config: ScanConfig,
}

impl FileScanner {
    pub fn new() -> Self {
        Self {
            config: ScanConfig::default(),
        }
    }

    pub fn with_config(config: ScanConfig) -> Self {
        Self { config }
    }

    /// 检查相对路径是否应该被排除
    fn should_exclude(&self, relative: &str) -> bool {
        self.config
            .exclude_patterns
            .iter()
            .any(|pattern| matches_pattern(relative, pattern))
    }

    /// 遍历 `source_dir`，映射到设备上的 `device_root`
    ///
    /// 返回结果按本地路径排序，不包含根目录本身。
    pub fn scan(&self, source_dir: &Path, device_root: &str) -> Result<Vec<LocalToDevicePathMapping>> {
        info!("开始扫描目录: {}", source_dir.display());

        let mut mappings = Vec::new();
        let mut excluded_count = 0;

        let walker = WalkDir::new(source_dir)
            .min_depth(1)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|entry| {
                let relative = relative_path(source_dir, entry.path());
                if self.should_exclude(&relative) {
                    debug!("排除: {}", relative);
                    excluded_count += 1;
                    return false;
                }
                true
            });

        for entry in walker {
            let entry = entry.with_context(|| format!("遍历目录失败: {}", source_dir.display()))?;
            let file_type = entry.file_type();

            if file_type.is_dir() && !self.config.include_dirs {
                continue;
            }

            if file_type.is_file() && self.config.max_file_size > 0 {
                let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
                if size > self.config.max_file_size {
                    debug!("跳过大文件: {} ({})", entry.path().display(), size);
                    continue;
                }
            }

            let relative = relative_path(source_dir, entry.path());
            mappings.push(LocalToDevicePathMapping::new(
                entry.path(),
                build_device_path(&[device_root, &relative]),
            ));
        }

        info!(
            "扫描完成: {} 个条目, {} 个被排除",
            mappings.len(),
            excluded_count
        );

        Ok(mappings)
    }
}

impl Default for FileScanner {
    fn default() -> Self {
        Self::new()
    }
}

fn relative_path(root: &Path, path: &Path) -> String {
    path.strip_prefix(root)
        .unwrap_or(path)
        .to_string_lossy()
        .replace('\\', "/")
}

/// 简单的 glob 模式匹配
fn matches_pattern(path: &str, pattern: &str) -> bool {
    let path = path.to_lowercase();
    let pattern = pattern.to_lowercase();

    // 处理 ** 通配符
    if pattern.contains("**") {
        let parts: Vec<&str> = pattern.split("**").collect();
        if parts.len() == 2 {
            let prefix = parts[0].trim_end_matches('/');
            let suffix = parts[1].trim_start_matches('/');

            if prefix.is_empty() && suffix.is_empty() {
                return true;
            }
            // 目录本身也算命中，遍历时整棵子树被跳过
            if !prefix.is_empty() && path != prefix && !path.starts_with(&format!("{}/", prefix)) {
                return false;
            }
            if !suffix.is_empty() && !path.ends_with(suffix) {
                return false;
            }
            return true;
        }
    }

    let file_name = path.rsplit('/').next().unwrap_or(&path);

    // 处理 * 通配符，只匹配文件名
    if pattern.contains('*') {
        let regex_pattern = regex::escape(&pattern).replace("\\*", ".*");
        if let Ok(re) = regex::Regex::new(&format!("^{}$", regex_pattern)) {
            return re.is_match(file_name);
        }
    }

    // 精确匹配
    path == pattern || file_name == pattern
}
