use std::collections::{HashMap, HashSet};

/// 单条 hash 记录的比较形式：`"<path> <hash>"`，去除首尾空白并转小写
fn normalized_record(path: &str, hash: &str) -> String {
    format!("{} {}", path.trim(), hash.trim()).to_lowercase()
}

/// 两次 hash 快照的比较结果
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HashDiff {
    /// 内容变化或新增的路径（已排序）
    pub changed: Vec<String>,
    /// 内容未变的路径数量
    pub unchanged: usize,
    /// 只存在于旧快照中的路径（已排序）
    pub stale: Vec<String>,
}

impl HashDiff {
    pub fn has_changes(&self) -> bool {
        !self.changed.is_empty()
    }
}

/// hash 快照比较器
#[derive(Debug, Default)]
pub struct FileComparator;

impl FileComparator {
    pub fn new() -> Self {
        Self
    }

    /// 比较当前 hash 与基线
    ///
    /// 记录按整行比较，空白和大小写差异不视为变化。
    pub fn compare(
        &self,
        current: &HashMap<String, String>,
        previous: &HashMap<String, String>,
    ) -> HashDiff {
        let baseline: HashSet<String> = previous
            .iter()
            .map(|(path, hash)| normalized_record(path, hash))
            .collect();

        let mut diff = HashDiff::default();
        for (path, hash) in current {
            if baseline.contains(&normalized_record(path, hash)) {
                diff.unchanged += 1;
            } else {
                diff.changed.push(path.clone());
            }
        }

        let current_paths: HashSet<String> =
            current.keys().map(|p| p.trim().to_lowercase()).collect();
        diff.stale = previous
            .keys()
            .filter(|p| !current_paths.contains(&p.trim().to_lowercase()))
            .cloned()
            .collect();

        diff.changed.sort();
        diff.stale.sort();
        diff
    }
}
