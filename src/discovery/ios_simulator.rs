use crate::device::{Device, DeviceSink};
use crate::error::TransportError;
use crate::transport::CommandRunner;
use regex::Regex;
use std::sync::{Arc, Mutex, OnceLock};
use tracing::{info, trace};

const BOOTED_STATE: &str = "Booted";

fn simulator_line_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    // 例: `    iPhone 6 (36BAC0E0-FBD2-4DE6-A4DE-0A5FF89BAAAD) (Booted)`
    RE.get_or_init(|| {
        Regex::new(r"^\s*?(\w[\w\s().,-]*?)\s*\(([0-9A-Fa-f-]+)\)\s*\((\w[\w\s]*?)\)\s*$").ok()
    })
    .as_ref()
}

/// `simctl list` 中的一台模拟器
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimulatorEntry {
    pub name: String,
    pub identifier: String,
    pub state: String,
}

impl SimulatorEntry {
    pub fn is_booted(&self) -> bool {
        self.state == BOOTED_STATE
    }
}

/// 解析 `simctl list` 输出中的全部模拟器，保持原有顺序
pub fn parse_simulators(output: &str) -> Vec<SimulatorEntry> {
    let Some(re) = simulator_line_regex() else {
        return Vec::new();
    };
    output
        .lines()
        .filter_map(|line| {
            let captures = re.captures(line)?;
            Some(SimulatorEntry {
                name: captures.get(1)?.as_str().trim().to_string(),
                identifier: captures.get(2)?.as_str().to_string(),
                state: captures.get(3)?.as_str().trim().to_string(),
            })
        })
        .collect()
}

/// 取第一个已启动的模拟器，返回 (名称, 标识符)
pub fn parse_booted_simulator(output: &str) -> Option<(String, String)> {
    parse_simulators(output)
        .into_iter()
        .find(SimulatorEntry::is_booted)
        .map(|entry| (entry.name, entry.identifier))
}

/// iOS 模拟器发现（仅 macOS）
///
/// 每次最多报告一个已启动的模拟器。
pub struct IosSimulatorDiscovery {
    runner: Arc<dyn CommandRunner>,
    program: String,
    args: Vec<String>,
    current: Mutex<Option<String>>,
}

impl IosSimulatorDiscovery {
    pub fn new(runner: Arc<dyn CommandRunner>, list_command: &[String]) -> Self {
        let (program, args) = match list_command.split_first() {
            Some((program, args)) => (program.clone(), args.to_vec()),
            None => (
                "xcrun".to_string(),
                vec!["simctl".to_string(), "list".to_string()],
            ),
        };
        Self {
            runner,
            program,
            args,
            current: Mutex::new(None),
        }
    }

    pub async fn start_looking_for_devices(
        &self,
        sink: &dyn DeviceSink,
    ) -> Result<(), TransportError> {
        let output = self.runner.run(&self.program, &self.args).await?;
        let booted = parse_booted_simulator(&output);

        let previous = {
            let mut current = self.current.lock().unwrap_or_else(|e| e.into_inner());
            let new_id = booted.as_ref().map(|(_, id)| id.clone());
            if *current == new_id {
                return Ok(());
            }
            std::mem::replace(&mut *current, new_id)
        };

        if let Some(old_id) = previous {
            info!("iOS 模拟器已关闭: {}", old_id);
            sink.remove_device(&old_id);
        }
        if let Some((name, id)) = booted {
            trace!("发现运行中的 iOS 模拟器: {} ({})", name, id);
            sink.add_device(Device::ios_simulator(id, name));
        }

        Ok(())
    }
}
