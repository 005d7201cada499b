//! 没有可用设备时启动模拟器

use crate::device::Platform;
use crate::discovery::ios_simulator::parse_simulators;
use crate::error::TransportError;
use crate::transport::adb::AdbTool;
use crate::transport::CommandRunner;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::info;

/// 平台模拟器服务
#[async_trait]
pub trait EmulatorServices: Send + Sync {
    fn platform(&self) -> Platform;

    /// 启动模拟器并等待其可被发现
    async fn start_emulator(&self) -> Result<(), TransportError>;
}

/// Android 模拟器（AVD）
pub struct AndroidEmulatorServices {
    runner: Arc<dyn CommandRunner>,
    emulator_path: String,
    avd_name: Option<String>,
    adb: AdbTool,
}

impl AndroidEmulatorServices {
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        emulator_path: impl Into<String>,
        avd_name: Option<String>,
        adb: AdbTool,
    ) -> Self {
        Self {
            runner,
            emulator_path: emulator_path.into(),
            avd_name,
            adb,
        }
    }

    /// 未配置 AVD 时使用 `emulator -list-avds` 的第一个
    async fn resolve_avd(&self) -> Result<String, TransportError> {
        if let Some(name) = &self.avd_name {
            return Ok(name.clone());
        }
        let output = self
            .runner
            .run(&self.emulator_path, &["-list-avds".to_string()])
            .await?;
        output
            .lines()
            .map(str::trim)
            .find(|line| !line.is_empty())
            .map(str::to_string)
            .ok_or(TransportError::Unsupported("没有可用的 Android 模拟器 (AVD)"))
    }
}

#[async_trait]
impl EmulatorServices for AndroidEmulatorServices {
    fn platform(&self) -> Platform {
        Platform::Android
    }

    async fn start_emulator(&self) -> Result<(), TransportError> {
        let avd = self.resolve_avd().await?;
        info!("正在启动 Android 模拟器: {}", avd);

        self.runner
            .spawn_detached(&self.emulator_path, &["-avd".to_string(), avd])
            .await?;
        self.adb.wait_for_device().await
    }
}

/// iOS 模拟器（仅 macOS）
pub struct IosSimulatorServices {
    runner: Arc<dyn CommandRunner>,
    device_name: Option<String>,
}

impl IosSimulatorServices {
    pub fn new(runner: Arc<dyn CommandRunner>, device_name: Option<String>) -> Self {
        Self {
            runner,
            device_name,
        }
    }

    fn xcrun_args(args: &[&str]) -> Vec<String> {
        args.iter().map(|a| a.to_string()).collect()
    }
}

#[async_trait]
impl EmulatorServices for IosSimulatorServices {
    fn platform(&self) -> Platform {
        Platform::Ios
    }

    async fn start_emulator(&self) -> Result<(), TransportError> {
        if !cfg!(target_os = "macos") {
            return Err(TransportError::Unsupported("iOS 模拟器只能在 macOS 上使用"));
        }

        let output = self
            .runner
            .run("xcrun", &Self::xcrun_args(&["simctl", "list", "devices"]))
            .await?;
        let simulators = parse_simulators(&output);

        if simulators.iter().any(|s| s.is_booted()) {
            return Ok(());
        }

        let target = match &self.device_name {
            Some(name) => simulators.iter().find(|s| &s.name == name),
            None => simulators.first(),
        }
        .ok_or(TransportError::Unsupported("找不到可启动的 iOS 模拟器"))?;

        info!("正在启动 iOS 模拟器: {} ({})", target.name, target.identifier);
        self.runner
            .run(
                "xcrun",
                &Self::xcrun_args(&["simctl", "boot", &target.identifier]),
            )
            .await?;
        self.runner
            .spawn_detached("open", &Self::xcrun_args(&["-a", "Simulator"]))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::testing::ScriptedRunner;

    #[tokio::test]
    async fn test_android_uses_first_avd() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.respond_ok("Pixel_6_API_34\nNexus_5\n");
        let services = AndroidEmulatorServices::new(
            runner.clone(),
            "emulator",
            None,
            AdbTool::new(runner.clone(), "adb"),
        );

        services.start_emulator().await.unwrap();

        let calls = runner.calls();
        assert_eq!(calls[1], vec!["emulator", "-avd", "Pixel_6_API_34"]);
        assert_eq!(calls[2], vec!["adb", "wait-for-device"]);
    }

    #[tokio::test]
    async fn test_android_without_avds_fails() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.respond_ok("\n");
        let services = AndroidEmulatorServices::new(
            runner.clone(),
            "emulator",
            None,
            AdbTool::new(runner, "adb"),
        );

        assert!(services.start_emulator().await.is_err());
    }
}
