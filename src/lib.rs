pub mod config;
pub mod core;
pub mod device;
pub mod discovery;
pub mod emulator;
pub mod error;
pub mod logging;
pub mod orchestrator;
pub mod transport;

pub use core::{DeviceAppData, DirectorySyncer, SyncOptions, SyncReport};
pub use device::{Device, DeviceRegistry, Platform};
pub use error::{DeviceError, SyncError, TransportError};
pub use orchestrator::{DeviceOrchestrator, ExecuteOptions, InitializeOptions};

// 各平台的用户配置目录
pub mod dirs {
    use std::path::PathBuf;

    pub fn config_dir() -> Option<PathBuf> {
        if cfg!(target_os = "windows") {
            std::env::var("APPDATA").ok().map(PathBuf::from)
        } else if cfg!(target_os = "macos") {
            std::env::var("HOME")
                .ok()
                .map(|h| PathBuf::from(h).join("Library").join("Application Support"))
        } else {
            std::env::var("XDG_CONFIG_HOME")
                .ok()
                .map(PathBuf::from)
                .or_else(|| {
                    std::env::var("HOME")
                        .ok()
                        .map(|h| PathBuf::from(h).join(".config"))
                })
        }
    }
}
