//! iOS 物理设备检测 worker
//!
//! 原生通知接口会阻塞在事件循环中，必须放在独立线程（或子进程）里运行，
//! 通过通道把 Found/Lost 消息发回异步侧。子进程模式下每条消息是一行 JSON：
//! `{"deviceFound":{"platform":"iOS","identifier":"...","status":"connected"}}`
//! 或 `{"deviceLost":"<identifier>"}`。

use crate::device::{ConnectionStatus, Device, Platform};
use crate::error::TransportError;
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

/// Apple Mobile Device 服务未启动
pub const APPLE_SERVICE_NOT_STARTED: u32 = 0xE800_0063;

/// 原生通知
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NativeNotification {
    Connected(WorkerDevice),
    Disconnected(String),
}

/// 原生设备通知接口
pub trait NativeDeviceNotifier: Send + 'static {
    /// 订阅连接/断开通知，失败返回原生错误码
    fn subscribe(&mut self) -> Result<(), u32>;

    /// 运行一次事件循环，最多阻塞 `timeout`，返回期间收到的通知
    fn run_once(&mut self, timeout: Duration) -> Vec<NativeNotification>;
}

/// worker 上报的设备信息
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerDevice {
    pub platform: Platform,
    pub identifier: String,
    pub status: ConnectionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub os_version: Option<String>,
}

impl WorkerDevice {
    pub fn connected(identifier: impl Into<String>) -> Self {
        Self {
            platform: Platform::Ios,
            identifier: identifier.into(),
            status: ConnectionStatus::Connected,
            display_name: None,
            model: None,
            os_version: None,
        }
    }

    pub fn into_device(self) -> Device {
        Device {
            display_name: self.display_name.unwrap_or_else(|| self.identifier.clone()),
            model: self.model.unwrap_or_default(),
            os_version: self.os_version.unwrap_or_default(),
            is_emulator: false,
            identifier: self.identifier,
            platform: self.platform,
            status: self.status,
        }
    }
}

/// worker 与主进程之间的消息
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum WorkerMessage {
    DeviceFound(WorkerDevice),
    DeviceLost(String),
}

impl From<NativeNotification> for WorkerMessage {
    fn from(notification: NativeNotification) -> Self {
        match notification {
            NativeNotification::Connected(device) => WorkerMessage::DeviceFound(device),
            NativeNotification::Disconnected(id) => WorkerMessage::DeviceLost(id),
        }
    }
}

/// 解析子进程输出的一行，无法识别的行返回 None
pub fn parse_worker_line(line: &str) -> Option<WorkerMessage> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    match serde_json::from_str(line) {
        Ok(message) => Some(message),
        Err(e) => {
            trace!("忽略 worker 输出 '{}': {}", line, e);
            None
        }
    }
}

/// 运行中的 worker
pub enum WorkerHandle {
    Thread {
        stop: Arc<AtomicBool>,
        join: Option<std::thread::JoinHandle<()>>,
    },
    Process {
        child: Child,
        reader: JoinHandle<()>,
    },
}

impl WorkerHandle {
    /// 停止 worker，线程模式下最多等待一个唤醒周期
    pub async fn stop(self) {
        match self {
            WorkerHandle::Thread { stop, join } => {
                stop.store(true, Ordering::SeqCst);
                if let Some(join) = join {
                    let _ = tokio::task::spawn_blocking(move || join.join()).await;
                }
            }
            WorkerHandle::Process { mut child, reader } => {
                if let Err(e) = child.kill().await {
                    debug!("结束 iOS 检测进程失败: {}", e);
                }
                reader.abort();
            }
        }
        debug!("iOS 检测 worker 已停止");
    }
}

/// 在独立线程中运行通知订阅
///
/// 订阅失败时返回原生错误码，不会留下线程。
pub async fn spawn_thread_worker(
    mut notifier: Box<dyn NativeDeviceNotifier>,
    wake_timeout: Duration,
) -> Result<(WorkerHandle, mpsc::UnboundedReceiver<WorkerMessage>), u32> {
    let (tx, rx) = mpsc::unbounded_channel();
    let (ready_tx, ready_rx) = oneshot::channel();
    let stop = Arc::new(AtomicBool::new(false));
    let stop_flag = stop.clone();

    let join = std::thread::Builder::new()
        .name("ios-device-detection".to_string())
        .spawn(move || {
            if let Err(code) = notifier.subscribe() {
                let _ = ready_tx.send(Err(code));
                return;
            }
            let _ = ready_tx.send(Ok(()));

            while !stop_flag.load(Ordering::SeqCst) {
                for notification in notifier.run_once(wake_timeout) {
                    if tx.send(WorkerMessage::from(notification)).is_err() {
                        return;
                    }
                }
            }
        })
        .map_err(|e| {
            warn!("无法启动 iOS 检测线程: {}", e);
            APPLE_SERVICE_NOT_STARTED
        })?;

    match ready_rx.await {
        Ok(Ok(())) => Ok((
            WorkerHandle::Thread {
                stop,
                join: Some(join),
            },
            rx,
        )),
        Ok(Err(code)) => Err(code),
        Err(_) => Err(APPLE_SERVICE_NOT_STARTED),
    }
}

/// 以子进程方式运行 worker，读取其 stdout 中的 JSON 行
pub fn spawn_process_worker(
    program: PathBuf,
    args: Vec<String>,
) -> Result<(WorkerHandle, mpsc::UnboundedReceiver<WorkerMessage>), TransportError> {
    let mut child = Command::new(&program)
        .args(&args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .kill_on_drop(true)
        .spawn()
        .map_err(|source| TransportError::Spawn {
            program: program.display().to_string(),
            source,
        })?;

    let stdout = child
        .stdout
        .take()
        .ok_or(TransportError::Unsupported("worker stdout"))?;

    let (tx, rx) = mpsc::unbounded_channel();
    let reader = tokio::spawn(async move {
        let mut lines = BufReader::new(stdout).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    if let Some(message) = parse_worker_line(&line) {
                        if tx.send(message).is_err() {
                            break;
                        }
                    }
                }
                Ok(None) => {
                    debug!("iOS 检测进程输出结束");
                    break;
                }
                Err(e) => {
                    warn!("读取 iOS 检测进程输出失败: {}", e);
                    break;
                }
            }
        }
    });

    Ok((WorkerHandle::Process { child, reader }, rx))
}

/// 子进程入口：订阅通知，把消息逐行写到 `out`，直到 `stop` 被置位
pub fn run_worker_loop<W: Write>(
    notifier: &mut dyn NativeDeviceNotifier,
    wake_timeout: Duration,
    stop: &AtomicBool,
    out: &mut W,
) -> anyhow::Result<()> {
    notifier
        .subscribe()
        .map_err(|code| anyhow::anyhow!("订阅 iOS 设备通知失败: 错误码 {:#x}", code))?;

    while !stop.load(Ordering::SeqCst) {
        for notification in notifier.run_once(wake_timeout) {
            let line = serde_json::to_string(&WorkerMessage::from(notification))?;
            writeln!(out, "{}", line)?;
            out.flush()?;
        }
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod fake {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// 按顺序返回预设通知的 notifier，批次用完后返回空
    pub struct ScriptedNotifier {
        pub subscribe_result: Result<(), u32>,
        pub batches: Arc<Mutex<VecDeque<Vec<NativeNotification>>>>,
        pub stop_when_drained: Option<Arc<AtomicBool>>,
    }

    impl ScriptedNotifier {
        pub fn new(batches: Vec<Vec<NativeNotification>>) -> Self {
            Self {
                subscribe_result: Ok(()),
                batches: Arc::new(Mutex::new(batches.into())),
                stop_when_drained: None,
            }
        }
    }

    impl NativeDeviceNotifier for ScriptedNotifier {
        fn subscribe(&mut self) -> Result<(), u32> {
            self.subscribe_result
        }

        fn run_once(&mut self, timeout: Duration) -> Vec<NativeNotification> {
            match self.batches.lock().unwrap().pop_front() {
                Some(batch) => batch,
                None => {
                    if let Some(stop) = &self.stop_when_drained {
                        stop.store(true, Ordering::SeqCst);
                    }
                    std::thread::sleep(timeout.min(Duration::from_millis(5)));
                    Vec::new()
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fake::ScriptedNotifier;
    use super::*;

    #[test]
    fn test_message_json_format() {
        let found = WorkerMessage::DeviceFound(WorkerDevice::connected("00008030-001A"));
        let json = serde_json::to_value(&found).unwrap();
        assert_eq!(json["deviceFound"]["platform"], "iOS");
        assert_eq!(json["deviceFound"]["identifier"], "00008030-001A");
        assert_eq!(json["deviceFound"]["status"], "connected");

        let lost = serde_json::to_string(&WorkerMessage::DeviceLost("abc".to_string())).unwrap();
        assert_eq!(lost, r#"{"deviceLost":"abc"}"#);
    }

    #[test]
    fn test_parse_worker_line() {
        let line = r#"{"deviceFound":{"platform":"iOS","identifier":"x","status":"connected","devicePointer":1}}"#;
        assert_eq!(
            parse_worker_line(line),
            Some(WorkerMessage::DeviceFound(WorkerDevice::connected("x")))
        );
        assert_eq!(parse_worker_line("Fork process started"), None);
        assert_eq!(parse_worker_line("   "), None);
    }

    #[tokio::test]
    async fn test_thread_worker_forwards_notifications() {
        let notifier = ScriptedNotifier::new(vec![
            vec![NativeNotification::Connected(WorkerDevice::connected("dev-1"))],
            vec![NativeNotification::Disconnected("dev-1".to_string())],
        ]);

        let (handle, mut rx) = spawn_thread_worker(Box::new(notifier), Duration::from_millis(10))
            .await
            .unwrap();

        assert_eq!(
            rx.recv().await,
            Some(WorkerMessage::DeviceFound(WorkerDevice::connected("dev-1")))
        );
        assert_eq!(
            rx.recv().await,
            Some(WorkerMessage::DeviceLost("dev-1".to_string()))
        );

        handle.stop().await;
    }

    #[tokio::test]
    async fn test_subscribe_failure_reports_code() {
        let mut notifier = ScriptedNotifier::new(vec![]);
        notifier.subscribe_result = Err(APPLE_SERVICE_NOT_STARTED);

        let result = spawn_thread_worker(Box::new(notifier), Duration::from_millis(10)).await;

        assert!(matches!(result, Err(APPLE_SERVICE_NOT_STARTED)));
    }

    #[test]
    fn test_worker_loop_writes_json_lines() {
        let stop = Arc::new(AtomicBool::new(false));
        let mut notifier = ScriptedNotifier::new(vec![vec![
            NativeNotification::Connected(WorkerDevice::connected("dev-1")),
            NativeNotification::Disconnected("dev-2".to_string()),
        ]]);
        notifier.stop_when_drained = Some(stop.clone());

        let mut out = Vec::new();
        run_worker_loop(&mut notifier, Duration::from_millis(1), &stop, &mut out).unwrap();

        let text = String::from_utf8(out).unwrap();
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with(r#"{"deviceFound""#));
        assert_eq!(lines[1], r#"{"deviceLost":"dev-2"}"#);
    }
}
