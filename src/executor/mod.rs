pub mod command;
pub mod gesture;
pub mod in_process;
pub mod platform;
pub mod result;
pub mod shell;
pub mod text_input;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::config::{BackendKind, DeviceConfig, ShellKind};
use crate::executor::in_process::InProcessExecutor;
use crate::executor::platform::{DevicePlatform, ExecPlatform};
use crate::executor::result::CommandResult;
use crate::executor::shell::{AdbShell, LocalShell, ShellChannel, ShellExecutor};

/// Uniform text-in/text-out command interface shared by both backends.
///
/// `execute` never fails: problems come back as `Error: ...` text with a
/// non-zero `[exit code: N]` marker.
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    /// Backend identifier, for logs only.
    fn name(&self) -> &str;

    async fn execute(&self, command: &str) -> CommandResult;
}

/// Backends assembled from the `[device]` config section.
pub struct DeviceBackends {
    pub executor: Arc<dyn CommandExecutor>,
    /// The raw shell backend, also reachable on its own for the
    /// shell-mediated screenshot path.
    pub shell: Arc<dyn CommandExecutor>,
    /// Present when the in-process backend is selected; the screenshot
    /// pipeline uses it for its direct capture path.
    pub platform: Option<Arc<dyn DevicePlatform>>,
}

pub fn build_backends(cfg: &DeviceConfig) -> DeviceBackends {
    let timeout = Duration::from_secs(cfg.command_timeout_secs);
    let channel: Arc<dyn ShellChannel> = match cfg.shell {
        ShellKind::Adb => Arc::new(AdbShell::new(cfg.adb_path.clone(), cfg.serial.clone(), timeout)),
        ShellKind::Local => Arc::new(LocalShell::new(cfg.local_shell.clone(), timeout)),
    };
    let shell: Arc<dyn CommandExecutor> = Arc::new(ShellExecutor::new(channel));

    match cfg.backend {
        BackendKind::Shell => {
            tracing::info!(shell = ?cfg.shell, "using shell backend");
            DeviceBackends {
                executor: shell.clone(),
                shell,
                platform: None,
            }
        }
        // Direct exec only reaches device binaries when running on the device.
        BackendKind::InProcess if cfg.shell == ShellKind::Adb => {
            tracing::warn!("in_process backend needs shell = \"local\"; using shell backend over adb");
            DeviceBackends {
                executor: shell.clone(),
                shell,
                platform: None,
            }
        }
        BackendKind::InProcess => {
            tracing::info!(shell = ?cfg.shell, "using in-process backend with shell fallback");
            let platform: Arc<dyn DevicePlatform> = Arc::new(ExecPlatform::new(timeout));
            DeviceBackends {
                executor: Arc::new(InProcessExecutor::new(platform.clone(), shell.clone())),
                shell,
                platform: Some(platform),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_process_over_adb_downgrades_to_shell() {
        let cfg = DeviceConfig {
            backend: BackendKind::InProcess,
            shell: ShellKind::Adb,
            ..DeviceConfig::default()
        };
        let backends = build_backends(&cfg);
        assert_eq!(backends.executor.name(), "shell");
        assert!(backends.platform.is_none());
    }

    #[test]
    fn in_process_on_device_keeps_platform() {
        let cfg = DeviceConfig {
            backend: BackendKind::InProcess,
            shell: ShellKind::Local,
            ..DeviceConfig::default()
        };
        let backends = build_backends(&cfg);
        assert_eq!(backends.executor.name(), "in_process");
        assert!(backends.platform.is_some());
    }

    #[tokio::test]
    async fn missing_device_binary_falls_through_to_shell() {
        use crate::executor::shell::testing::ScriptedShell;

        let shell = Arc::new(ScriptedShell::new());
        let fallback: Arc<dyn CommandExecutor> = Arc::new(ShellExecutor::new(shell.clone()));
        let empty = tempfile::tempdir().unwrap();
        let platform = Arc::new(ExecPlatform::with_bin_dir(empty.path(), Duration::from_secs(5)));
        let exec = InProcessExecutor::new(platform, fallback);

        let r = exec.execute("input tap 10 20").await;
        assert!(r.is_success());
        assert_eq!(shell.calls(), vec!["input tap 10 20"]);
    }
}
