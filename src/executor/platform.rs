//! Direct device primitives used by the in-process backend.
//!
//! A [`DevicePlatform`] performs one operation per call without going
//! through a shell interpreter. Operations an implementation cannot perform
//! return [`PlatformError::Unsupported`], and the in-process backend then
//! hands the original command text to the shell backend instead.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;

use crate::executor::command::{BroadcastIntent, LaunchTarget, ResolveQuery};

#[derive(Debug, Error)]
pub enum PlatformError {
    #[error("operation not supported by this platform")]
    Unsupported,

    #[error("{0}")]
    Io(#[from] std::io::Error),

    #[error("{message}")]
    Failed { message: String, exit_code: i32 },
}

impl PlatformError {
    pub fn failed(message: impl Into<String>) -> Self {
        PlatformError::Failed {
            message: message.into(),
            exit_code: 1,
        }
    }
}

pub type PlatformResult<T> = Result<T, PlatformError>;

#[async_trait]
pub trait DevicePlatform: Send + Sync {
    async fn tap(&self, x: i32, y: i32) -> PlatformResult<()>;

    async fn swipe(&self, from: (i32, i32), to: (i32, i32), duration_ms: Option<u64>) -> PlatformResult<()>;

    async fn key_event(&self, code: &str) -> PlatformResult<()>;

    /// PNG-encoded frame of the given display.
    async fn capture_png(&self, display: Option<u32>) -> PlatformResult<Vec<u8>>;

    /// Returns the activity manager's status text.
    async fn start_activity(&self, target: &LaunchTarget) -> PlatformResult<String>;

    async fn dump_windows(&self) -> PlatformResult<String>;

    async fn list_input_methods(&self, enabled_only: bool) -> PlatformResult<Vec<String>>;

    async fn enable_input_method(&self, id: &str) -> PlatformResult<()>;

    async fn set_input_method(&self, id: &str) -> PlatformResult<()>;

    /// `None` when the setting is unset.
    async fn get_setting(&self, namespace: &str, key: &str) -> PlatformResult<Option<String>>;

    async fn send_broadcast(&self, intent: &BroadcastIntent) -> PlatformResult<String>;

    /// Resolved component text, or `None` when nothing matches.
    async fn resolve_activity(&self, query: &ResolveQuery) -> PlatformResult<Option<String>>;
}

/// Runs device binaries directly with an argv vector.
///
/// Used when the agent itself lives on the device (root daemon, chroot
/// bridge). Arguments are never re-parsed by a shell, so values with spaces
/// or quotes pass through untouched, and `screencap` output is read as raw
/// bytes instead of being base64-wrapped.
pub struct ExecPlatform {
    /// Directory holding the device binaries; `None` searches `PATH`.
    bin_dir: Option<PathBuf>,
    timeout: Duration,
}

impl ExecPlatform {
    pub fn new(timeout: Duration) -> Self {
        Self { bin_dir: None, timeout }
    }

    pub fn with_bin_dir(bin_dir: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            bin_dir: Some(bin_dir.into()),
            timeout,
        }
    }

    async fn run(&self, program: &str, args: &[&str]) -> PlatformResult<Vec<u8>> {
        tracing::debug!(program, ?args, "exec platform call");
        let path = match &self.bin_dir {
            Some(dir) => dir.join(program),
            None => PathBuf::from(program),
        };
        let child = Command::new(&path)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| match e.kind() {
                // Not on the device; let the shell backend run it.
                std::io::ErrorKind::NotFound => PlatformError::Unsupported,
                _ => PlatformError::Io(e),
            })?;

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| PlatformError::failed(format!("{program} timed out after {:?}", self.timeout)))??;

        if output.status.success() {
            Ok(output.stdout)
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            Err(PlatformError::Failed {
                message: if stderr.is_empty() {
                    format!("{program} exited with {}", output.status)
                } else {
                    stderr
                },
                exit_code: output.status.code().unwrap_or(1),
            })
        }
    }

    async fn run_text(&self, program: &str, args: &[&str]) -> PlatformResult<String> {
        let out = self.run(program, args).await?;
        Ok(String::from_utf8_lossy(&out).into_owned())
    }
}

#[async_trait]
impl DevicePlatform for ExecPlatform {
    async fn tap(&self, x: i32, y: i32) -> PlatformResult<()> {
        let (x, y) = (x.to_string(), y.to_string());
        self.run("input", &["tap", x.as_str(), y.as_str()]).await?;
        Ok(())
    }

    async fn swipe(&self, from: (i32, i32), to: (i32, i32), duration_ms: Option<u64>) -> PlatformResult<()> {
        let mut args = vec![
            "swipe".to_string(),
            from.0.to_string(),
            from.1.to_string(),
            to.0.to_string(),
            to.1.to_string(),
        ];
        if let Some(d) = duration_ms {
            args.push(d.to_string());
        }
        let argv: Vec<&str> = args.iter().map(String::as_str).collect();
        self.run("input", &argv).await?;
        Ok(())
    }

    async fn key_event(&self, code: &str) -> PlatformResult<()> {
        self.run("input", &["keyevent", code]).await?;
        Ok(())
    }

    async fn capture_png(&self, display: Option<u32>) -> PlatformResult<Vec<u8>> {
        let display = display.map(|d| d.to_string());
        let mut args = vec!["-p"];
        if let Some(d) = display.as_deref() {
            args.extend(["-d", d]);
        }
        let png = self.run("screencap", &args).await?;
        if png.is_empty() {
            return Err(PlatformError::failed("screencap produced no data"));
        }
        Ok(png)
    }

    async fn start_activity(&self, target: &LaunchTarget) -> PlatformResult<String> {
        match target {
            LaunchTarget::Component(c) => self.run_text("am", &["start", "-n", c.as_str()]).await,
            // `monkey` is the only argv-level way to launch by package without a component.
            LaunchTarget::Package(p) => {
                self.run_text(
                    "monkey",
                    &["-p", p.as_str(), "-c", "android.intent.category.LAUNCHER", "1"],
                )
                .await
            }
        }
    }

    async fn dump_windows(&self) -> PlatformResult<String> {
        self.run_text("dumpsys", &["window"]).await
    }

    async fn list_input_methods(&self, enabled_only: bool) -> PlatformResult<Vec<String>> {
        let args: &[&str] = if enabled_only {
            &["list", "-s"]
        } else {
            &["list", "-a", "-s"]
        };
        let text = self.run_text("ime", args).await?;
        Ok(text
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(String::from)
            .collect())
    }

    async fn enable_input_method(&self, id: &str) -> PlatformResult<()> {
        self.run("ime", &["enable", id]).await?;
        Ok(())
    }

    async fn set_input_method(&self, id: &str) -> PlatformResult<()> {
        self.run("ime", &["set", id]).await?;
        Ok(())
    }

    async fn get_setting(&self, namespace: &str, key: &str) -> PlatformResult<Option<String>> {
        let value = self.run_text("settings", &["get", namespace, key]).await?;
        let value = value.trim();
        Ok((!value.is_empty() && value != "null").then(|| value.to_string()))
    }

    async fn send_broadcast(&self, intent: &BroadcastIntent) -> PlatformResult<String> {
        let mut args: Vec<&str> = vec!["broadcast", "-a", intent.action.as_str()];
        if let Some(p) = &intent.package {
            args.extend(["-p", p.as_str()]);
        }
        for (k, v) in &intent.extras {
            args.extend(["--es", k.as_str(), v.as_str()]);
        }
        if intent.include_background {
            args.push("--receiver-include-background");
        }
        self.run_text("am", &args).await
    }

    async fn resolve_activity(&self, query: &ResolveQuery) -> PlatformResult<Option<String>> {
        let mut args: Vec<&str> = vec!["resolve-activity"];
        if query.brief {
            args.push("--brief");
        }
        if let Some(a) = &query.action {
            args.extend(["-a", a.as_str()]);
        }
        if let Some(c) = &query.category {
            args.extend(["-c", c.as_str()]);
        }
        args.push(query.package.as_str());
        let text = self.run_text("pm", &args).await?;
        if text.contains("No activity found") || text.trim().is_empty() {
            Ok(None)
        } else {
            Ok(Some(text.trim().to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_binary_is_unsupported() {
        let platform = ExecPlatform::new(Duration::from_secs(5));
        let err = platform
            .run("phone-pilot-no-such-binary", &["tap", "1", "2"])
            .await
            .unwrap_err();
        assert!(matches!(err, PlatformError::Unsupported));
    }

    #[tokio::test]
    async fn nonzero_exit_is_failed_with_code() {
        let platform = ExecPlatform::new(Duration::from_secs(5));
        let err = platform.run("sh", &["-c", "echo nope 1>&2; exit 4"]).await.unwrap_err();
        match err {
            PlatformError::Failed { message, exit_code } => {
                assert_eq!(message, "nope");
                assert_eq!(exit_code, 4);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
