use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tokio::sync::Mutex;

use crate::executor::result::CommandResult;
use crate::executor::CommandExecutor;

/// Captured output of one shell round-trip.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShellOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

/// Privileged command channel. Implementations run the command text through
/// a shell interpreter on the device and report what came back.
#[async_trait]
pub trait ShellChannel: Send + Sync {
    fn describe(&self) -> String;

    async fn run(&self, command: &str) -> std::io::Result<ShellOutput>;
}

async fn run_process(mut cmd: Command, timeout: Duration) -> std::io::Result<ShellOutput> {
    let child = cmd
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()?;

    let output = tokio::time::timeout(timeout, child.wait_with_output())
        .await
        .map_err(|_| {
            std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                format!("command timed out after {}s", timeout.as_secs()),
            )
        })??;

    Ok(ShellOutput {
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        // Killed by a signal: report a generic failure.
        exit_code: output.status.code().unwrap_or(1),
    })
}

/// `adb [-s SERIAL] shell COMMAND` from a host machine.
pub struct AdbShell {
    adb_path: String,
    serial: Option<String>,
    timeout: Duration,
}

impl AdbShell {
    pub fn new(adb_path: impl Into<String>, serial: Option<String>, timeout: Duration) -> Self {
        Self {
            adb_path: adb_path.into(),
            serial,
            timeout,
        }
    }
}

#[async_trait]
impl ShellChannel for AdbShell {
    fn describe(&self) -> String {
        match &self.serial {
            Some(s) => format!("adb -s {s}"),
            None => "adb".into(),
        }
    }

    async fn run(&self, command: &str) -> std::io::Result<ShellOutput> {
        let mut cmd = Command::new(&self.adb_path);
        if let Some(serial) = &self.serial {
            cmd.arg("-s").arg(serial);
        }
        // adb forwards a single argument verbatim to the remote `sh -c`.
        cmd.arg("shell").arg(command);
        run_process(cmd, self.timeout).await
    }
}

/// `sh -c COMMAND` or `su -c COMMAND` on the device itself.
pub struct LocalShell {
    program: String,
    timeout: Duration,
}

impl LocalShell {
    pub fn new(program: impl Into<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            timeout,
        }
    }
}

#[async_trait]
impl ShellChannel for LocalShell {
    fn describe(&self) -> String {
        format!("{} -c", self.program)
    }

    async fn run(&self, command: &str) -> std::io::Result<ShellOutput> {
        let mut cmd = Command::new(&self.program);
        cmd.arg("-c").arg(command);
        run_process(cmd, self.timeout).await
    }
}

/// Backend that forwards every command verbatim to a [`ShellChannel`].
///
/// The channel is a single shared resource: commands are serialized, never
/// more than one in flight.
pub struct ShellExecutor {
    channel: Arc<dyn ShellChannel>,
    in_flight: Mutex<()>,
}

impl ShellExecutor {
    pub fn new(channel: Arc<dyn ShellChannel>) -> Self {
        Self {
            channel,
            in_flight: Mutex::new(()),
        }
    }
}

#[async_trait]
impl CommandExecutor for ShellExecutor {
    fn name(&self) -> &str {
        "shell"
    }

    async fn execute(&self, command: &str) -> CommandResult {
        let _guard = self.in_flight.lock().await;
        tracing::debug!(channel = %self.channel.describe(), command, "shell execute");
        match self.channel.run(command).await {
            Ok(out) => {
                if out.exit_code != 0 {
                    tracing::debug!(exit_code = out.exit_code, stderr = %out.stderr.trim(), "shell command failed");
                }
                CommandResult::from_parts(&out.stdout, &out.stderr, out.exit_code)
            }
            Err(e) => {
                tracing::warn!(error = %e, command, "shell channel error");
                CommandResult::error(e)
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::collections::VecDeque;
    use std::sync::Mutex as StdMutex;

    use super::*;

    /// Records commands and answers them from a script of canned outputs.
    /// Unscripted commands succeed with empty output.
    #[derive(Default)]
    pub struct ScriptedShell {
        pub calls: StdMutex<Vec<String>>,
        responses: StdMutex<VecDeque<(String, std::io::Result<ShellOutput>)>>,
    }

    impl ScriptedShell {
        pub fn new() -> Self {
            Self::default()
        }

        /// Answer the next command starting with `prefix`.
        pub fn on(&self, prefix: &str, stdout: &str, exit_code: i32) -> &Self {
            self.responses.lock().unwrap().push_back((
                prefix.to_string(),
                Ok(ShellOutput {
                    stdout: stdout.to_string(),
                    stderr: String::new(),
                    exit_code,
                }),
            ));
            self
        }

        pub fn on_stderr(&self, prefix: &str, stderr: &str, exit_code: i32) -> &Self {
            self.responses.lock().unwrap().push_back((
                prefix.to_string(),
                Ok(ShellOutput {
                    stdout: String::new(),
                    stderr: stderr.to_string(),
                    exit_code,
                }),
            ));
            self
        }

        pub fn fail(&self, prefix: &str, msg: &str) -> &Self {
            self.responses.lock().unwrap().push_back((
                prefix.to_string(),
                Err(std::io::Error::new(std::io::ErrorKind::BrokenPipe, msg.to_string())),
            ));
            self
        }

        pub fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ShellChannel for ScriptedShell {
        fn describe(&self) -> String {
            "scripted".into()
        }

        async fn run(&self, command: &str) -> std::io::Result<ShellOutput> {
            self.calls.lock().unwrap().push(command.to_string());
            let mut responses = self.responses.lock().unwrap();
            if let Some(pos) = responses.iter().position(|(p, _)| command.starts_with(p.as_str())) {
                if let Some((_, r)) = responses.remove(pos) {
                    return r;
                }
            }
            Ok(ShellOutput::default())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::ScriptedShell;
    use super::*;

    #[tokio::test]
    async fn forwards_verbatim_and_marks_exit() {
        let shell = Arc::new(ScriptedShell::new());
        shell.on("dumpsys window", "mCurrentFocus=Window{1 u0 com.a/.Main}\n", 0);
        let exec = ShellExecutor::new(shell.clone());

        let r = exec.execute("dumpsys window").await;
        assert_eq!(r.as_str(), "mCurrentFocus=Window{1 u0 com.a/.Main}\n[exit code: 0]");
        assert_eq!(shell.calls(), vec!["dumpsys window"]);
    }

    #[tokio::test]
    async fn stderr_and_nonzero_exit_preserved() {
        let shell = Arc::new(ScriptedShell::new());
        shell.on_stderr("input keyevent", "Error: Unknown keycode", 1);
        let exec = ShellExecutor::new(shell);

        let r = exec.execute("input keyevent BOGUS").await;
        assert_eq!(r.as_str(), "\n[stderr]\nError: Unknown keycode\n[exit code: 1]");
        assert_eq!(r.exit_code(), Some(1));
    }

    #[tokio::test]
    async fn channel_error_becomes_error_text() {
        let shell = Arc::new(ScriptedShell::new());
        shell.fail("input tap", "device offline");
        let exec = ShellExecutor::new(shell);

        let r = exec.execute("input tap 1 2").await;
        assert_eq!(r.as_str(), "Error: device offline\n[exit code: 1]");
    }

    #[tokio::test]
    async fn local_shell_runs_real_process() {
        let shell = LocalShell::new("sh", Duration::from_secs(5));
        let out = shell.run("echo hi; echo oops 1>&2; exit 3").await.unwrap();
        assert_eq!(out.stdout, "hi\n");
        assert_eq!(out.stderr, "oops\n");
        assert_eq!(out.exit_code, 3);
    }
}
