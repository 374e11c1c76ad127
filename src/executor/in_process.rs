use std::sync::Arc;

use async_trait::async_trait;

use crate::executor::command::DeviceCommand;
use crate::executor::platform::{DevicePlatform, PlatformError, PlatformResult};
use crate::executor::result::CommandResult;
use crate::executor::CommandExecutor;

/// Backend that emulates the command grammar with direct platform calls.
///
/// Commands outside the dispatch table, and commands the platform declines
/// with [`PlatformError::Unsupported`], are handed verbatim to `fallback`.
pub struct InProcessExecutor {
    platform: Arc<dyn DevicePlatform>,
    fallback: Arc<dyn CommandExecutor>,
}

impl InProcessExecutor {
    pub fn new(platform: Arc<dyn DevicePlatform>, fallback: Arc<dyn CommandExecutor>) -> Self {
        Self { platform, fallback }
    }

    async fn delegate(&self, command: &str) -> CommandResult {
        tracing::debug!(command, fallback = self.fallback.name(), "delegating to fallback backend");
        self.fallback.execute(command).await
    }

    async fn dispatch(&self, cmd: &DeviceCommand) -> PlatformResult<CommandResult> {
        let p = &self.platform;
        match cmd {
            DeviceCommand::Tap { x, y } => {
                p.tap(*x, *y).await?;
                Ok(CommandResult::success(""))
            }
            DeviceCommand::Swipe {
                x1,
                y1,
                x2,
                y2,
                duration_ms,
            } => {
                p.swipe((*x1, *y1), (*x2, *y2), *duration_ms).await?;
                Ok(CommandResult::success(""))
            }
            DeviceCommand::KeyEvent { code } => {
                p.key_event(code).await?;
                Ok(CommandResult::success(""))
            }
            DeviceCommand::StartActivity(target) => {
                let status = p.start_activity(target).await?;
                Ok(CommandResult::success(status))
            }
            DeviceCommand::Screencap {
                display,
                path: Some(path),
            } => {
                let png = p.capture_png(*display).await?;
                tokio::fs::write(path, &png).await?;
                Ok(CommandResult::success(""))
            }
            // PNG on stdout is whatever the shell makes of it; leave it to the shell.
            DeviceCommand::Screencap { path: None, .. } => Err(PlatformError::Unsupported),
            DeviceCommand::DumpWindow => Ok(CommandResult::success(p.dump_windows().await?)),
            DeviceCommand::ImeList { short: true } => {
                let ids = p.list_input_methods(true).await?;
                Ok(CommandResult::success(ids.join("\n")))
            }
            // The verbose listing format only exists in the real tool.
            DeviceCommand::ImeList { short: false } => Err(PlatformError::Unsupported),
            DeviceCommand::ImeEnable(id) => {
                p.enable_input_method(id).await?;
                Ok(CommandResult::success(format!("Input method {id}: now enabled")))
            }
            DeviceCommand::ImeSet(id) => {
                p.set_input_method(id).await?;
                Ok(CommandResult::success(format!("Input method {id} selected for user #0")))
            }
            DeviceCommand::SettingsGet { namespace, key } => {
                let value = p.get_setting(namespace, key).await?;
                Ok(CommandResult::success(value.unwrap_or_else(|| "null".into())))
            }
            DeviceCommand::Broadcast(intent) => {
                Ok(CommandResult::success(p.send_broadcast(intent).await?))
            }
            DeviceCommand::ResolveActivity(query) => {
                let resolved = p.resolve_activity(query).await?;
                Ok(CommandResult::success(
                    resolved.unwrap_or_else(|| "No activity found".into()),
                ))
            }
            DeviceCommand::Raw(_) => Err(PlatformError::Unsupported),
        }
    }
}

#[async_trait]
impl CommandExecutor for InProcessExecutor {
    fn name(&self) -> &str {
        "in_process"
    }

    async fn execute(&self, command: &str) -> CommandResult {
        let parsed = DeviceCommand::parse(command);
        if parsed.is_raw() {
            return self.delegate(command).await;
        }

        match self.dispatch(&parsed).await {
            Ok(result) => result,
            Err(PlatformError::Unsupported) => {
                tracing::debug!(verb = parsed.verb(), "platform declined command");
                self.delegate(command).await
            }
            Err(PlatformError::Failed { message, exit_code }) => {
                tracing::warn!(verb = parsed.verb(), error = %message, "platform call failed");
                CommandResult::failure(message, exit_code.max(1))
            }
            Err(PlatformError::Io(e)) => {
                tracing::warn!(verb = parsed.verb(), error = %e, "platform io error");
                CommandResult::error(e)
            }
        }
    }
}
