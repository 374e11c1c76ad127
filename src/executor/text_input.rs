//! Text entry through a broadcast-driven keyboard IME.
//!
//! `input text` cannot carry non-ASCII text, so typing switches the active
//! IME to a keyboard that accepts base64 text over `am broadcast`, sends the
//! text, and switches back.

use base64::Engine as _;

use crate::executor::command::{BroadcastIntent, DeviceCommand};
use crate::executor::result::CommandResult;
use crate::executor::CommandExecutor;

pub const KEYBOARD_PACKAGE: &str = "com.android.adbkeyboard";
pub const KEYBOARD_IME: &str = "com.android.adbkeyboard/.AdbIME";
const ACTION_INPUT_B64: &str = "ADB_INPUT_B64";
const ACTION_CLEAR_TEXT: &str = "ADB_CLEAR_TEXT";

fn keyboard_broadcast(action: &str, extras: Vec<(String, String)>) -> String {
    DeviceCommand::Broadcast(BroadcastIntent {
        action: action.to_string(),
        package: Some(KEYBOARD_PACKAGE.to_string()),
        extras,
        include_background: true,
    })
    .to_string()
}

/// Current default IME, `None` when unset.
pub async fn current_ime(executor: &dyn CommandExecutor) -> Option<String> {
    let cmd = DeviceCommand::SettingsGet {
        namespace: "secure".into(),
        key: "default_input_method".into(),
    };
    let r = executor.execute(&cmd.to_string()).await;
    if !r.is_success() {
        return None;
    }
    let value = r.body().trim();
    (!value.is_empty() && value != "null").then(|| value.to_string())
}

/// Make the broadcast keyboard the active IME. Returns the IME that was
/// active before, so the caller can restore it.
pub async fn activate_keyboard(executor: &dyn CommandExecutor) -> Result<Option<String>, CommandResult> {
    let original = current_ime(executor).await;
    if original.as_deref() == Some(KEYBOARD_IME) {
        return Ok(original);
    }

    let listed = executor
        .execute(&DeviceCommand::ImeList { short: true }.to_string())
        .await;
    let enabled = listed.is_success() && listed.body().lines().any(|l| l.trim() == KEYBOARD_IME);
    if !enabled {
        let r = executor
            .execute(&DeviceCommand::ImeEnable(KEYBOARD_IME.into()).to_string())
            .await;
        if !r.is_success() {
            tracing::warn!(result = %r, "keyboard IME could not be enabled; is it installed?");
            return Err(r);
        }
    }

    let r = executor
        .execute(&DeviceCommand::ImeSet(KEYBOARD_IME.into()).to_string())
        .await;
    if !r.is_success() {
        return Err(r);
    }
    Ok(original)
}

pub async fn restore_ime(executor: &dyn CommandExecutor, original: Option<&str>) {
    let Some(original) = original else {
        return;
    };
    if original == KEYBOARD_IME {
        return;
    }
    let r = executor
        .execute(&DeviceCommand::ImeSet(original.to_string()).to_string())
        .await;
    if !r.is_success() {
        tracing::warn!(ime = original, result = %r, "failed to restore IME");
    }
}

pub async fn clear_text(executor: &dyn CommandExecutor) -> CommandResult {
    executor
        .execute(&keyboard_broadcast(ACTION_CLEAR_TEXT, Vec::new()))
        .await
}

pub async fn send_text(executor: &dyn CommandExecutor, text: &str) -> CommandResult {
    let encoded = base64::engine::general_purpose::STANDARD.encode(text.as_bytes());
    executor
        .execute(&keyboard_broadcast(
            ACTION_INPUT_B64,
            vec![("msg".to_string(), encoded)],
        ))
        .await
}

/// Replace the focused field's content with `text`.
pub async fn type_text(executor: &dyn CommandExecutor, text: &str) -> CommandResult {
    let original = match activate_keyboard(executor).await {
        Ok(original) => original,
        Err(r) => return r,
    };

    let cleared = clear_text(executor).await;
    let result = if cleared.is_success() {
        send_text(executor, text).await
    } else {
        cleared
    };

    restore_ime(executor, original.as_deref()).await;
    result
}
