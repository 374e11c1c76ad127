//! Text convention shared by every command backend.
//!
//! A result is plain text: the command's stdout, an optional
//! `\n[stderr]\n...` section and a trailing `\n[exit code: N]` marker.
//! Callers inspect results by these markers, never by structured fields.

use std::fmt;

pub const STDERR_MARKER: &str = "[stderr]";
pub const EXIT_MARKER_PREFIX: &str = "[exit code: ";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandResult {
    text: String,
}

impl CommandResult {
    /// Build a result from the pieces of a finished process.
    pub fn from_parts(stdout: &str, stderr: &str, exit_code: i32) -> Self {
        let mut text = stdout.trim_end_matches('\n').to_string();
        let stderr = stderr.trim_end_matches('\n');
        if !stderr.is_empty() {
            text.push('\n');
            text.push_str(STDERR_MARKER);
            text.push('\n');
            text.push_str(stderr);
        }
        text.push('\n');
        text.push_str(&format!("{EXIT_MARKER_PREFIX}{exit_code}]"));
        Self { text }
    }

    pub fn success(stdout: impl AsRef<str>) -> Self {
        Self::from_parts(stdout.as_ref(), "", 0)
    }

    /// `Error: <msg>` with exit code 1.
    pub fn error(msg: impl fmt::Display) -> Self {
        Self::failure(msg, 1)
    }

    pub fn failure(msg: impl fmt::Display, exit_code: i32) -> Self {
        Self::from_parts(&format!("Error: {msg}"), "", exit_code)
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }

    pub fn into_string(self) -> String {
        self.text
    }

    /// Exit code from the trailing marker, if one is present.
    pub fn exit_code(&self) -> Option<i32> {
        let start = self.text.rfind(EXIT_MARKER_PREFIX)? + EXIT_MARKER_PREFIX.len();
        let rest = &self.text[start..];
        let end = rest.find(']')?;
        rest[..end].trim().parse().ok()
    }

    pub fn is_success(&self) -> bool {
        self.exit_code() == Some(0) && !self.text.starts_with("Error:")
    }

    /// Stdout payload with the stderr section and exit marker removed.
    pub fn body(&self) -> &str {
        strip_decoration(&self.text)
    }

    pub fn stderr(&self) -> Option<&str> {
        let marker = format!("\n{STDERR_MARKER}\n");
        let start = self.text.find(&marker)? + marker.len();
        let rest = &self.text[start..];
        let end = rest.rfind(&format!("\n{EXIT_MARKER_PREFIX}")).unwrap_or(rest.len());
        Some(&rest[..end])
    }

    pub fn contains(&self, needle: &str) -> bool {
        self.text.contains(needle)
    }

    /// Case-insensitive search across stdout and stderr.
    pub fn mentions(&self, needle: &str) -> bool {
        self.text.to_lowercase().contains(&needle.to_lowercase())
    }
}

impl fmt::Display for CommandResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

/// Cut `text` at the first stderr section or exit marker line.
pub fn strip_decoration(text: &str) -> &str {
    let mut end = text.len();
    if let Some(i) = text.find(&format!("\n{STDERR_MARKER}\n")) {
        end = end.min(i);
    } else if text.starts_with(&format!("{STDERR_MARKER}\n")) {
        end = 0;
    }
    if let Some(i) = text.rfind(&format!("\n{EXIT_MARKER_PREFIX}")) {
        end = end.min(i);
    } else if text.starts_with(EXIT_MARKER_PREFIX) {
        end = 0;
    }
    &text[..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_carries_zero_exit() {
        let r = CommandResult::success("hello\n");
        assert_eq!(r.as_str(), "hello\n[exit code: 0]");
        assert_eq!(r.exit_code(), Some(0));
        assert!(r.is_success());
        assert_eq!(r.body(), "hello");
    }

    #[test]
    fn error_convention() {
        let r = CommandResult::error("boom");
        assert_eq!(r.as_str(), "Error: boom\n[exit code: 1]");
        assert_eq!(r.exit_code(), Some(1));
        assert!(!r.is_success());
    }

    #[test]
    fn stderr_section_sits_before_marker() {
        let r = CommandResult::from_parts("out", "warn: x\n", 2);
        assert_eq!(r.as_str(), "out\n[stderr]\nwarn: x\n[exit code: 2]");
        assert_eq!(r.stderr(), Some("warn: x"));
        assert_eq!(r.body(), "out");
        assert_eq!(r.exit_code(), Some(2));
    }

    #[test]
    fn empty_stdout_body() {
        let r = CommandResult::success("");
        assert_eq!(r.as_str(), "\n[exit code: 0]");
        assert_eq!(r.body(), "");
    }
}
