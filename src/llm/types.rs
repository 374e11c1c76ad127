use base64::Engine as _;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// One conversation turn as the orchestrator sees it.
///
/// A user turn carries at most one image; the type makes a second one
/// unrepresentable.
#[derive(Debug, Clone, PartialEq)]
pub enum ChatMessage {
    System(String),
    User { text: String, image: Option<Vec<u8>> },
    Assistant(String),
}

impl ChatMessage {
    pub fn system(text: impl Into<String>) -> Self {
        Self::System(text.into())
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::User {
            text: text.into(),
            image: None,
        }
    }

    pub fn user_with_image(text: impl Into<String>, image: Vec<u8>) -> Self {
        Self::User {
            text: text.into(),
            image: Some(image),
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self::Assistant(text.into())
    }

    pub fn role(&self) -> &'static str {
        match self {
            Self::System(_) => "system",
            Self::User { .. } => "user",
            Self::Assistant(_) => "assistant",
        }
    }

    pub fn text(&self) -> &str {
        match self {
            Self::System(t) | Self::Assistant(t) => t,
            Self::User { text, .. } => text,
        }
    }

    pub fn has_image(&self) -> bool {
        matches!(self, Self::User { image: Some(_), .. })
    }

    /// Drop the attached image, keeping the text.
    pub fn strip_image(&mut self) {
        if let Self::User { image, .. } = self {
            *image = None;
        }
    }
}

// ── Wire format (chat-completions) ────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireMessage {
    pub role: String,
    pub content: MessageContent,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    ImageUrl { image_url: ImageUrl },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageUrl {
    pub url: String,
}

impl From<&ChatMessage> for WireMessage {
    fn from(msg: &ChatMessage) -> Self {
        let content = match msg {
            ChatMessage::User {
                text,
                image: Some(image),
            } => MessageContent::Parts(vec![
                ContentPart::ImageUrl {
                    image_url: ImageUrl {
                        url: image_data_url(image),
                    },
                },
                ContentPart::Text { text: text.clone() },
            ]),
            other => MessageContent::Text(other.text().to_string()),
        };
        Self {
            role: msg.role().to_string(),
            content,
        }
    }
}

/// MIME type from the leading bytes; unknown data is sent as JPEG.
pub fn sniff_image_mime(bytes: &[u8]) -> &'static str {
    if bytes.starts_with(&[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A]) {
        "image/png"
    } else if bytes.starts_with(&[0xFF, 0xD8, 0xFF]) {
        "image/jpeg"
    } else if bytes.len() >= 12 && &bytes[..4] == b"RIFF" && &bytes[8..12] == b"WEBP" {
        "image/webp"
    } else if bytes.starts_with(b"GIF87a") || bytes.starts_with(b"GIF89a") {
        "image/gif"
    } else {
        "image/jpeg"
    }
}

pub fn image_data_url(bytes: &[u8]) -> String {
    format!(
        "data:{};base64,{}",
        sniff_image_mime(bytes),
        base64::engine::general_purpose::STANDARD.encode(bytes)
    )
}

// ── Streaming ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamChunk {
    pub kind: StreamChunkKind,
    pub content: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamChunkKind {
    Reasoning,
    Content,
    Done,
}

// ── Results ───────────────────────────────────────────────────────────────

/// A completed model turn split into reasoning and a single action expression.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelResponse {
    pub thinking: String,
    /// Balanced `do(...)`/`finish(...)` text, empty when none was found.
    pub action: String,
    pub raw_content: String,
    pub time_to_first_token_ms: Option<u64>,
    pub total_time_ms: Option<u64>,
}

impl ModelResponse {
    pub fn has_action(&self) -> bool {
        !self.action.is_empty()
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ModelError {
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("request timed out")]
    Timeout,

    #[error("server returned {code}: {message}")]
    ServerError { code: u16, message: String },

    #[error("malformed model response: {0:?}")]
    ParseError(String),

    #[error("request cancelled")]
    Cancelled,
}

impl ModelError {
    /// Connectivity or server trouble, as opposed to a reply the model got wrong.
    pub fn is_network(&self) -> bool {
        matches!(
            self,
            Self::ConnectionFailed(_) | Self::Timeout | Self::ServerError { .. }
        )
    }
}

impl From<reqwest::Error> for ModelError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::Timeout
        } else {
            Self::ConnectionFailed(e.to_string())
        }
    }
}
