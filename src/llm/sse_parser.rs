use crate::llm::types::{ModelError, StreamChunk, StreamChunkKind};

/// Parses a raw SSE line (OpenAI-compatible format) into StreamChunks.
/// Keep-alives, comments and deltas without text yield nothing; a delta
/// carrying both reasoning and content yields both, reasoning first.
pub fn parse_sse_line(line: &str) -> Result<Vec<StreamChunk>, ModelError> {
    if line.is_empty() || line.starts_with(':') {
        return Ok(Vec::new());
    }

    let data = match line.strip_prefix("data:") {
        Some(d) => d.trim(),
        None => return Ok(Vec::new()),
    };

    if data == "[DONE]" {
        return Ok(vec![StreamChunk {
            kind: StreamChunkKind::Done,
            content: String::new(),
        }]);
    }

    let json: serde_json::Value =
        serde_json::from_str(data).map_err(|_| ModelError::ParseError(data.to_string()))?;

    let mut chunks = Vec::new();
    if let Some(first) = json["choices"].as_array().and_then(|c| c.first()) {
        let delta = &first["delta"];

        // Some servers stream reasoning separately from content.
        for (field, kind) in [
            ("reasoning_content", StreamChunkKind::Reasoning),
            ("content", StreamChunkKind::Content),
        ] {
            if let Some(text) = delta[field].as_str().filter(|t| !t.is_empty()) {
                chunks.push(StreamChunk {
                    kind,
                    content: text.to_string(),
                });
            }
        }
    }

    Ok(chunks)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_delta() {
        let chunks = parse_sse_line(r#"data: {"choices":[{"delta":{"content":"hel"}}]}"#).unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].kind, StreamChunkKind::Content);
        assert_eq!(chunks[0].content, "hel");
    }

    #[test]
    fn done_marker_and_noise() {
        assert_eq!(
            parse_sse_line("data: [DONE]").unwrap()[0].kind,
            StreamChunkKind::Done
        );
        assert!(parse_sse_line(": keep-alive").unwrap().is_empty());
        assert!(parse_sse_line("event: message").unwrap().is_empty());
        assert!(parse_sse_line(r#"data: {"choices":[{"delta":{"role":"assistant"}}]}"#)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn malformed_json_is_an_error() {
        let err = parse_sse_line("data: {not json").unwrap_err();
        assert_eq!(err, ModelError::ParseError("{not json".into()));
    }

    #[test]
    fn reasoning_delta() {
        let chunks =
            parse_sse_line(r#"data: {"choices":[{"delta":{"reasoning_content":"hmm"}}]}"#).unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].kind, StreamChunkKind::Reasoning);
    }

    #[test]
    fn reasoning_and_content_in_one_delta() {
        let chunks = parse_sse_line(
            r#"data: {"choices":[{"delta":{"reasoning_content":"hmm","content":"do("}}]}"#,
        )
        .unwrap();
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].kind, StreamChunkKind::Reasoning);
        assert_eq!(chunks[1].kind, StreamChunkKind::Content);
        assert_eq!(chunks[1].content, "do(");
    }
}
