//! Newline-delimited JSON protocol spoken over the worker's stdin/stdout.
//!
//! ```text
//! -> {"id":"9f0c...","op":"transcribe","audio":"/tmp/clip.wav"}
//! <- {"id":"9f0c...","ok":true,"text":"hello world"}
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Operation requested from the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Op {
    Ping,
    Transcribe,
    Shutdown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    pub id: String,
    pub op: Op,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio: Option<String>,
}

impl Request {
    fn new(op: Op, audio: Option<String>) -> Self {
        Self {
            id: new_correlation_id(),
            op,
            audio,
        }
    }

    pub fn ping() -> Self {
        Self::new(Op::Ping, None)
    }

    pub fn transcribe(audio: &Path) -> Self {
        Self::new(Op::Transcribe, Some(audio.to_string_lossy().into_owned()))
    }

    pub fn shutdown() -> Self {
        Self::new(Op::Shutdown, None)
    }

    /// Serialize as a single line, newline included.
    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        let mut line = serde_json::to_vec(self)?;
        line.push(b'\n');
        Ok(line)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    pub id: String,
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Structured error kind, e.g. `"dependency_missing"`. Older workers
    /// only prefix `error` with an upper-case code instead.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
}

impl Response {
    pub fn decode(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(line)
    }
}

pub fn new_correlation_id() -> String {
    Uuid::new_v4().simple().to_string()
}

/// Accumulates raw bytes from a pipe and slices off complete lines.
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.pending.extend_from_slice(bytes);
    }

    /// Next complete, non-blank line without its terminator.
    pub fn next_line(&mut self) -> Option<String> {
        loop {
            let newline = self.pending.iter().position(|&b| b == b'\n')?;
            let raw: Vec<u8> = self.pending.drain(..=newline).collect();
            let line = String::from_utf8_lossy(&raw);
            let line = line.trim_end_matches(['\n', '\r']);
            if !line.trim().is_empty() {
                return Some(line.to_string());
            }
        }
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn requests_encode_as_single_lines() {
        let test_cases = vec![
            ("ping", Request::ping(), r#""op":"ping""#, false),
            (
                "transcribe",
                Request::transcribe(Path::new("/tmp/a.wav")),
                r#""audio":"/tmp/a.wav""#,
                true,
            ),
            ("shutdown", Request::shutdown(), r#""op":"shutdown""#, false),
        ];

        for (description, request, fragment, has_audio) in test_cases {
            let encoded = request.encode().expect("encode");
            let text = String::from_utf8(encoded).expect("utf8");
            assert!(text.ends_with('\n'), "{description}: missing newline");
            assert_eq!(text.matches('\n').count(), 1, "{description}");
            assert!(text.contains(fragment), "{description}: {text}");
            assert_eq!(text.contains("\"audio\""), has_audio, "{description}");
            assert!(text.contains(&request.id), "{description}");
        }
    }

    #[test]
    fn correlation_ids_are_unique() {
        assert_ne!(Request::ping().id, Request::ping().id);
    }

    #[test]
    fn response_decodes_optional_fields() {
        let ok = Response::decode(r#"{"id":"a","ok":true,"text":"hi"}"#).expect("ok");
        assert_eq!(ok.text.as_deref(), Some("hi"));
        assert!(ok.error.is_none());

        let failed = Response::decode(
            r#"{"id":"b","ok":false,"error":"DEPENDENCY_MISSING: numpy","kind":"dependency_missing"}"#,
        )
        .expect("failed");
        assert!(!failed.ok);
        assert_eq!(failed.kind.as_deref(), Some("dependency_missing"));

        assert!(Response::decode("not json").is_err());
    }

    #[test]
    fn line_buffer_handles_split_and_batched_lines() {
        let mut buffer = LineBuffer::new();
        buffer.push(b"{\"id\":");
        assert_eq!(buffer.next_line(), None);

        buffer.push(b"\"1\"}\r\n\n{\"id\":\"2\"}\n{\"id\"");
        assert_eq!(buffer.next_line().as_deref(), Some("{\"id\":\"1\"}"));
        assert_eq!(buffer.next_line().as_deref(), Some("{\"id\":\"2\"}"));
        assert_eq!(buffer.next_line(), None);
        assert_eq!(buffer.pending_len(), 5);
    }
}
