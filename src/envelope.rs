//! Parsing of the initialization envelope.
//!
//! The first message of every session must be a JSON object naming the
//! upstream `target` and the credential to present to it:
//!
//! ```json
//! { "api_key": "...", "target": "wss://host/stream", "payload": "{...}" }
//! ```
//!
//! `apiKey` is accepted in place of `api_key`. Everything after the envelope
//! is opaque to the relay.

use serde::Deserialize;
use std::fmt;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, frame::coding::CloseCode};

use crate::frame::Frame;

/// Reasons a first message cannot initialize a session.
///
/// The display text doubles as the close reason sent to the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolViolation {
    #[error("Expected JSON envelope")]
    BinaryBeforeInit,
    #[error("Invalid JSON envelope")]
    MalformedEnvelope,
    #[error("Missing api_key or target")]
    MissingField,
}

impl ProtocolViolation {
    #[must_use]
    pub fn close_frame(self) -> CloseFrame {
        CloseFrame {
            code: CloseCode::Policy,
            reason: self.to_string().into(),
        }
    }
}

/// Validated session parameters supplied by the client.
#[derive(Clone, PartialEq, Eq)]
pub struct Envelope {
    credential: String,
    target: String,
    payload: Option<String>,
}

#[derive(Deserialize)]
struct RawEnvelope {
    #[serde(default)]
    api_key: Option<String>,
    #[serde(default, rename = "apiKey")]
    api_key_camel: Option<String>,
    #[serde(default)]
    target: Option<String>,
    #[serde(default)]
    payload: Option<String>,
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|s| !s.is_empty())
}

/// Validates the first message of a session.
pub fn parse(frame: &Frame) -> Result<Envelope, ProtocolViolation> {
    let Frame::Text(text) = frame else {
        return Err(ProtocolViolation::BinaryBeforeInit);
    };

    let value: serde_json::Value =
        serde_json::from_str(text.as_str()).map_err(|_| ProtocolViolation::MalformedEnvelope)?;
    if !value.is_object() {
        return Err(ProtocolViolation::MalformedEnvelope);
    }
    let raw =
        RawEnvelope::deserialize(value).map_err(|_| ProtocolViolation::MalformedEnvelope)?;

    let credential = non_empty(raw.api_key).or_else(|| non_empty(raw.api_key_camel));
    let target = non_empty(raw.target);

    match (credential, target) {
        (Some(credential), Some(target)) => Ok(Envelope {
            credential,
            target,
            payload: non_empty(raw.payload),
        }),
        _ => Err(ProtocolViolation::MissingField),
    }
}

impl Envelope {
    #[must_use]
    pub fn credential(&self) -> &str {
        &self.credential
    }

    #[must_use]
    pub fn target(&self) -> &str {
        &self.target
    }

    /// The payload as the first frame to forward upstream.
    #[must_use]
    pub fn payload_frame(&self) -> Option<Frame> {
        self.payload.as_deref().map(|payload| Frame::text(payload.to_owned()))
    }
}

impl fmt::Debug for Envelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Envelope")
            .field("credential", &"<redacted>")
            .field("target", &self.target)
            .field("payload", &self.payload)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text(s: &str) -> Frame {
        Frame::text(s.to_owned())
    }

    #[test]
    fn parses_snake_case_credential() {
        let envelope = parse(&text(r#"{"api_key":"k1","target":"wss://upstream/stream"}"#)).unwrap();
        assert_eq!(envelope.credential(), "k1");
        assert_eq!(envelope.target(), "wss://upstream/stream");
        assert_eq!(envelope.payload_frame(), None);
    }

    #[test]
    fn parses_camel_case_credential_with_payload() {
        let envelope = parse(&text(
            r#"{"apiKey":"k1","target":"wss://upstream/stream","payload":"{\"type\":\"init\"}"}"#,
        ))
        .unwrap();
        assert_eq!(envelope.credential(), "k1");
        assert_eq!(
            envelope.payload_frame(),
            Some(Frame::text(r#"{"type":"init"}"#))
        );
    }

    #[test]
    fn prefers_snake_case_and_falls_back_when_empty() {
        let both = parse(&text(r#"{"api_key":"a","apiKey":"b","target":"ws://x"}"#)).unwrap();
        assert_eq!(both.credential(), "a");

        let fallback = parse(&text(r#"{"api_key":"","apiKey":"b","target":"ws://x"}"#)).unwrap();
        assert_eq!(fallback.credential(), "b");
    }

    #[test]
    fn empty_payload_is_absent() {
        let envelope = parse(&text(r#"{"api_key":"k","target":"ws://x","payload":""}"#)).unwrap();
        assert_eq!(envelope.payload_frame(), None);
    }

    #[test]
    fn rejects_binary_first_message() {
        let result = parse(&Frame::binary(br#"{"api_key":"k","target":"ws://x"}"#.to_vec()));
        assert_eq!(result, Err(ProtocolViolation::BinaryBeforeInit));
    }

    #[test]
    fn rejects_malformed_json() {
        for input in [
            "not json",
            "{\"api_key\":",
            "[\"k\",\"ws://x\"]",
            "42",
            "null",
            r#"{"api_key":"k","target":5}"#,
            r#"{"api_key":"k","target":"ws://x","payload":{"type":"init"}}"#,
        ] {
            assert_eq!(
                parse(&text(input)),
                Err(ProtocolViolation::MalformedEnvelope),
                "input: {input}"
            );
        }
    }

    #[test]
    fn rejects_missing_fields() {
        for input in [
            r#"{"target":"ws://x"}"#,
            r#"{"api_key":"k"}"#,
            r#"{"api_key":"k","target":""}"#,
            r#"{"apiKey":"","target":"ws://x"}"#,
            "{}",
        ] {
            assert_eq!(
                parse(&text(input)),
                Err(ProtocolViolation::MissingField),
                "input: {input}"
            );
        }
    }

    #[test]
    fn violations_close_with_policy_code() {
        let frame = ProtocolViolation::MissingField.close_frame();
        assert_eq!(u16::from(frame.code), 1008);
        assert_eq!(frame.reason.as_str(), "Missing api_key or target");
    }

    #[test]
    fn debug_output_redacts_credential() {
        let envelope = parse(&text(r#"{"api_key":"secret-key","target":"ws://x"}"#)).unwrap();
        let rendered = format!("{envelope:?}");
        assert!(!rendered.contains("secret-key"));
        assert!(rendered.contains("ws://x"));
    }
}
