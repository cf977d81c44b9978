use tokio_tungstenite::tungstenite::{Bytes, Message, Utf8Bytes, protocol::CloseFrame};

/// One opaque payload unit exchanged with either peer.
///
/// The relay never looks inside a frame after initialization; it only keeps
/// track of whether the payload travelled as text or binary so the tag can be
/// reproduced on the other side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(Utf8Bytes),
    Binary(Bytes),
}

impl Frame {
    #[must_use]
    pub fn text(data: impl Into<Utf8Bytes>) -> Self {
        Self::Text(data.into())
    }

    #[must_use]
    pub fn binary(data: impl Into<Bytes>) -> Self {
        Self::Binary(data.into())
    }

    #[must_use]
    pub const fn is_binary(&self) -> bool {
        matches!(self, Self::Binary(_))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::Text(text) => text.len(),
            Self::Binary(data) => data.len(),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn into_message(self) -> Message {
        match self {
            Self::Text(text) => Message::Text(text),
            Self::Binary(data) => Message::Binary(data),
        }
    }
}

/// What a received WebSocket message means to a session.
#[derive(Debug)]
pub enum Event {
    Data(Frame),
    Close(Option<CloseFrame>),
    /// Ping, pong and raw frames. Answered per hop by tungstenite.
    Control,
}

impl From<Message> for Event {
    fn from(message: Message) -> Self {
        match message {
            Message::Text(text) => Self::Data(Frame::Text(text)),
            Message::Binary(data) => Self::Data(Frame::Binary(data)),
            Message::Close(frame) => Self::Close(frame),
            Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => Self::Control,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;

    #[test]
    fn keeps_text_and_binary_tags() {
        let text = Frame::text("hello");
        let binary = Frame::binary(vec![1u8, 2, 3]);

        assert!(!text.is_binary());
        assert!(binary.is_binary());
        assert_eq!(text.into_message(), Message::Text("hello".into()));
        assert_eq!(binary.into_message(), Message::Binary(vec![1u8, 2, 3].into()));
    }

    #[test]
    fn classifies_messages() {
        assert!(matches!(
            Event::from(Message::Binary(vec![7u8].into())),
            Event::Data(Frame::Binary(_))
        ));
        assert!(matches!(
            Event::from(Message::Ping(Bytes::new())),
            Event::Control
        ));

        let close = Event::from(Message::Close(Some(CloseFrame {
            code: CloseCode::Normal,
            reason: "done".into(),
        })));
        match close {
            Event::Close(Some(frame)) => {
                assert_eq!(frame.code, CloseCode::Normal);
                assert_eq!(frame.reason.as_str(), "done");
            }
            other => panic!("expected close event, got {other:?}"),
        }
    }

    #[test]
    fn reports_payload_length() {
        assert_eq!(Frame::text("abcd").len(), 4);
        assert!(Frame::binary(Vec::<u8>::new()).is_empty());
    }
}
