//! Per-connection relay state machine.
//!
//! A session owns the client socket for its whole life and the upstream
//! socket once it exists. It moves through
//!
//! ```text
//! AwaitingInit -> Connecting -> Bridging -> Closing -> Closed
//!       \______________\______________________/
//! ```
//!
//! and every state carries only the data that is valid in it, so an event can
//! never be handled against the wrong half-initialized connection.

use futures_util::{Sink, SinkExt, Stream, StreamExt};
use std::{fmt, sync::Arc, time::Duration};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::{
    WebSocketStream,
    tungstenite::{
        Error as TungsteniteError, Message,
        error::ProtocolError,
        protocol::{CloseFrame, frame::coding::CloseCode},
    },
};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    config::RelayConfig,
    envelope::{self, Envelope, ProtocolViolation},
    frame::Event,
    pending::{PendingQueue, QueueFull},
    upstream::{self, UpstreamError, UpstreamStream},
};

/// Which peer a lifecycle event came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Client,
    Upstream,
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Client => "client",
            Self::Upstream => "upstream",
        })
    }
}

/// How a session ended.
#[derive(Debug)]
pub enum Termination {
    ProtocolViolation(ProtocolViolation),
    UpstreamFailure(UpstreamError),
    QueueOverflow(QueueFull),
    /// Clean close initiated by one side and mirrored to the other.
    PeerClosure {
        side: Side,
        frame: Option<CloseFrame>,
    },
    /// The client vanished without a closing handshake.
    ClientGone,
}

impl Termination {
    #[must_use]
    pub const fn is_error(&self) -> bool {
        matches!(
            self,
            Self::ProtocolViolation(_) | Self::UpstreamFailure(_) | Self::QueueOverflow(_)
        )
    }
}

impl fmt::Display for Termination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ProtocolViolation(violation) => write!(f, "protocol violation: {violation}"),
            Self::UpstreamFailure(err) => write!(f, "upstream failure: {err}"),
            Self::QueueOverflow(full) => write!(f, "{full}"),
            Self::PeerClosure { side, frame: Some(frame) } => {
                write!(
                    f,
                    "{side} closed ({} {})",
                    u16::from(frame.code),
                    frame.reason.as_str()
                )
            }
            Self::PeerClosure { side, frame: None } => write!(f, "{side} closed"),
            Self::ClientGone => f.write_str("client disconnected"),
        }
    }
}

/// What remains to be done on one socket while closing.
#[derive(Debug)]
enum Shutdown {
    /// The peer sent its close frame; flush tungstenite's reply.
    Acknowledge,
    /// Start the closing handshake.
    Initiate(Option<CloseFrame>),
    /// The transport is already broken.
    Abandon,
}

struct Closing {
    client: Shutdown,
    upstream: Option<(UpstreamStream, Shutdown)>,
    termination: Termination,
}

enum State {
    AwaitingInit,
    Connecting {
        envelope: Envelope,
        pending: PendingQueue,
    },
    Bridging {
        upstream: UpstreamStream,
        pending: PendingQueue,
    },
    Closing(Closing),
    Closed(Termination),
}

impl State {
    const fn name(&self) -> &'static str {
        match self {
            Self::AwaitingInit => "awaiting_init",
            Self::Connecting { .. } => "connecting",
            Self::Bridging { .. } => "bridging",
            Self::Closing(_) => "closing",
            Self::Closed(_) => "closed",
        }
    }

    fn closing(client: Shutdown, termination: Termination) -> Self {
        Self::Closing(Closing {
            client,
            upstream: None,
            termination,
        })
    }
}

/// One client connection and, once initialized, its upstream counterpart.
pub struct Session<S> {
    id: Uuid,
    client: WebSocketStream<S>,
    relay: Arc<RelayConfig>,
}

impl<S> Session<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    #[must_use]
    pub fn new(client: WebSocketStream<S>, relay: Arc<RelayConfig>) -> Self {
        Self {
            id: Uuid::new_v4(),
            client,
            relay,
        }
    }

    #[must_use]
    pub const fn id(&self) -> Uuid {
        self.id
    }

    /// Drives the session to completion. Both sockets are closed on return.
    pub async fn run(mut self) -> Termination {
        let mut state = State::AwaitingInit;
        loop {
            debug!(session_id = %self.id, state = state.name(), "Session state");
            state = match state {
                State::AwaitingInit => self.await_init().await,
                State::Connecting { envelope, pending } => self.connect(envelope, pending).await,
                State::Bridging { upstream, pending } => self.bridge(upstream, pending).await,
                State::Closing(closing) => State::Closed(self.close(closing).await),
                State::Closed(termination) => return termination,
            };
        }
    }

    async fn await_init(&mut self) -> State {
        loop {
            let message = match self.client.next().await {
                Some(Ok(message)) => message,
                Some(Err(e)) => {
                    log_client_error(&e);
                    return State::closing(Shutdown::Abandon, Termination::ClientGone);
                }
                None => return State::closing(Shutdown::Abandon, Termination::ClientGone),
            };

            let frame = match Event::from(message) {
                Event::Data(frame) => frame,
                Event::Close(frame) => {
                    return State::closing(
                        Shutdown::Acknowledge,
                        Termination::PeerClosure {
                            side: Side::Client,
                            frame,
                        },
                    );
                }
                Event::Control => continue,
            };

            return match envelope::parse(&frame) {
                Ok(envelope) => {
                    let mut pending = PendingQueue::new(self.relay.max_pending_frames);
                    if let Some(payload) = envelope.payload_frame() {
                        if let Err(full) = pending.enqueue(payload) {
                            return self.overflow(full);
                        }
                    }
                    State::Connecting { envelope, pending }
                }
                Err(violation) => {
                    warn!(session_id = %self.id, %violation, "Rejecting session");
                    State::closing(
                        Shutdown::Initiate(Some(violation.close_frame())),
                        Termination::ProtocolViolation(violation),
                    )
                }
            };
        }
    }

    async fn connect(&mut self, envelope: Envelope, mut pending: PendingQueue) -> State {
        info!(
            session_id = %self.id,
            upstream = envelope.target(),
            "Connecting to upstream"
        );

        let connecting = upstream::connect(
            envelope.target(),
            envelope.credential(),
            self.relay.connect_timeout(),
        );
        tokio::pin!(connecting);

        loop {
            tokio::select! {
                result = &mut connecting => {
                    return match result {
                        Ok(upstream) => State::Bridging { upstream, pending },
                        Err(err) => self.upstream_failed(err, None),
                    };
                }
                message = self.client.next() => match message {
                    Some(Ok(message)) => match Event::from(message) {
                        Event::Data(frame) => {
                            debug!(
                                session_id = %self.id,
                                bytes = frame.len(),
                                binary = frame.is_binary(),
                                "Queueing frame until upstream is ready"
                            );
                            if let Err(full) = pending.enqueue(frame) {
                                return self.overflow(full);
                            }
                        }
                        // Dropping `connecting` abandons the upstream handshake.
                        Event::Close(frame) => {
                            return State::closing(
                                Shutdown::Acknowledge,
                                Termination::PeerClosure { side: Side::Client, frame },
                            );
                        }
                        Event::Control => {}
                    },
                    Some(Err(e)) => {
                        log_client_error(&e);
                        return State::closing(Shutdown::Abandon, Termination::ClientGone);
                    }
                    None => return State::closing(Shutdown::Abandon, Termination::ClientGone),
                },
            }
        }
    }

    /// Runs both directions as independent futures until one of them ends.
    ///
    /// The pending queue is drained by the client-to-upstream direction
    /// before it reads any new client frame, so arrival order is kept while
    /// upstream traffic keeps flowing to the client.
    async fn bridge(&mut self, mut upstream: UpstreamStream, mut pending: PendingQueue) -> State {
        let session_id = self.id;
        let (side, exit) = {
            let (mut client_tx, mut client_rx) = (&mut self.client).split();
            let (mut upstream_tx, mut upstream_rx) = (&mut upstream).split();

            let client_to_upstream = async {
                let bytes = pending.buffered_bytes();
                match pending.drain_into(&mut upstream_tx).await {
                    Ok(sent) => {
                        info!(%session_id, drained = sent, bytes, "Upstream ready");
                    }
                    Err(e) => {
                        debug!(
                            %session_id,
                            remaining = pending.len(),
                            "Failed to drain pending queue"
                        );
                        return PumpExit::WriteFailed(e);
                    }
                }
                pump(&mut client_rx, &mut upstream_tx, session_id, Side::Client).await
            };
            let upstream_to_client =
                pump(&mut upstream_rx, &mut client_tx, session_id, Side::Upstream);

            tokio::select! {
                exit = client_to_upstream => (Side::Client, exit),
                exit = upstream_to_client => (Side::Upstream, exit),
            }
        };

        match (side, exit) {
            (Side::Client, PumpExit::Closed(frame)) => State::Closing(Closing {
                client: Shutdown::Acknowledge,
                upstream: Some((upstream, Shutdown::Initiate(frame.clone()))),
                termination: Termination::PeerClosure {
                    side: Side::Client,
                    frame,
                },
            }),
            (Side::Upstream, PumpExit::Closed(frame)) => State::Closing(Closing {
                client: Shutdown::Initiate(frame.clone()),
                upstream: Some((upstream, Shutdown::Acknowledge)),
                termination: Termination::PeerClosure {
                    side: Side::Upstream,
                    frame,
                },
            }),
            (Side::Client, PumpExit::ReadFailed(err)) => {
                if let Some(e) = &err {
                    log_client_error(e);
                }
                client_gone(upstream)
            }
            (Side::Upstream, PumpExit::WriteFailed(e)) => {
                log_client_error(&e);
                client_gone(upstream)
            }
            (Side::Upstream, PumpExit::ReadFailed(err)) => {
                let err = err.map_or(UpstreamError::Dropped, UpstreamError::Transport);
                self.upstream_failed(err, Some((upstream, Shutdown::Abandon)))
            }
            (Side::Client, PumpExit::WriteFailed(e)) => {
                self.upstream_failed(UpstreamError::Transport(e), Some((upstream, Shutdown::Abandon)))
            }
        }
    }

    async fn close(&mut self, closing: Closing) -> Termination {
        let grace = self.relay.close_grace();
        let Closing {
            client,
            upstream,
            termination,
        } = closing;

        let upstream_done = async {
            if let Some((mut upstream, shutdown)) = upstream {
                finish(&mut upstream, shutdown, grace, Side::Upstream).await;
            }
        };
        tokio::join!(
            finish(&mut self.client, client, grace, Side::Client),
            upstream_done
        );

        termination
    }

    fn upstream_failed(
        &self,
        err: UpstreamError,
        upstream: Option<(UpstreamStream, Shutdown)>,
    ) -> State {
        warn!(session_id = %self.id, error = %err, "Upstream failure");
        State::Closing(Closing {
            client: Shutdown::Initiate(Some(err.close_frame())),
            upstream,
            termination: Termination::UpstreamFailure(err),
        })
    }

    fn overflow(&self, full: QueueFull) -> State {
        warn!(session_id = %self.id, limit = full.limit, "Pending queue overflow");
        State::closing(
            Shutdown::Initiate(Some(CloseFrame {
                code: CloseCode::Again,
                reason: "Pending queue full".into(),
            })),
            Termination::QueueOverflow(full),
        )
    }
}

/// The client is unreachable; the upstream still gets a closing handshake.
fn client_gone(upstream: UpstreamStream) -> State {
    State::Closing(Closing {
        client: Shutdown::Abandon,
        upstream: Some((upstream, Shutdown::Initiate(None))),
        termination: Termination::ClientGone,
    })
}

/// Why one forwarding direction stopped.
enum PumpExit {
    /// The source sent a close frame.
    Closed(Option<CloseFrame>),
    /// The source errored, or ended without a closing handshake (`None`).
    ReadFailed(Option<TungsteniteError>),
    /// The destination refused a frame.
    WriteFailed(TungsteniteError),
}

/// Forwards data frames from `source` to `sink` verbatim until either fails
/// or the source closes.
async fn pump<R, W>(source: &mut R, sink: &mut W, session_id: Uuid, from: Side) -> PumpExit
where
    R: Stream<Item = Result<Message, TungsteniteError>> + Unpin,
    W: Sink<Message, Error = TungsteniteError> + Unpin,
{
    loop {
        let message = match source.next().await {
            Some(Ok(message)) => message,
            Some(Err(e)) => return PumpExit::ReadFailed(Some(e)),
            None => return PumpExit::ReadFailed(None),
        };
        match Event::from(message) {
            Event::Data(frame) => {
                debug!(
                    %session_id,
                    %from,
                    bytes = frame.len(),
                    binary = frame.is_binary(),
                    "Forwarding frame"
                );
                if let Err(e) = sink.send(frame.into_message()).await {
                    return PumpExit::WriteFailed(e);
                }
            }
            Event::Close(frame) => return PumpExit::Closed(frame),
            Event::Control => {}
        }
    }
}

/// Completes the closing handshake on one socket, bounded by `grace`.
async fn finish<S>(ws: &mut WebSocketStream<S>, shutdown: Shutdown, grace: Duration, side: Side)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    match shutdown {
        Shutdown::Abandon => return,
        Shutdown::Initiate(frame) => {
            if let Some(frame) = &frame {
                debug!(
                    %side,
                    code = u16::from(frame.code),
                    reason = frame.reason.as_str(),
                    "Sending close frame"
                );
            }
            if let Err(e) = ws.close(frame).await {
                debug!(%side, error = %e, "Close frame not delivered");
                return;
            }
        }
        Shutdown::Acknowledge => {}
    }

    // Reading to the end flushes any pending close reply and waits for the
    // peer's acknowledgement of ours.
    let drained = tokio::time::timeout(grace, async {
        while let Some(Ok(_)) = ws.next().await {}
    })
    .await;
    if drained.is_err() {
        debug!(%side, "Peer did not finish closing handshake in time");
    }
}

fn log_client_error(e: &TungsteniteError) {
    match e {
        TungsteniteError::ConnectionClosed
        | TungsteniteError::Protocol(ProtocolError::ResetWithoutClosingHandshake) => {
            debug!("Client disconnected: {e}");
        }
        _ => {
            warn!("Client WebSocket error: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_failures_count_as_errors() {
        assert!(Termination::ProtocolViolation(ProtocolViolation::MissingField).is_error());
        assert!(Termination::UpstreamFailure(UpstreamError::Dropped).is_error());
        assert!(Termination::QueueOverflow(QueueFull { limit: 8 }).is_error());
        assert!(!Termination::ClientGone.is_error());
        assert!(
            !Termination::PeerClosure {
                side: Side::Upstream,
                frame: None
            }
            .is_error()
        );
    }

    #[test]
    fn describes_mirrored_closures() {
        let termination = Termination::PeerClosure {
            side: Side::Upstream,
            frame: Some(CloseFrame {
                code: CloseCode::Normal,
                reason: "done".into(),
            }),
        };
        assert_eq!(termination.to_string(), "upstream closed (1000 done)");
        assert_eq!(
            Termination::ProtocolViolation(ProtocolViolation::BinaryBeforeInit).to_string(),
            "protocol violation: Expected JSON envelope"
        );
    }
}
