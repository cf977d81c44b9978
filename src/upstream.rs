use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async,
    tungstenite::{
        Error as TungsteniteError,
        client::IntoClientRequest,
        handshake::client::Request,
        http::{
            HeaderValue,
            header::{AUTHORIZATION, InvalidHeaderValue},
        },
        protocol::{CloseFrame, frame::coding::CloseCode},
    },
};
use tracing::debug;

pub type UpstreamStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub const UPSTREAM_ERROR_REASON: &str = "Upstream error";

#[derive(Debug, thiserror::Error)]
pub enum UpstreamError {
    #[error("invalid upstream target: {0}")]
    Target(#[source] TungsteniteError),
    #[error("credential is not a valid header value")]
    Credential(#[from] InvalidHeaderValue),
    #[error("upstream handshake failed: {0}")]
    Handshake(#[source] TungsteniteError),
    #[error("upstream handshake timed out after {0:?}")]
    Timeout(Duration),
    #[error("upstream transport error: {0}")]
    Transport(#[source] TungsteniteError),
    #[error("upstream went away without a closing handshake")]
    Dropped,
}

impl UpstreamError {
    /// What the client is told. Never includes the target or the credential.
    #[must_use]
    pub fn close_frame(&self) -> CloseFrame {
        CloseFrame {
            code: CloseCode::Error,
            reason: UPSTREAM_ERROR_REASON.into(),
        }
    }
}

/// Builds the upstream handshake request with the bearer credential attached.
pub fn build_request(target: &str, credential: &str) -> Result<Request, UpstreamError> {
    let mut request = target
        .into_client_request()
        .map_err(UpstreamError::Target)?;

    let mut authorization = HeaderValue::from_str(&format!("Bearer {credential}"))?;
    authorization.set_sensitive(true);
    request.headers_mut().insert(AUTHORIZATION, authorization);

    Ok(request)
}

/// Opens the upstream WebSocket. No retries.
pub async fn connect(
    target: &str,
    credential: &str,
    connect_timeout: Option<Duration>,
) -> Result<UpstreamStream, UpstreamError> {
    let request = build_request(target, credential)?;

    debug!(target_uri = %request.uri(), "Opening upstream connection");
    let handshake = connect_async(request);
    let (stream, response) = match connect_timeout {
        Some(limit) => tokio::time::timeout(limit, handshake)
            .await
            .map_err(|_| UpstreamError::Timeout(limit))?,
        None => handshake.await,
    }
    .map_err(UpstreamError::Handshake)?;

    debug!(status = %response.status(), "Upstream handshake complete");
    Ok(stream)
}
