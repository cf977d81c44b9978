use anyhow::{Context, Result};
use std::{
    net::SocketAddr,
    sync::{Arc, Mutex},
};
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tokio_tungstenite::{
    accept_hdr_async,
    tungstenite::handshake::server::{ErrorResponse, Request, Response},
};
use tracing::{debug, error, info, warn};

use crate::config::{Config, RelayConfig};
use crate::security::{is_trusted_proxy, parse_original_client_ip};
use crate::session::Session;
use crate::stream::ClientStream;
use crate::tls::load_tls_acceptor;

/// Accepts client connections and runs one [`Session`] per connection.
///
/// Sessions share nothing but the read-only relay limits.
pub struct Listener {
    tcp: TcpListener,
    tls: Option<TlsAcceptor>,
    trusted_proxies: Option<Arc<[String]>>,
    relay: Arc<RelayConfig>,
}

impl Listener {
    #[must_use]
    pub fn new(tcp: TcpListener, relay: RelayConfig) -> Self {
        Self {
            tcp,
            tls: None,
            trusted_proxies: None,
            relay: Arc::new(relay),
        }
    }

    /// Binds the configured address and loads TLS material if configured.
    pub async fn bind(config: Config) -> Result<Self> {
        let addr = config.listen_addr();
        let tcp = TcpListener::bind(&addr)
            .await
            .with_context(|| format!("Failed to bind to address {addr}"))?;

        let tls = config
            .listen
            .tls
            .as_ref()
            .map(load_tls_acceptor)
            .transpose()?;

        let mut listener = Self::new(tcp, config.relay);
        listener.tls = tls;
        listener.trusted_proxies = config.listen.allowed_proxy_ips.map(Arc::from);
        Ok(listener)
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.tcp
            .local_addr()
            .context("Failed to get listener local address")
    }

    #[must_use]
    pub const fn is_tls(&self) -> bool {
        self.tls.is_some()
    }

    /// Accept loop. Only returns if accepting itself fails.
    pub async fn run(self) -> Result<()> {
        loop {
            let (tcp_stream, peer_addr) = self
                .tcp
                .accept()
                .await
                .context("Failed to accept connection")?;

            let tls = self.tls.clone();
            let relay = Arc::clone(&self.relay);
            let trust_forwarded =
                match is_trusted_proxy(peer_addr.ip(), self.trusted_proxies.as_deref()) {
                    Ok(trusted) => trusted,
                    Err(e) => {
                        warn!(peer_addr = %peer_addr, error = %e, "Ignoring X-Forwarded-For");
                        false
                    }
                };

            tokio::spawn(async move {
                let stream = match tls {
                    Some(acceptor) => match acceptor.accept(tcp_stream).await {
                        Ok(tls_stream) => ClientStream::Tls(Box::new(tls_stream)),
                        Err(e) => {
                            debug!(peer_addr = %peer_addr, error = %e, "TLS handshake failed");
                            return;
                        }
                    },
                    None => ClientStream::Plain(tcp_stream),
                };

                if let Err(e) = handle_connection(stream, relay, trust_forwarded).await {
                    error!(peer_addr = %peer_addr, error = %e, "Connection failed");
                }
            });
        }
    }
}

/// Upgrades one client socket to WebSocket and runs its session to completion.
#[tracing::instrument(skip_all, fields(peer_addr = %stream.peer_addr().map_or_else(|_| "unknown".to_string(), |a| a.to_string())))]
pub async fn handle_connection(
    stream: ClientStream,
    relay: Arc<RelayConfig>,
    trust_forwarded: bool,
) -> Result<()> {
    let tls = stream.is_tls();
    let forwarded_for = Arc::new(Mutex::new(None::<String>));
    let forwarded_for_clone = Arc::clone(&forwarded_for);

    let callback = move |req: &Request, response: Response| -> Result<Response, ErrorResponse> {
        if trust_forwarded {
            let original_ip = req
                .headers()
                .get("x-forwarded-for")
                .and_then(|xff| xff.to_str().ok())
                .and_then(parse_original_client_ip);
            if let Ok(mut guard) = forwarded_for_clone.lock() {
                *guard = original_ip;
            }
        }
        Ok(response)
    };

    let websocket = accept_hdr_async(stream, callback)
        .await
        .context("Failed to perform WebSocket handshake")?;

    let client_ip = forwarded_for.lock().ok().and_then(|guard| guard.clone());
    let session = Session::new(websocket, relay);
    let session_id = session.id();

    match &client_ip {
        Some(ip) => info!(%session_id, client_ip = %ip, tls, "Session started"),
        None => info!(%session_id, tls, "Session started"),
    }

    let termination = session.run().await;
    if termination.is_error() {
        warn!(%session_id, %termination, "Session ended");
    } else {
        info!(%session_id, %termination, "Session ended");
    }
    Ok(())
}
