use anyhow::Result;
use speech_relay::{Listener, load_config};
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let config = load_config()?;
    info!(
        listen_ip = %config.listen.ip,
        listen_port = config.listen.port,
        tls = config.listen.tls.is_some(),
        trusted_proxies = config.listen.allowed_proxy_ips.as_ref().map_or(0, Vec::len),
        connect_timeout_ms = config.relay.connect_timeout_ms,
        max_pending_frames = config.relay.max_pending_frames,
        "Configuration loaded"
    );

    let listener = Listener::bind(config).await?;
    let scheme = if listener.is_tls() { "wss" } else { "ws" };
    info!(
        listen_addr = %listener.local_addr()?,
        scheme,
        "Speech relay listening"
    );

    listener.run().await
}
