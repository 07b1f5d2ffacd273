//! QUIC endpoint setup for the secondary transport.

use std::net::SocketAddr;

use rand::Rng;
use tracing::{debug, info};

use common::{Error, Result};

use crate::tls::{self, EphemeralCert};

/// Bottom of the listener port range. Sits in the mosh UDP neighbourhood so
/// firewall rules that admit mosh typically admit the tunnel too.
pub const UDP_PORT_START: u16 = 60000;

/// Top of the listener port range (inclusive).
pub const UDP_PORT_END: u16 = 61000;

/// Maximum time to wait for the secondary dial to complete.
pub const DIAL_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(5);

/// How many random ports to try before giving up on the listener.
const BIND_ATTEMPTS: u32 = 64;

/// Bind the slave's QUIC listener on a random port in the configured range,
/// retrying until one binds. Returns the endpoint and the bound port.
pub fn bind_listener(cert: &EphemeralCert) -> Result<(quinn::Endpoint, u16)> {
    for _ in 0..BIND_ATTEMPTS {
        let server_config = tls::server_config(cert)?;
        let port = rand::thread_rng().gen_range(UDP_PORT_START..=UDP_PORT_END);
        let addr = SocketAddr::from(([0, 0, 0, 0], port));
        match quinn::Endpoint::server(server_config, addr) {
            Ok(endpoint) => {
                info!(port, "QUIC listener started");
                return Ok((endpoint, port));
            }
            Err(e) => {
                debug!(port, %e, "failed to bind QUIC port, retrying");
            }
        }
    }

    Err(Error::Transport(format!(
        "no free QUIC port in {UDP_PORT_START}..={UDP_PORT_END} after {BIND_ATTEMPTS} attempts"
    )))
}

/// Dial a slave's advertised QUIC listener, pinning its certificate.
///
/// The returned endpoint must be kept alive for the lifetime of the
/// connection; the caller hands both to the multiplexer.
pub async fn dial(
    host: &str,
    port: u16,
    fingerprint: &str,
) -> Result<(quinn::Endpoint, quinn::Connection)> {
    let client_config = tls::client_config(fingerprint)?;

    let addr = tokio::net::lookup_host((host, port))
        .await
        .map_err(|e| Error::Transport(format!("failed to resolve '{host}:{port}': {e}")))?
        .next()
        .ok_or_else(|| Error::Transport(format!("no addresses found for '{host}:{port}'")))?;

    let bind: SocketAddr = if addr.is_ipv4() {
        ([0, 0, 0, 0], 0).into()
    } else {
        (std::net::Ipv6Addr::UNSPECIFIED, 0).into()
    };
    let mut endpoint = quinn::Endpoint::client(bind)
        .map_err(|e| Error::Transport(format!("failed to create QUIC endpoint: {e}")))?;
    endpoint.set_default_client_config(client_config);

    let connecting = endpoint
        .connect(addr, "mpf")
        .map_err(|e| Error::Transport(format!("QUIC connect failed: {e}")))?;

    let conn = tokio::time::timeout(DIAL_TIMEOUT, connecting)
        .await
        .map_err(|_| Error::Transport(format!("QUIC dial to {addr} timed out")))?
        .map_err(|e| Error::Transport(format!("QUIC dial to {addr} failed: {e}")))?;

    debug!(%addr, "QUIC connection established");
    Ok((endpoint, conn))
}
