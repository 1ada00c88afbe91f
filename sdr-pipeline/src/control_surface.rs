//! External Control Surface (C8, §4.7): a single UDP listener that accepts big-endian `u32` Hz
//! retune targets and marshals them onto a [`ControllerHandle`].
//!
//! Grounding note: this mirrors the accept-loop shape of the Device Adapter's own `rtl_tcp`
//! server (`rtlsdr_async::rtl_tcp::server::RtlTcpServer::serve`) — a `tokio::select!` between a
//! `CancellationToken` and the next inbound item — generalized from "accept a TCP connection" to
//! "receive one UDP datagram", since the control surface has no per-client state to hand off.

use std::net::SocketAddr;

use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;

use crate::controller::ControllerHandle;

const DATAGRAM_LEN: usize = 4;

/// Runs the UDP External Control Surface until `shutdown` is cancelled. Malformed datagrams
/// (anything other than exactly 4 bytes) are logged and dropped; the listener itself never exits
/// on a bad datagram.
pub async fn serve(
    bind_addr: SocketAddr,
    handle: ControllerHandle,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    let socket = UdpSocket::bind(bind_addr).await?;
    tracing::info!(%bind_addr, "external control surface listening");

    let mut buf = [0u8; 1024];
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            result = socket.recv_from(&mut buf) => {
                let (len, peer) = result?;
                handle_datagram(&buf[..len], peer, &handle);
            }
        }
    }

    tracing::debug!("external control surface shutting down");
    Ok(())
}

fn handle_datagram(datagram: &[u8], peer: SocketAddr, handle: &ControllerHandle) {
    if datagram.len() != DATAGRAM_LEN {
        tracing::warn!(%peer, len = datagram.len(), "dropping malformed control datagram");
        return;
    }
    let freq_hz = u32::from_be_bytes([datagram[0], datagram[1], datagram[2], datagram[3]]);
    tracing::debug!(%peer, freq_hz, "external retune request");
    handle.enqueue_retune(freq_hz);
}

#[cfg(test)]
mod tests {
    #[test]
    fn decodes_big_endian_frequency() {
        let datagram = 162_475_000u32.to_be_bytes();
        let decoded = u32::from_be_bytes(datagram);
        assert_eq!(decoded, 162_475_000);
    }
}
