//! Upstream query forwarding.
//!
//! Each forward gets its own ephemeral socket, connected to the
//! upstream so the kernel filters stray sources, and waits for exactly
//! one reply under a timeout. Sockets are request-scoped: every exit
//! path (success, timeout, error) releases them, and a semaphore bounds
//! how many can be open at once.

use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::sync::Semaphore;

use crate::dns::response_id;

/// Maximum size of a DNS packet (with some headroom).
pub const MAX_DNS_PACKET_SIZE: usize = 4096;

/// Why a forward attempt produced no relayable response.
#[derive(Debug, Error)]
pub enum ForwardError {
    #[error("upstream did not answer within the timeout")]
    Timeout,

    #[error("upstream I/O failed: {0}")]
    Io(#[from] io::Error),

    #[error("response id {got:#06x} does not match query id {want:#06x}")]
    IdMismatch { want: u16, got: u16 },

    #[error("query too short to carry a transaction id")]
    ShortQuery,

    #[error("forwarder is shut down")]
    Closed,
}

/// Relays raw queries to the configured upstream resolver.
pub struct Forwarder {
    upstream: SocketAddr,
    timeout: Duration,
    permits: Semaphore,
}

impl Forwarder {
    /// Create a forwarder.
    ///
    /// `max_in_flight` bounds the number of concurrently open upstream
    /// sockets.
    pub fn new(upstream: SocketAddr, timeout: Duration, max_in_flight: usize) -> Self {
        Self {
            upstream,
            timeout,
            permits: Semaphore::new(max_in_flight),
        }
    }

    /// Send a raw query upstream and wait for one reply.
    ///
    /// The reply's transaction id is verified against the query before
    /// it is handed back for relay. Timeouts and network failures come
    /// back as errors rather than hanging or panicking; the caller
    /// turns them into a synthesized failure response.
    pub async fn forward(&self, query: &[u8]) -> Result<Vec<u8>, ForwardError> {
        let want = response_id(query).ok_or(ForwardError::ShortQuery)?;

        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| ForwardError::Closed)?;

        let bind_addr = if self.upstream.is_ipv6() {
            SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0))
        } else {
            SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0))
        };

        let socket = UdpSocket::bind(bind_addr).await?;
        socket.connect(self.upstream).await?;
        socket.send(query).await?;

        let mut buf = [0u8; MAX_DNS_PACKET_SIZE];
        let len = tokio::time::timeout(self.timeout, socket.recv(&mut buf))
            .await
            .map_err(|_| ForwardError::Timeout)??;

        match response_id(&buf[..len]) {
            Some(got) if got == want => Ok(buf[..len].to_vec()),
            Some(got) => Err(ForwardError::IdMismatch { want, got }),
            None => Err(ForwardError::IdMismatch { want, got: 0 }),
        }
    }
}
