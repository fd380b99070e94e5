//! UDP dispatch loop.
//!
//! Binds the listening socket and runs a single receive loop. Each
//! inbound datagram is handed to its own task so one slow upstream
//! lookup never delays subsequent queries; the only state those tasks
//! share is the policy snapshot reference. Shutdown stops the loop,
//! gives in-flight requests a bounded grace period, then aborts
//! whatever is left.

use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::dns::FailureMode;
use crate::forward::{Forwarder, MAX_DNS_PACKET_SIZE};
use crate::policy::PolicyStore;
use crate::resolver::{QueryAction, Resolver};
use crate::stats::Stats;

/// Default listening port for DNS.
pub const DEFAULT_PORT: u16 = 53;
/// Default upstream resolver.
pub const DEFAULT_UPSTREAM: &str = "8.8.8.8:53";

const STATS_INTERVAL: Duration = Duration::from_secs(60);

/// Configuration for the DNS interceptor.
pub struct ServerConfig {
    /// Local address to bind (e.g., 0.0.0.0:53).
    pub bind_addr: SocketAddr,
    /// Upstream DNS server address.
    pub upstream: SocketAddr,
    /// How long to wait for an upstream reply before synthesizing a
    /// failure response.
    pub upstream_timeout: Duration,
    /// Address returned in sinkhole answers.
    pub sinkhole_address: Ipv4Addr,
    /// TTL of sinkhole answers, in seconds.
    pub sinkhole_ttl: u32,
    /// What to send when the upstream fails or times out.
    pub failure_mode: FailureMode,
    /// Whether to enforce the requester allow-list.
    pub restrict_requesters: bool,
    /// Bound on concurrently open upstream sockets.
    pub max_in_flight: usize,
    /// Grace period for in-flight requests during shutdown.
    pub shutdown_grace: Duration,
}

impl ServerConfig {
    /// Config with spec defaults for everything but the addresses.
    pub fn new(bind_addr: SocketAddr, upstream: SocketAddr) -> Self {
        Self {
            bind_addr,
            upstream,
            upstream_timeout: Duration::from_secs(2),
            sinkhole_address: Ipv4Addr::UNSPECIFIED,
            sinkhole_ttl: 30,
            failure_mode: FailureMode::ServFail,
            restrict_requesters: true,
            max_in_flight: 128,
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

/// The DNS interceptor server.
pub struct Server {
    socket: Arc<UdpSocket>,
    resolver: Arc<Resolver>,
    forwarder: Arc<Forwarder>,
    stats: Arc<Stats>,
    failure_mode: FailureMode,
    shutdown_grace: Duration,
}

impl Server {
    /// Bind the listening socket and assemble the pipeline.
    pub async fn bind(config: ServerConfig, store: Arc<PolicyStore>) -> io::Result<Self> {
        let socket = Arc::new(UdpSocket::bind(config.bind_addr).await?);

        let resolver = Arc::new(Resolver::new(
            store,
            config.sinkhole_address,
            config.sinkhole_ttl,
            config.restrict_requesters,
        ));
        let forwarder = Arc::new(Forwarder::new(
            config.upstream,
            config.upstream_timeout,
            config.max_in_flight,
        ));

        Ok(Self {
            socket,
            resolver,
            forwarder,
            stats: Arc::new(Stats::new()),
            failure_mode: config.failure_mode,
            shutdown_grace: config.shutdown_grace,
        })
    }

    /// The address the listening socket actually bound.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Shared statistics handle.
    pub fn stats(&self) -> Arc<Stats> {
        Arc::clone(&self.stats)
    }

    /// Run the receive loop until the shutdown signal fires.
    ///
    /// The loop itself never blocks on request processing: every
    /// datagram is dispatched to its own task. On shutdown, no new
    /// datagrams are accepted; in-flight requests get the configured
    /// grace period before being aborted.
    pub async fn run(self, mut shutdown: watch::Receiver<()>) -> io::Result<()> {
        info!("listening on {}", self.socket.local_addr()?);

        let stats_logger = spawn_stats_logger(Arc::clone(&self.stats));
        let mut tasks = JoinSet::new();
        let mut buf = [0u8; MAX_DNS_PACKET_SIZE];

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                result = self.socket.recv_from(&mut buf) => {
                    let (len, src) = match result {
                        Ok(r) => r,
                        Err(e) => {
                            warn!("recv error: {e}");
                            continue;
                        }
                    };

                    tasks.spawn(handle_datagram(RequestContext {
                        socket: Arc::clone(&self.socket),
                        resolver: Arc::clone(&self.resolver),
                        forwarder: Arc::clone(&self.forwarder),
                        stats: Arc::clone(&self.stats),
                        failure_mode: self.failure_mode,
                        datagram: buf[..len].to_vec(),
                        src,
                    }));

                    // Reap whatever already finished so the set does
                    // not grow unbounded under sustained load.
                    while tasks.try_join_next().is_some() {}
                }
            }
        }

        stats_logger.abort();

        if !tasks.is_empty() {
            info!("draining {} in-flight requests", tasks.len());
            let drained = tokio::time::timeout(self.shutdown_grace, async {
                while tasks.join_next().await.is_some() {}
            })
            .await;
            if drained.is_err() {
                warn!("grace period elapsed, aborting {} requests", tasks.len());
                tasks.shutdown().await;
            }
        }

        info!("shutdown complete");
        Ok(())
    }
}

struct RequestContext {
    socket: Arc<UdpSocket>,
    resolver: Arc<Resolver>,
    forwarder: Arc<Forwarder>,
    stats: Arc<Stats>,
    failure_mode: FailureMode,
    datagram: Vec<u8>,
    src: SocketAddr,
}

/// Process one inbound datagram to a terminal state.
///
/// Failures here are isolated to this request; the receive loop keeps
/// serving others regardless of what happens to this one.
async fn handle_datagram(ctx: RequestContext) {
    let start = Instant::now();

    match ctx.resolver.process_query(&ctx.datagram, ctx.src.ip()) {
        QueryAction::Drop(reason) => {
            ctx.stats.record_dropped();
            debug!(src = %ctx.src, ?reason, "dropped");
        }
        QueryAction::Sinkhole { response, domain } => {
            if let Err(e) = ctx.socket.send_to(&response, ctx.src).await {
                warn!("send error: {e}");
            }
            let elapsed = elapsed_ms(start);
            ctx.stats.record_blocked(elapsed);
            debug!(%domain, elapsed_ms = elapsed, "blocked");
        }
        QueryAction::Forward(query) => match ctx.forwarder.forward(query.raw()).await {
            Ok(reply) => {
                if let Err(e) = ctx.socket.send_to(&reply, ctx.src).await {
                    warn!("send error: {e}");
                }
                let elapsed = elapsed_ms(start);
                ctx.stats.record_forwarded(elapsed);
                debug!(domain = %query.domain, elapsed_ms = elapsed, "forwarded");
            }
            Err(err) => {
                warn!(domain = %query.domain, %err, "upstream failed");
                let fallback = query.failure_response(ctx.failure_mode);
                if let Err(e) = ctx.socket.send_to(&fallback, ctx.src).await {
                    warn!("send error: {e}");
                }
                ctx.stats.record_failed(elapsed_ms(start));
            }
        },
    }
}

fn elapsed_ms(start: Instant) -> f64 {
    start.elapsed().as_secs_f64() * 1000.0
}

/// Log a stats line every minute.
fn spawn_stats_logger(stats: Arc<Stats>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(STATS_INTERVAL);
        interval.tick().await; // Skip first immediate tick
        loop {
            interval.tick().await;
            let snap = stats.snapshot_and_reset();
            info!(
                "[stats] requests={} forwarded={} blocked={} failed={} dropped={} avg_response={:.2}ms",
                snap.requests, snap.forwarded, snap.blocked, snap.failed, snap.dropped,
                snap.avg_response_ms
            );
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::IpAddr;

    use crate::dns::{TYPE_A, tests::build_query};
    use crate::policy::PolicyRules;

    const TYPE_AAAA: u16 = 28;

    fn test_rules(allow_loopback: bool) -> PolicyRules {
        let mut rules = PolicyRules::default();
        rules
            .blocked_domains
            .insert("ads".to_string(), vec!["google.com".to_string()]);
        rules.subcategory_enabled.insert("ads".to_string(), true);
        if allow_loopback {
            rules
                .allowed_requesters
                .insert(IpAddr::from([127, 0, 0, 1]));
        }
        rules
    }

    /// Spawn a server on an ephemeral loopback port.
    async fn spawn_server(
        rules: &PolicyRules,
        upstream: SocketAddr,
        tweak: impl FnOnce(&mut ServerConfig),
    ) -> (SocketAddr, watch::Sender<()>, tokio::task::JoinHandle<io::Result<()>>) {
        let bind: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let mut config = ServerConfig::new(bind, upstream);
        config.upstream_timeout = Duration::from_millis(250);
        tweak(&mut config);

        let store = Arc::new(PolicyStore::from_rules(rules).unwrap());
        let server = Server::bind(config, store).await.unwrap();
        let addr = server.local_addr().unwrap();

        let (tx, rx) = watch::channel(());
        let handle = tokio::spawn(server.run(rx));
        (addr, tx, handle)
    }

    /// A loopback upstream answering every query with one A record.
    async fn answering_upstream() -> SocketAddr {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; MAX_DNS_PACKET_SIZE];
            loop {
                let Ok((len, src)) = socket.recv_from(&mut buf).await else {
                    return;
                };
                let mut reply = buf[..len].to_vec();
                reply[2] = 0x81;
                reply[3] = 0x80;
                reply[7] = 0x01; // one answer
                reply.extend_from_slice(&[0xC0, 0x0C]);
                reply.extend_from_slice(&TYPE_A.to_be_bytes());
                reply.extend_from_slice(&1u16.to_be_bytes());
                reply.extend_from_slice(&60u32.to_be_bytes());
                reply.extend_from_slice(&4u16.to_be_bytes());
                reply.extend_from_slice(&[93, 184, 216, 34]);
                let _ = socket.send_to(&reply, src).await;
            }
        });
        addr
    }

    /// An upstream that swallows every query.
    async fn silent_upstream() -> SocketAddr {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; MAX_DNS_PACKET_SIZE];
            loop {
                if socket.recv_from(&mut buf).await.is_err() {
                    return;
                }
            }
        });
        addr
    }

    async fn query(server: SocketAddr, datagram: &[u8]) -> Vec<u8> {
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.send_to(datagram, server).await.unwrap();
        let mut buf = [0u8; MAX_DNS_PACKET_SIZE];
        let (len, _) = tokio::time::timeout(Duration::from_secs(2), client.recv_from(&mut buf))
            .await
            .expect("no response from server")
            .unwrap();
        buf[..len].to_vec()
    }

    #[tokio::test]
    async fn blocked_query_gets_sinkhole_answer() {
        let upstream = answering_upstream().await;
        let (addr, _tx, _handle) = spawn_server(&test_rules(true), upstream, |_| {}).await;

        let raw = build_query(0x5151, "google.com", TYPE_A);
        let resp = query(addr, &raw).await;

        assert_eq!(u16::from_be_bytes([resp[0], resp[1]]), 0x5151);
        assert_eq!(u16::from_be_bytes([resp[6], resp[7]]), 1);
        // TTL 30 and 0.0.0.0 in the trailing answer record.
        let tail = &resp[resp.len() - 10..];
        assert_eq!(
            u32::from_be_bytes([tail[0], tail[1], tail[2], tail[3]]),
            30
        );
        assert_eq!(&tail[6..], &[0, 0, 0, 0]);
    }

    #[tokio::test]
    async fn unblocked_query_is_relayed_with_id_unchanged() {
        let upstream = answering_upstream().await;
        let (addr, _tx, _handle) = spawn_server(&test_rules(true), upstream, |_| {}).await;

        let raw = build_query(0x7777, "example.org", TYPE_A);
        let resp = query(addr, &raw).await;

        assert_eq!(u16::from_be_bytes([resp[0], resp[1]]), 0x7777);
        assert_eq!(u16::from_be_bytes([resp[6], resp[7]]), 1);
        assert_eq!(&resp[resp.len() - 4..], &[93, 184, 216, 34]);
    }

    #[tokio::test]
    async fn non_a_query_for_blocked_domain_is_forwarded() {
        let upstream = answering_upstream().await;
        let (addr, _tx, _handle) = spawn_server(&test_rules(true), upstream, |_| {}).await;

        let raw = build_query(3, "google.com", TYPE_AAAA);
        let resp = query(addr, &raw).await;

        // Relayed from the upstream, not sinkholed: upstream answer
        // carries its marker address.
        assert_eq!(&resp[resp.len() - 4..], &[93, 184, 216, 34]);
    }

    #[tokio::test]
    async fn unauthorized_requester_gets_no_reply() {
        let upstream = answering_upstream().await;
        // Empty allow-list with restriction on: nobody is admitted.
        let (addr, _tx, _handle) = spawn_server(&test_rules(false), upstream, |_| {}).await;

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let raw = build_query(1, "example.org", TYPE_A);
        client.send_to(&raw, addr).await.unwrap();

        let mut buf = [0u8; MAX_DNS_PACKET_SIZE];
        let result =
            tokio::time::timeout(Duration::from_millis(400), client.recv_from(&mut buf)).await;

        assert!(result.is_err(), "expected silence, got a packet");
    }

    #[tokio::test]
    async fn malformed_datagram_gets_no_reply() {
        let upstream = answering_upstream().await;
        let (addr, _tx, _handle) = spawn_server(&test_rules(true), upstream, |_| {}).await;

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.send_to(&[0xFF; 5], addr).await.unwrap();

        let mut buf = [0u8; MAX_DNS_PACKET_SIZE];
        let result =
            tokio::time::timeout(Duration::from_millis(400), client.recv_from(&mut buf)).await;

        assert!(result.is_err(), "expected silence, got a packet");
    }

    #[tokio::test]
    async fn silent_upstream_yields_servfail_within_bound() {
        let upstream = silent_upstream().await;
        let (addr, _tx, _handle) = spawn_server(&test_rules(true), upstream, |_| {}).await;

        let start = Instant::now();
        let raw = build_query(0x0A0A, "example.org", TYPE_A);
        let resp = query(addr, &raw).await;
        let elapsed = start.elapsed();

        assert_eq!(u16::from_be_bytes([resp[0], resp[1]]), 0x0A0A);
        assert_eq!(u16::from_be_bytes([resp[2], resp[3]]) & 0x000F, 2);
        // Timeout is 250ms; allow generous scheduling overhead.
        assert!(elapsed < Duration::from_millis(1250));
    }

    #[tokio::test]
    async fn empty_failure_mode_returns_no_error() {
        let upstream = silent_upstream().await;
        let (addr, _tx, _handle) = spawn_server(&test_rules(true), upstream, |config| {
            config.failure_mode = FailureMode::Empty;
        })
        .await;

        let raw = build_query(5, "example.org", TYPE_A);
        let resp = query(addr, &raw).await;

        assert_eq!(u16::from_be_bytes([resp[2], resp[3]]) & 0x000F, 0);
        assert_eq!(u16::from_be_bytes([resp[6], resp[7]]), 0);
    }

    #[tokio::test]
    async fn slow_lookup_does_not_delay_other_queries() {
        let slow = silent_upstream().await;
        let (addr, _tx, _handle) = spawn_server(&test_rules(true), slow, |config| {
            config.upstream_timeout = Duration::from_secs(2);
        })
        .await;

        // First query hangs on the silent upstream; a blocked query
        // sent right after must still come back immediately.
        let hanging = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        hanging
            .send_to(&build_query(1, "example.org", TYPE_A), addr)
            .await
            .unwrap();

        let start = Instant::now();
        let resp = query(addr, &build_query(2, "google.com", TYPE_A)).await;

        assert_eq!(u16::from_be_bytes([resp[0], resp[1]]), 2);
        assert!(start.elapsed() < Duration::from_millis(500));
    }

    #[tokio::test]
    async fn shutdown_signal_stops_the_loop() {
        let upstream = answering_upstream().await;
        let (_addr, tx, handle) = spawn_server(&test_rules(true), upstream, |_| {}).await;

        tx.send(()).unwrap();

        let result = tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("server did not shut down")
            .unwrap();
        assert!(result.is_ok());
    }
}
