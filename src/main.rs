use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::watch;
use tracing::info;

use dnsgate::dns::FailureMode;
use dnsgate::policy::{PolicyRules, PolicyStore};
use dnsgate::server::{DEFAULT_UPSTREAM, Server, ServerConfig};

#[derive(Parser)]
#[command(name = "dnsgate")]
#[command(about = "Filtering DNS interceptor", long_about = None)]
struct Args {
    /// Local port to listen on
    #[arg(short, long, default_value = "53")]
    port: u16,

    /// Bind address
    #[arg(short, long, default_value = "0.0.0.0")]
    bind: String,

    /// Upstream DNS server (host:port)
    #[arg(short, long, default_value = DEFAULT_UPSTREAM)]
    upstream: String,

    /// Upstream reply timeout in milliseconds
    #[arg(long, default_value = "2000")]
    upstream_timeout_ms: u64,

    /// Address returned for blocked domains
    #[arg(long, default_value = "0.0.0.0")]
    sinkhole: Ipv4Addr,

    /// TTL of sinkhole answers in seconds
    #[arg(long, default_value = "30")]
    sinkhole_ttl: u32,

    /// What to answer when the upstream fails
    #[arg(long, value_parser = ["servfail", "empty"], default_value = "servfail")]
    on_upstream_failure: String,

    /// Source address admitted to query (repeatable). When no address
    /// is given, the requester restriction is disabled entirely.
    #[arg(long = "allow")]
    allowed: Vec<IpAddr>,

    /// Domain pattern to block (exact or *.suffix, repeatable). Seeds
    /// the "default" category of the initial policy.
    #[arg(long = "block")]
    blocked: Vec<String>,

    /// Bound on concurrently open upstream sockets
    #[arg(long, default_value = "128")]
    max_in_flight: usize,
}

fn initial_rules(args: &Args) -> PolicyRules {
    let mut rules = PolicyRules::default();
    if !args.blocked.is_empty() {
        rules
            .blocked_domains
            .insert("default".to_string(), args.blocked.clone());
        rules.subcategory_enabled.insert("default".to_string(), true);
    }
    rules.allowed_requesters.extend(args.allowed.iter().copied());
    rules
}

async fn run(args: Args) -> Result<()> {
    let bind_addr: SocketAddr = format!("{}:{}", args.bind, args.port)
        .parse()
        .context("invalid bind address")?;
    let upstream: SocketAddr = args.upstream.parse().context("invalid upstream address")?;

    let store = Arc::new(
        PolicyStore::from_rules(&initial_rules(&args)).context("invalid initial policy")?,
    );

    let mut config = ServerConfig::new(bind_addr, upstream);
    config.upstream_timeout = Duration::from_millis(args.upstream_timeout_ms);
    config.sinkhole_address = args.sinkhole;
    config.sinkhole_ttl = args.sinkhole_ttl;
    config.failure_mode = match args.on_upstream_failure.as_str() {
        "empty" => FailureMode::Empty,
        _ => FailureMode::ServFail,
    };
    config.restrict_requesters = !args.allowed.is_empty();
    config.max_in_flight = args.max_in_flight;

    info!("forwarding to upstream {upstream}");
    info!(
        "initial policy: {} patterns, {} allowed requesters",
        store.snapshot().pattern_count(),
        args.allowed.len()
    );
    if !config.restrict_requesters {
        info!("no --allow given, requester restriction disabled");
    }

    let server = Server::bind(config, store).await.context("bind failed")?;

    let (shutdown_tx, shutdown_rx) = watch::channel(());
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("ctrl-c received, shutting down");
            let _ = shutdown_tx.send(());
        }
    });

    server.run(shutdown_rx).await.context("server failed")
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let args = Args::parse();
    run(args).await
}
