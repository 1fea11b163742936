use btc_peergroup::*;
use clap::Parser;
use std::{error::Error, net::ToSocketAddrs, sync::Arc, time::Duration};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(version, about = "Btc peer group: connect and handshake with bitcoin nodes", long_about = None)]
struct Cli {
    /// The Bitcoin DNS seed, used for peer discovery.
    #[arg(long, short, default_value_t = DEFAULT_DNS_SEED.to_string())]
    dns_seed: String,

    /// Optionally provide a port other than mainnet's default.
    #[arg(long, short, value_parser = clap::value_parser!(u16).range(1..), default_value_t = MAIN_NET_PORT)]
    port: u16,

    /// Outputs the version of the currently supported bitcoin p2p network protocol.
    #[arg(long, short)]
    btc_proto: bool,

    /// How many of the resolved addresses to connect to.
    #[arg(long, default_value_t = 4)]
    peers: usize,

    /// Multiplex every connection on one event loop instead of a thread each.
    #[arg(long)]
    nio: bool,

    /// Keep-alive ping interval, 0 disables pings.
    #[arg(long, default_value_t = 0)]
    ping_interval_secs: u64,

    #[arg(long, default_value_t = 10)]
    handshake_timeout_secs: u64,
}

fn main() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();
    if cli.btc_proto {
        println!(
            "This implementation supports the p2p network protocol {}.",
            BTC_PROTO_VERSION
        );
        return Ok(());
    }
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let dns = format!("{}:{}", cli.dns_seed, cli.port);
    tracing::info!("Attempting to resolve DNS: {:?}", dns);
    let addresses: Vec<_> = dns.to_socket_addrs()?.take(cli.peers).collect();
    if addresses.is_empty() {
        return Err(format!("{dns} resolved to no addresses").into());
    }
    tracing::debug!("addresses {:?}", addresses);

    let params = if cli.port == TEST_NET_PORT {
        ProtocolConfig::testnet()
    } else {
        ProtocolConfig::mainnet()
    };
    let config = PeerGroupConfig::default()
        .with_ping_interval(Duration::from_secs(cli.ping_interval_secs))
        .with_handshake_timeout(Duration::from_secs(cli.handshake_timeout_secs));
    let kind = if cli.nio {
        TransportKind::NonBlocking
    } else {
        TransportKind::Blocking
    };
    let group = PeerGroup::with_transport_kind(params, Arc::new(0_i32), kind, config)?;

    let pending: Vec<_> = addresses
        .iter()
        .filter_map(|addr| match group.connect_to(*addr) {
            Ok(pending) => Some(pending),
            Err(e) => {
                tracing::error!(addr = %addr, error = %e, "Could not connect");
                None
            }
        })
        .collect();

    for connection in &pending {
        let addr = connection.peer().remote_addr();
        match connection.wait() {
            Ok(peer) => {
                let remote = peer.remote_version();
                tracing::info!(
                    addr = %addr,
                    version = ?peer.negotiated_version(),
                    user_agent = ?remote.as_ref().map(|v| v.user_agent.as_str()),
                    height = ?remote.as_ref().map(|v| v.start_height),
                    "Handshake completed"
                );
            }
            Err(e) => tracing::warn!(addr = %addr, error = %e, "Handshake failed"),
        }
    }
    tracing::info!(
        ready = group.ready_peers().len(),
        attempted = pending.len(),
        "Done"
    );

    group.shutdown();
    Ok(())
}
