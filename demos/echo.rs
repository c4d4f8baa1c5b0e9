use std::net::SocketAddr;
use std::time::Duration;
use clap::Parser;
use clap_derive::Parser;
use tracing::{info, warn, Level};
use ackpeer::config::PeerConfig;
use ackpeer::peer::Peer;
use ackpeer::peer_events::{Channel, PeerEvent};
use ackpeer::socket::UdpDatagramSocket;

/// Echo server and client: the server echoes every message on the channel it arrived on, the
///  client sends a number of messages on each channel and exits when all reliable echoes are back
#[derive(Parser)]
struct Args {
    /// address to listen on (server) or to connect to (client)
    addr: String,

    #[clap(long, default_value_t = false)]
    client: bool,

    #[clap(long, default_value = "ackpeer-echo")]
    key: String,

    #[clap(long, default_value_t = 10)]
    num_messages: usize,

    #[clap(short, long, default_value_t = false)]
    verbose: bool,

    #[clap(long, default_value_t = false)]
    very_verbose: bool,
}

const TICK: Duration = Duration::from_millis(10);

#[tokio::main]
pub async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let level = match (args.verbose, args.very_verbose) {
        (_, true) => Level::TRACE,
        (true, _) => Level::DEBUG,
        (false, false) => Level::INFO,
    };

    tracing_subscriber::fmt()
        .with_max_level(level)
        .try_init()
        .ok();

    let addr: SocketAddr = args.addr.parse()?;
    let mut peer = Peer::new(PeerConfig::new(args.key.as_bytes()), Box::new(UdpDatagramSocket::new()))?;

    if args.client {
        peer.connect(addr)?;
        run_client(peer, args.num_messages).await;
    }
    else {
        peer.bind(addr)?;
        run_server(peer).await;
    }
    Ok(())
}

async fn run_server(mut peer: Peer) {
    peer.run(TICK, |peer, event| {
        match event {
            PeerEvent::Message { addr, channel, payload } => {
                let result = match channel {
                    Channel::Unreliable => peer.send_unreliable(addr, &payload),
                    Channel::Notify => peer.send_notify(addr, &payload).map(|_| ()),
                    Channel::Reliable => peer.send_reliable(addr, &payload),
                };
                if let Err(e) = result {
                    warn!("error echoing to {:?}: {}", addr, e);
                }
            }
            other => info!("{:?}", other),
        }
    }).await;
}

async fn run_client(mut peer: Peer, num_messages: usize) {
    let mut num_reliable_echoes = 0;

    peer.run(TICK, |peer, event| {
        match event {
            PeerEvent::Connected(addr) => {
                info!("connected to {:?} - sending {} messages per channel", addr, num_messages);
                for i in 0..num_messages {
                    let msg = format!("message #{}", i);
                    let result = peer.send_unreliable(addr, msg.as_bytes())
                        .and_then(|_| peer.send_notify(addr, msg.as_bytes()))
                        .and_then(|_| peer.send_reliable(addr, msg.as_bytes()));
                    if let Err(e) = result {
                        warn!("error sending: {}", e);
                    }
                }
            }
            PeerEvent::Message { addr, channel, payload } => {
                info!("echo on {:?}: {}", channel, String::from_utf8_lossy(&payload));
                if channel == Channel::Reliable {
                    num_reliable_echoes += 1;
                    if num_reliable_echoes == num_messages {
                        if let Some(connection) = peer.connection(addr) {
                            let metrics = connection.metrics();
                            info!("all echoes received - rtt {:?}, jitter {:?}, {} resends",
                                metrics.rtt(), metrics.jitter(), metrics.reliable_resends);
                        }
                        peer.close();
                    }
                }
            }
            PeerEvent::ConnectionFailed { addr, reason } => {
                warn!("could not connect to {:?}: {:?}", addr, reason);
                peer.close();
            }
            PeerEvent::Disconnected { addr, reason } => {
                warn!("disconnected from {:?}: {:?}", addr, reason);
                peer.close();
            }
            other => info!("{:?}", other),
        }
    }).await;
}
