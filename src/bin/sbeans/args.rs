use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::str::FromStr;

use clap::Parser;
use scattered_beans::types::id::NodeId;

/// A peer declaration: `<node-id>@<host:port>`, pointing at the peer's
/// cluster bus.
#[derive(Clone, Debug)]
pub(crate) struct Peer {
    pub(crate) id: NodeId,
    pub(crate) addr: SocketAddr,
}

impl FromStr for Peer {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (id, addr) = s
            .split_once('@')
            .ok_or("expected <node-id>@<host:port>".to_owned())?;

        Ok(Peer {
            id: id.parse().map_err(|e| format!("{e}"))?,
            addr: addr.parse().map_err(|e| format!("{e}"))?,
        })
    }
}

#[derive(Parser, Debug)]
#[command(about, long_about = None, version)]
pub(crate) struct Args {
    /// Address to listen on.
    #[arg(short, long, default_value_t = IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0)))]
    pub(crate) listen: IpAddr,
    /// (TCP) port to listen on for clients.
    #[arg(short, long, default_value_t = 7711)]
    pub(crate) port: u16,
    /// (TCP) port for the cluster bus. Defaults to the client port + 10000.
    #[arg(long)]
    pub(crate) cluster_port: Option<u16>,
    /// This node's 40-character hex identity. Minted fresh if omitted.
    #[arg(short, long)]
    pub(crate) node_id: Option<NodeId>,
    /// A cluster peer, as <node-id>@<host:port> of its bus. Repeatable.
    #[arg(long = "peer")]
    pub(crate) peers: Vec<Peer>,
    /// Sets the maximum allowed job size.
    #[arg(short = 'z', long, default_value_t = 65535)]
    pub(crate) max_job_size: u32,
    /// Enables human-friendly logging.
    #[arg(short, long, default_value_t)]
    pub(crate) debug: bool,
}
