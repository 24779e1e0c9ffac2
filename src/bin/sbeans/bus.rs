//! The cluster bus: fire-and-forget framing of cluster messages over TCP.
//!
//! Outbound traffic funnels through one dispatcher task that owns the peer
//! connections, connecting lazily and dropping a connection on any error;
//! the GC retry loop re-covers anything lost, so there is nothing to
//! recover here. Inbound connections are accepted on a dedicated port and
//! decoded frames are fed to the control task as events.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

use bytes::Bytes;
use scattered_beans::cluster::message::ClusterMessage;
use scattered_beans::cluster::Messenger;
use scattered_beans::types::id::{JobId, NodeId};
use scattered_beans::types::job::Job;
use scattered_beans::types::nodes::NodeList;
use scattered_beans::types::record;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::select;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Upper bound on an inbound frame; anything larger is a protocol error.
const MAX_FRAME_LEN: u32 = 64 << 20;

/// How long a lazy connect may take before the send is abandoned.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(1);

/// The core's [`Messenger`], encoding each message and queueing it for the
/// outbound dispatcher. Sending never blocks the control task.
pub(crate) struct BusMessenger {
    me: NodeId,
    outbound: mpsc::UnboundedSender<(NodeId, Bytes)>,
}

impl BusMessenger {
    pub(crate) fn new(
        me: NodeId,
        outbound: mpsc::UnboundedSender<(NodeId, Bytes)>,
    ) -> Self {
        Self { me, outbound }
    }

    fn push(&self, peer: &NodeId, msg: ClusterMessage) {
        // A closed channel means we're shutting down; the message is moot.
        let _ = self.outbound.send((*peer, msg.encode()));
    }
}

impl Messenger for BusMessenger {
    fn send_repljob(&mut self, peer: &NodeId, job: &Job) {
        self.push(
            peer,
            ClusterMessage::ReplJob {
                from: self.me,
                record: record::encode(job),
            },
        );
    }

    fn send_setack(
        &mut self,
        peer: &NodeId,
        id: &JobId,
        nodes: Option<&NodeList>,
    ) {
        self.push(
            peer,
            ClusterMessage::SetAck {
                from: self.me,
                id: *id,
                nodes: nodes.map(|n| n.to_vec()),
            },
        );
    }

    fn send_gotack(&mut self, peer: &NodeId, id: &JobId) {
        self.push(
            peer,
            ClusterMessage::GotAck {
                from: self.me,
                id: *id,
            },
        );
    }
}

/// Owns the outbound peer connections and drains the send queue. Reports
/// connect/send failures and recoveries as peer reachability events.
pub(crate) async fn run_outbound(
    peers: HashMap<NodeId, SocketAddr>,
    mut outbound: mpsc::UnboundedReceiver<(NodeId, Bytes)>,
    events: mpsc::Sender<crate::Event>,
    cancel: CancellationToken,
) {
    let mut conns: HashMap<NodeId, TcpStream> = HashMap::new();

    loop {
        let (peer, frame) = select! {
            m = outbound.recv() => match m {
                Some(m) => m,
                None => return,
            },
            _ = cancel.cancelled() => return,
        };

        let Some(addr) = peers.get(&peer) else {
            warn!(peer = %peer, "dropping message to unknown peer");
            continue;
        };

        if !conns.contains_key(&peer) {
            let connect =
                tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(addr));
            match connect.await {
                Ok(Ok(conn)) => {
                    let _ = conn.set_nodelay(true);
                    conns.insert(peer, conn);
                    let _ = events.send(crate::Event::PeerUp(peer)).await;
                },
                Ok(Err(error)) => {
                    debug!(peer = %peer, %error, "cluster connect failed");
                    let _ = events.send(crate::Event::PeerDown(peer)).await;
                    continue;
                },
                Err(_) => {
                    debug!(peer = %peer, "cluster connect timed out");
                    let _ = events.send(crate::Event::PeerDown(peer)).await;
                    continue;
                },
            }
        }

        // Checked or inserted just above.
        let conn = conns.get_mut(&peer).unwrap();
        if let Err(error) = write_frame(conn, &frame).await {
            debug!(peer = %peer, %error, "cluster send failed, dropping connection");
            conns.remove(&peer);
            let _ = events.send(crate::Event::PeerDown(peer)).await;
        }
    }
}

async fn write_frame(
    conn: &mut TcpStream,
    frame: &[u8],
) -> std::io::Result<()> {
    conn.write_all(&(frame.len() as u32).to_be_bytes()).await?;
    conn.write_all(frame).await
}

/// Accepts inbound bus connections until cancelled.
pub(crate) async fn run_inbound(
    listener: TcpListener,
    events: mpsc::Sender<crate::Event>,
    cancel: CancellationToken,
) {
    loop {
        let conn = match select! {
            accept = listener.accept() => accept,
            _ = cancel.cancelled() => return,
        } {
            Ok((conn, _)) => conn,
            Err(error) => {
                warn!(%error, "failed to accept bus connection");
                continue;
            },
        };

        tokio::spawn(handle_bus_conn(conn, events.clone(), cancel.clone()));
    }
}

/// Reads length-prefixed frames off one inbound connection. A frame that
/// doesn't decode poisons the connection; the peer will reconnect and the
/// retry protocol re-covers anything lost.
async fn handle_bus_conn(
    mut conn: TcpStream,
    events: mpsc::Sender<crate::Event>,
    cancel: CancellationToken,
) {
    loop {
        let msg = select! {
            f = read_frame(&mut conn) => match f {
                Ok(Some(frame)) => match ClusterMessage::decode(&frame) {
                    Ok(msg) => msg,
                    Err(error) => {
                        warn!(%error, "dropping bus connection on malformed frame");
                        return;
                    },
                },
                Ok(None) => return,
                Err(error) => {
                    debug!(%error, "bus connection read failed");
                    return;
                },
            },
            _ = cancel.cancelled() => return,
        };

        if events.send(crate::Event::Cluster(msg)).await.is_err() {
            return;
        }
    }
}

async fn read_frame(conn: &mut TcpStream) -> std::io::Result<Option<Bytes>> {
    let mut len = [0u8; 4];
    match conn.read_exact(&mut len).await {
        Ok(_) => {},
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Ok(None)
        },
        Err(e) => return Err(e),
    }

    let len = u32::from_be_bytes(len);
    if len > MAX_FRAME_LEN {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "oversized cluster frame",
        ));
    }

    let mut frame = vec![0u8; len as usize];
    conn.read_exact(&mut frame).await?;
    Ok(Some(frame.into()))
}
