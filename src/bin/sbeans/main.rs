mod args;
mod bus;
mod conn;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result};
use bytes::Bytes;
use clap::Parser;
use scattered_beans::cluster::membership::StaticMembership;
use scattered_beans::cluster::message::ClusterMessage;
use scattered_beans::error::CoreError;
use scattered_beans::node::QueueNode;
use scattered_beans::types::id::{JobId, NodeId};
use scattered_beans::types::protocol::Response;
use scattered_beans::util::now_unix;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::{select, signal};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Level};

use crate::args::Args;
use crate::bus::BusMessenger;

/// A client request as seen by the control task, with the job body already
/// read off the wire.
pub(crate) enum Request {
    Add {
        ttl: u32,
        retry: u32,
        repl: u16,
        body: Bytes,
    },
    Get,
    Ack { id: JobId },
    Show { id: JobId },
    Stats,
}

/// Everything the control task reacts to. All job-record mutation happens on
/// that one task; connections and the bus only ever send it events.
pub(crate) enum Event {
    Client(Request, oneshot::Sender<Response>),
    Cluster(ClusterMessage),
    PeerUp(NodeId),
    PeerDown(NodeId),
}

type Node = QueueNode<BusMessenger, StaticMembership>;

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let args = Args::parse();

    // Logging
    if args.debug {
        tracing_subscriber::fmt()
            .with_max_level(Level::TRACE)
            .init();
    } else {
        tracing_subscriber::fmt().json().init();
    }

    // Cancellation and termination channel.
    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(error) = signal::ctrl_c().await {
                warn!(%error, "something strange with ctrl-c handling!");
            };
            cancel.cancel();
        });
    }

    let (shutdown_hold, mut shutdown_wait) = mpsc::channel::<()>(1);

    let exit_code = if let Err(error) = begin(args, cancel, shutdown_hold).await
    {
        error!(%error, "encountered runtime error");
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    };

    shutdown_wait.recv().await;

    exit_code
}

async fn begin(
    args: Args,
    cancel: CancellationToken,
    shutdown_hold: mpsc::Sender<()>,
) -> Result<()> {
    let me = args.node_id.unwrap_or_else(NodeId::generate);
    info!(node = %me, peers = args.peers.len(), "node identity");

    let peer_addrs: HashMap<NodeId, SocketAddr> =
        args.peers.iter().map(|p| (p.id, p.addr)).collect();
    let membership =
        StaticMembership::new(me, args.peers.iter().map(|p| p.id).collect());

    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
    let node = QueueNode::new(
        membership,
        BusMessenger::new(me, outbound_tx),
        args.max_job_size as u64,
    );

    let (event_tx, event_rx) = mpsc::channel(1024);

    // Cluster bus: inbound listener plus the outbound dispatcher.
    let cluster_port = match args.cluster_port {
        Some(port) => port,
        None => args
            .port
            .checked_add(10000)
            .context("client port too high for the default cluster port")?,
    };
    let bus_listener =
        TcpListener::bind((args.listen, cluster_port)).await?;
    info!(addr = %bus_listener.local_addr()?, "cluster bus listening");
    tokio::spawn(bus::run_inbound(
        bus_listener,
        event_tx.clone(),
        cancel.clone(),
    ));
    tokio::spawn(bus::run_outbound(
        peer_addrs,
        outbound_rx,
        event_tx.clone(),
        cancel.clone(),
    ));

    // The control task: sole owner of the job table.
    tokio::spawn(control_loop(node, event_rx, cancel.clone()));

    let listener = TcpListener::bind((args.listen, args.port)).await?;
    info!(addr = %listener.local_addr()?, "listening");

    let max_job_size = args.max_job_size as u64;

    // Accept incoming connections until an exit signal is sent, and handle
    // each connection as its own task.
    loop {
        let conn: TcpStream = match select! {
            accept = listener.accept() => accept,
            _ = cancel.cancelled() => break,
        } {
            Ok((conn, _)) => conn,
            Err(error) => {
                warn!(%error, "failed to accept connection");
                continue;
            },
        };

        tokio::spawn(conn::begin_handle(
            cancel.clone(),
            shutdown_hold.clone(),
            event_tx.clone(),
            conn,
            max_job_size,
        ));
    }

    Ok(())
}

/// Runs the node's single control thread: client requests, cluster messages,
/// and the periodic maintenance tick, interleaved cooperatively. Nothing
/// here awaits the network; sends are fire-and-forget through the bus.
async fn control_loop(
    mut node: Node,
    mut events: mpsc::Receiver<Event>,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(Duration::from_secs(1));

    loop {
        select! {
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => node.tick(now_unix()),
            ev = events.recv() => match ev {
                Some(ev) => handle_event(&mut node, ev),
                None => return,
            },
        }
    }
}

fn handle_event(node: &mut Node, ev: Event) {
    let now = now_unix();

    match ev {
        Event::Client(req, reply) => {
            // A dropped receiver means the client went away mid-request;
            // the work is already done either way.
            let _ = reply.send(handle_request(node, now, req));
        },
        Event::Cluster(msg) => match msg {
            ClusterMessage::ReplJob { from, record } => {
                if let Err(error) = node.on_repljob(now, &from, &record) {
                    warn!(%error, from = %from, "dropping malformed REPLJOB");
                }
            },
            ClusterMessage::SetAck { from, id, nodes } => {
                node.on_setack(now, &from, &id, nodes);
            },
            ClusterMessage::GotAck { from, id } => {
                node.on_gotack(now, &from, &id);
            },
        },
        Event::PeerUp(peer) => node.membership_mut().mark_reachable(&peer),
        Event::PeerDown(peer) => {
            node.membership_mut().mark_unreachable(&peer)
        },
    }
}

fn handle_request(node: &mut Node, now: u32, req: Request) -> Response {
    match req {
        Request::Add {
            ttl,
            retry,
            repl,
            body,
        } => match node.create(now, ttl, retry, repl, body) {
            Ok(id) => Response::Inserted { id },
            Err(CoreError::BodyTooLarge { .. }) => Response::JobTooBig,
            Err(error) => {
                warn!(%error, "job creation failed");
                Response::BadFormat
            },
        },
        Request::Get => match node.deliver(now) {
            Some((id, body)) => Response::Reserved { id, body },
            None => Response::Empty,
        },
        Request::Ack { id } => match node.ack(now, &id) {
            Ok(_) => Response::Acked,
            Err(_) => Response::NotFound,
        },
        Request::Show { id } => match node.job_stats(now, &id) {
            Some(data) => Response::OkShow { data },
            None => Response::NotFound,
        },
        Request::Stats => Response::OkStats {
            data: node.server_stats(),
        },
    }
}
