//! Per-connection driver for the client protocol.

use anyhow::{Context, Result};
use scattered_beans::line_reader::{CountedRead, LineReader};
use scattered_beans::parser::ParsingError;
use scattered_beans::types::protocol::{Command, Response};
use scattered_beans::types::serialisable::WireSerialisable;
use scattered_beans::util::bytes_to_human_str;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::select;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, trace};

use crate::{Event, Request};

#[instrument(name = "handle", err, fields(peer = %conn.peer_addr()?), skip_all)]
pub(crate) async fn begin_handle(
    cancel: CancellationToken,
    _shutdown_hold: mpsc::Sender<()>,
    events: mpsc::Sender<Event>,
    mut conn: TcpStream,
    max_job_size: u64,
) -> Result<()> {
    debug!("accepted connection");

    conn.set_nodelay(true).context("setting NODELAY")?;

    let ret = handle_conn(cancel, events, &mut conn, max_job_size).await;

    conn.shutdown().await.context("during shutdown")?;

    debug!("closed connection");

    ret
}

async fn handle_conn(
    cancel: CancellationToken,
    events: mpsc::Sender<Event>,
    conn: &mut TcpStream,
    max_job_size: u64,
) -> Result<()> {
    // Split conn into read and write halves, where the read half uses our
    // LineReader.
    let (r, mut w) = conn.split();
    let mut r: LineReader<_> = r.into();

    // Keep taking lines and parsing and processing them.
    loop {
        let line = select!(
           x = r.read_line() => match x? {
                Some(x) => x,
                None => return Ok(()),
           },
           _ = cancel.cancelled() => return Ok(()),
        );

        trace!(line = bytes_to_human_str(&line), "processing command");

        let cmd: Result<Command, ParsingError> = (&line as &[u8]).try_into();

        let resp = match cmd {
            Err(error) => Some(error.serialise_wire()),
            Ok(Command::Quit) => return Ok(()),
            Ok(Command::Add {
                ttl,
                retry,
                repl,
                n_bytes,
            }) => {
                // An oversized declaration means we'd have to swallow an
                // arbitrary amount of data to stay in sync; refuse and hang
                // up instead. Bodies within the limit are still checked by
                // the core.
                if n_bytes > max_job_size {
                    debug!(n_bytes, "refusing oversized job body");
                    let resp = Response::JobTooBig.serialise_wire();
                    select! {
                        x = w.write_all(&resp) => x?,
                        _ = cancel.cancelled() => return Ok(()),
                    };
                    return Ok(());
                }

                let body = select!(
                    x = r.read_counted(n_bytes as usize) => match x? {
                        Some(CountedRead::Complete(body)) => Some(body),
                        Some(CountedRead::MissingTerminator) => None,
                        None => return Ok(()),
                    },
                    _ = cancel.cancelled() => return Ok(()),
                );

                match body {
                    Some(body) => {
                        submit(
                            &cancel,
                            &events,
                            Request::Add {
                                ttl,
                                retry,
                                repl,
                                body,
                            },
                        )
                        .await?
                        .map(|resp| resp.serialise_wire())
                    },
                    None => Some(Response::ExpectedCrlf.serialise_wire()),
                }
            },
            Ok(cmd) => {
                let req = match cmd {
                    Command::Get => Request::Get,
                    Command::Ack { id } => Request::Ack { id },
                    Command::Show { id } => Request::Show { id },
                    Command::Stats => Request::Stats,
                    // Handled above.
                    Command::Add { .. } | Command::Quit => unreachable!(),
                };
                submit(&cancel, &events, req)
                    .await?
                    .map(|resp| resp.serialise_wire())
            },
        };

        let resp = match resp {
            Some(resp) => resp,
            // The control task is gone: the server is shutting down.
            None => return Ok(()),
        };

        select! {
            x = w.write_all(&resp) => x?,
            _ = cancel.cancelled() => return Ok(()),
        };

        // Flush any buffered packets once we've written out the one or more
        // responses. This provides a pipelined response to a pipelined request.
        // NB: flush() appears not to be implemented for TCPStreams, but this
        // should provide forward-compatibility for other transports.
        select! {
            x = w.flush() => x?,
            _ = cancel.cancelled() => return Ok(()),
        };
    }
}

/// Hands a request to the control task and waits for its response. A `None`
/// means the control task has gone away and the connection should close.
async fn submit(
    cancel: &CancellationToken,
    events: &mpsc::Sender<Event>,
    req: Request,
) -> Result<Option<Response>> {
    let (tx, rx) = oneshot::channel();

    if events.send(Event::Client(req, tx)).await.is_err() {
        return Ok(None);
    }

    select! {
        resp = rx => Ok(resp.ok()),
        _ = cancel.cancelled() => Ok(None),
    }
}
