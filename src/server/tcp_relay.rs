//! TCP flow relay
//!
//! Bridges one app-layer TCP flow to a remote `host:port`. Two tasks per
//! flow: one pumps tunnel events into the socket through a per-flow save
//! queue (signalling suspend/resume to the peer around the queue's
//! empty/non-empty edges), the other pumps socket bytes back into the
//! tunnel, honoring the flow's suspension gate.
//!
//! Socket EOF sends `close(write)` and moves the flow to read-closed;
//! socket errors send `close(all)` and abort the flow without touching
//! the tunnel.

use std::future::poll_fn;
use std::io;
use std::sync::Arc;
use std::task::Poll;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{debug, info_span, warn, Instrument};

use crate::io::{QueuedWriter, WriteOutcome};
use crate::message::{CloseDirection, Message, ResultCode};
use crate::tunnel::{Connection, FlowEvent, Tunnel};

const READ_CHUNK: usize = 8192;

/// Spawn the relay for a freshly opened TCP flow
pub(crate) fn spawn(
    tunnel: Arc<Tunnel>,
    connection: Arc<Connection>,
    events: UnboundedReceiver<FlowEvent>,
    host: String,
    port: u16,
) {
    let remote = format!("{host}:{port}");
    let span = info_span!(
        "tcp_relay",
        tunnel = tunnel.id(),
        flow = connection.identifier(),
        remote = %remote,
    );
    tokio::spawn(run(tunnel, connection, events, host, port).instrument(span));
}

async fn run(
    tunnel: Arc<Tunnel>,
    connection: Arc<Connection>,
    events: UnboundedReceiver<FlowEvent>,
    host: String,
    port: u16,
) {
    let identifier = connection.identifier();
    let stream = match connect(&host, port).await {
        Ok(stream) => stream,
        Err(code) => {
            debug!("connect failed: {}", code);
            tunnel.write_message(&Message::open_result(identifier, code));
            tunnel.abort_connection(&connection);
            return;
        }
    };

    tunnel.write_message(&Message::open_result(identifier, ResultCode::Success));
    debug!("flow open");

    let (read_half, write_half) = stream.into_split();
    tokio::spawn(
        pump_socket(Arc::clone(&tunnel), Arc::clone(&connection), read_half)
            .in_current_span(),
    );
    pump_events(tunnel, connection, events, write_half).await;
}

/// Open the remote endpoint, classifying failures into wire result codes
async fn connect(host: &str, port: u16) -> Result<TcpStream, ResultCode> {
    let addrs: Vec<_> = match tokio::net::lookup_host((host, port)).await {
        Ok(addrs) => addrs.collect(),
        Err(_) => return Err(ResultCode::NoSuchHost),
    };
    if addrs.is_empty() {
        return Err(ResultCode::NoSuchHost);
    }

    let mut last_error = ResultCode::Internal;
    for addr in addrs {
        match TcpStream::connect(addr).await {
            Ok(stream) => return Ok(stream),
            Err(e) => {
                last_error = match e.kind() {
                    io::ErrorKind::ConnectionRefused => ResultCode::Refused,
                    io::ErrorKind::TimedOut => ResultCode::Timeout,
                    _ => ResultCode::Internal,
                };
            }
        }
    }
    Err(last_error)
}

/// Tunnel → socket: apply flow events to the remote connection
async fn pump_events(
    tunnel: Arc<Tunnel>,
    connection: Arc<Connection>,
    mut events: UnboundedReceiver<FlowEvent>,
    write_half: OwnedWriteHalf,
) {
    let identifier = connection.identifier();
    let mut sink = QueuedWriter::new(write_half);
    let mut write_shutdown = false;

    loop {
        let event = if sink.is_idle() {
            events.recv().await
        } else {
            match drain_or_event(&mut sink, &mut events).await {
                DrainStep::Drained => {
                    tunnel.write_message(&Message::resume(identifier));
                    continue;
                }
                DrainStep::Failed(e) => {
                    warn!("socket write failed: {}", e);
                    tunnel.write_message(&Message::close(identifier, CloseDirection::All));
                    tunnel.abort_connection(&connection);
                    return;
                }
                DrainStep::Event(event) => event,
            }
        };
        let Some(event) = event else {
            // connection dropped on the tunnel side
            return;
        };

        match event {
            FlowEvent::Data(data) => {
                if write_shutdown || connection.closed_for_write() {
                    debug!("dropping {} bytes for write-closed flow", data.len());
                    continue;
                }
                let was_idle = sink.is_idle();
                match sink.write_or_queue(data) {
                    Ok(WriteOutcome::Complete) => {}
                    Ok(WriteOutcome::Queued) => {
                        if was_idle {
                            tunnel.write_message(&Message::suspend(identifier));
                        }
                    }
                    Err(e) => {
                        warn!("socket write failed: {}", e);
                        tunnel.write_message(&Message::close(identifier, CloseDirection::All));
                        tunnel.abort_connection(&connection);
                        return;
                    }
                }
            }
            FlowEvent::Close(direction) => {
                if connection.close_direction() == CloseDirection::All {
                    // full close or abort: queued output is discarded
                    sink.clear();
                    debug!("flow closed");
                    return;
                }
                if direction.closes_write() && !write_shutdown {
                    // flush what the peer already sent, then half-close
                    if let Err(e) = sink.drain().await {
                        debug!("drain before shutdown failed: {}", e);
                    }
                    let _ = sink.get_mut().shutdown().await;
                    write_shutdown = true;
                }
            }
            FlowEvent::Datagram { .. } | FlowEvent::Packets { .. } => {
                warn!("unexpected datagram or packet event on a stream flow");
            }
            FlowEvent::OpenResult { .. } => {}
        }
    }
}

enum DrainStep {
    Drained,
    Failed(io::Error),
    Event(Option<FlowEvent>),
}

/// Make progress on the save queue while staying responsive to events
async fn drain_or_event(
    sink: &mut QueuedWriter<OwnedWriteHalf>,
    events: &mut UnboundedReceiver<FlowEvent>,
) -> DrainStep {
    poll_fn(|cx| {
        match sink.poll_drain(cx) {
            Poll::Ready(Ok(())) => return Poll::Ready(DrainStep::Drained),
            Poll::Ready(Err(e)) => return Poll::Ready(DrainStep::Failed(e)),
            Poll::Pending => {}
        }
        match events.poll_recv(cx) {
            Poll::Ready(event) => Poll::Ready(DrainStep::Event(event)),
            Poll::Pending => Poll::Pending,
        }
    })
    .await
}

/// Socket → tunnel: every chunk read becomes a data message
async fn pump_socket(
    tunnel: Arc<Tunnel>,
    connection: Arc<Connection>,
    mut read_half: OwnedReadHalf,
) {
    let identifier = connection.identifier();
    let mut close_watch = connection.watch_close();
    let mut buf = vec![0u8; READ_CHUNK];

    loop {
        if connection.closed_for_read() || tunnel.is_closed() {
            return;
        }

        // stop pulling from the socket while suspended
        tokio::select! {
            () = connection.readable() => {}
            _ = close_watch.changed() => continue,
        }

        let read = tokio::select! {
            result = read_half.read(&mut buf) => result,
            _ = close_watch.changed() => continue,
        };

        match read {
            Ok(0) => {
                // remote finished sending; the peer must stop writing
                debug!("remote EOF");
                tunnel.write_message(&Message::close(identifier, CloseDirection::Write));
                tunnel.close_connection(&connection, CloseDirection::Read);
                return;
            }
            Ok(n) => {
                tunnel.write_message(&Message::data_message(
                    identifier,
                    Bytes::copy_from_slice(&buf[..n]),
                ));
            }
            Err(e) => {
                debug!("socket read failed: {}", e);
                tunnel.write_message(&Message::close(identifier, CloseDirection::All));
                tunnel.abort_connection(&connection);
                return;
            }
        }
    }
}
