// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! tokio-based TCP transport: connect with a deadline, a reader loop that
//! drives the [`Splitter`], and a writer task so sends never block the
//! caller.
//!
//! The transport knows nothing about RTSP semantics. It delivers framed
//! units into a [`ConnectionSink`]; the session implements that trait. This
//! is the only polymorphic seam in the crate.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::StreamExt;
use log::{debug, trace, warn};
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio_util::codec::FramedRead;

use crate::error::ErrorInt;
use crate::splitter::{SplitItem, Splitter};
use crate::{ConnectionContext, Error};

/// Receiving end of the connection: the framed socket half the reader loop
/// consumes.
pub(crate) type Reader = FramedRead<OwnedReadHalf, Splitter>;

/// What the transport delivers into. Implemented by the RTSP session.
pub(crate) trait ConnectionSink {
    /// Called once, before any reads, when the TCP connection is up.
    fn on_connect(&mut self, conn: &Connection);

    /// Called with each complete RTSP text message. An error tears the
    /// session down.
    fn on_response(&mut self, conn: &Connection, message: String) -> Result<(), Error>;

    /// Called with each interleaved RTP payload (even channels only).
    fn on_frame(&mut self, track: usize, payload: Bytes);

    /// Called when the awaited response's deadline expires. The connection
    /// is torn down immediately afterwards.
    fn on_timeout(&mut self);

    /// Called exactly once when the connection dies: peer close, socket
    /// error, or local shutdown.
    fn on_error(&mut self, err: Error);

    /// Whether the splitter should run in interleaved mode.
    fn rtp_wanted(&self) -> bool;

    /// Deadline of the response currently awaited, if any.
    fn response_deadline(&self) -> Option<tokio::time::Instant>;

    /// Whether periodic keepalives should be sent.
    fn wants_keepalive(&self) -> bool;

    /// Called on each keepalive tick while [`Self::wants_keepalive`].
    fn on_keepalive(&mut self, conn: &Connection);
}

/// Write-side handle to an established connection.
///
/// Cheap to share; [`Connection::send`] queues onto the writer task and is
/// safe from any task or thread.
pub(crate) struct Connection {
    ctx: ConnectionContext,
    write_tx: mpsc::UnboundedSender<Bytes>,
}

impl Connection {
    pub(crate) fn ctx(&self) -> &ConnectionContext {
        &self.ctx
    }

    /// Best-effort send. Returns false when the writer is already gone.
    pub(crate) fn send(&self, data: Bytes) -> bool {
        let ok = self.write_tx.send(data).is_ok();
        if !ok {
            trace!("send after writer exit; dropping");
        }
        ok
    }
}

/// Resolves and connects within `timeout`, then splits the socket into a
/// framed reader and a write handle backed by a spawned writer task.
pub(crate) async fn connect(
    host: &str,
    port: u16,
    timeout: Duration,
    shutdown: watch::Receiver<bool>,
) -> Result<(Arc<Connection>, Reader), Error> {
    // The deadline covers name resolution too; a wedged resolver looks just
    // like an unreachable peer to the caller.
    let stream = match tokio::time::timeout(timeout, resolve_and_connect(host, port)).await {
        Err(_elapsed) => bail!(ErrorInt::ConnectTimeout {
            host: host.to_owned(),
            port,
            timeout,
        }),
        Ok(result) => result?,
    };
    let _ = stream.set_nodelay(true);
    let ctx = ConnectionContext::new(
        stream.local_addr().map_err(|e| {
            wrap!(ErrorInt::ConnectError {
                host: host.to_owned(),
                port,
                source: e,
            })
        })?,
        stream.peer_addr().map_err(|e| {
            wrap!(ErrorInt::ConnectError {
                host: host.to_owned(),
                port,
                source: e,
            })
        })?,
    );
    debug!("connected: {ctx}");
    let (read_half, write_half) = stream.into_split();
    let (write_tx, write_rx) = mpsc::unbounded_channel();
    tokio::spawn(run_writer(write_half, write_rx, shutdown, ctx));
    Ok((
        Arc::new(Connection { ctx, write_tx }),
        FramedRead::new(read_half, Splitter::new()),
    ))
}

async fn resolve_and_connect(host: &str, port: u16) -> Result<TcpStream, Error> {
    let mut addrs = match tokio::net::lookup_host((host, port)).await {
        Ok(addrs) => addrs,
        Err(source) => bail!(ErrorInt::Dns {
            host: host.to_owned(),
            source,
        }),
    };
    let Some(addr) = addrs.next() else {
        bail!(ErrorInt::Dns {
            host: host.to_owned(),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "no addresses returned"),
        });
    };
    match TcpStream::connect(addr).await {
        Ok(stream) => Ok(stream),
        Err(source) if source.kind() == std::io::ErrorKind::ConnectionRefused => {
            bail!(ErrorInt::ConnectRefused {
                host: host.to_owned(),
                port,
                source,
            })
        }
        Err(source) => bail!(ErrorInt::ConnectError {
            host: host.to_owned(),
            port,
            source,
        }),
    }
}

/// Drains queued sends onto the socket until shutdown or error. On
/// shutdown, anything already queued (e.g. a parting TEARDOWN) is still
/// flushed best-effort before the write half drops.
async fn run_writer(
    mut stream: OwnedWriteHalf,
    mut rx: mpsc::UnboundedReceiver<Bytes>,
    mut shutdown: watch::Receiver<bool>,
    ctx: ConnectionContext,
) {
    loop {
        tokio::select! {
            biased;
            msg = rx.recv() => match msg {
                Some(data) => {
                    if let Err(source) = stream.write_all(&data).await {
                        warn!(
                            "{}",
                            wrap!(ErrorInt::WriteError {
                                conn_ctx: ctx,
                                source,
                            })
                        );
                        return;
                    }
                }
                None => return,
            },
            _ = shutdown.changed() => break,
        }
    }
    while let Ok(data) = rx.try_recv() {
        if stream.write_all(&data).await.is_err() {
            break;
        }
    }
    trace!("writer exiting: {ctx}");
}

/// Runs the reader loop: demultiplexed units, the per-request deadline, the
/// keepalive tick, and the shutdown signal all funnel into `sink`. When the
/// loop ends (for any reason) the shutdown flag is raised so the writer
/// task exits too.
pub(crate) async fn drive<S: ConnectionSink>(
    conn: Arc<Connection>,
    mut reader: Reader,
    mut sink: S,
    shutdown: Arc<watch::Sender<bool>>,
    keepalive_interval: Duration,
) {
    let mut shutdown_rx = shutdown.subscribe();
    let mut keepalive = tokio::time::interval_at(
        tokio::time::Instant::now() + keepalive_interval,
        keepalive_interval,
    );
    keepalive.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    sink.on_connect(&conn);
    loop {
        if sink.rtp_wanted() {
            reader.decoder_mut().enable_rtp(true);
        }
        tokio::select! {
            // Shutdown wins over a simultaneously-ready read so a local
            // teardown is never misreported as a peer close; a response
            // that arrived in time wins over its own deadline.
            biased;
            _ = shutdown_rx.changed() => {
                sink.on_error(wrap!(ErrorInt::Shutdown));
                break;
            }
            item = reader.next() => match item {
                Some(Ok(SplitItem::Response(message))) => {
                    if let Err(e) = sink.on_response(&conn, message) {
                        sink.on_error(e);
                        break;
                    }
                }
                Some(Ok(SplitItem::Frame { track, payload })) => sink.on_frame(track, payload),
                Some(Err(source)) => {
                    sink.on_error(wrap!(ErrorInt::ReadError {
                        conn_ctx: *conn.ctx(),
                        source,
                    }));
                    break;
                }
                None => {
                    sink.on_error(wrap!(ErrorInt::Eof {
                        conn_ctx: *conn.ctx(),
                    }));
                    break;
                }
            },
            _ = deadline(sink.response_deadline()) => {
                sink.on_timeout();
                break;
            }
            _ = keepalive.tick(), if sink.wants_keepalive() => sink.on_keepalive(&conn),
        }
    }
    // Reaching here for any reason ends the connection; stop the writer.
    let _ = shutdown.send(true);
}

async fn deadline(instant: Option<tokio::time::Instant>) {
    match instant {
        Some(i) => tokio::time::sleep_until(i).await,
        None => std::future::pending().await,
    }
}
