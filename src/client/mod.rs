// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The RTSP client: URL handling, the `OPTIONS` → `DESCRIBE` → `SETUP` →
//! `PLAY` dialog, and the [`RtspClient`] handle tying the transport, the
//! session state machine, and the ring buffer together.
//!
//! In practice cheap IP cameras are more restrictive than RFC 2326
//! suggests, so the dialog is strictly sequential: one request in flight at
//! a time, each response driving the next request.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use log::{debug, trace, warn};
use parking_lot::Mutex;
use tokio::sync::watch;
use url::Url;

use crate::auth::AuthScheme;
use crate::conn::{self, Connection, ConnectionSink};
use crate::error::ErrorInt;
use crate::hex::LimitedHex;
use crate::ring::Ring;
use crate::rtp::RtpPacket;
use crate::{ConnectionContext, Error, ErrorKind};

mod sdp;

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Duration between keepalive RTSP requests while playing.
const DEFAULT_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

/// Username/password supplied in the URL or via
/// [`ClientOptions::credentials`].
#[derive(Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"...")
            .finish()
    }
}

/// Policy knobs for a client, in the builder style.
///
/// ```
/// use rivulet::ClientOptions;
/// let options = ClientOptions::default()
///     .user_agent("my-recorder".to_owned())
///     .request_timeout(std::time::Duration::from_secs(5));
/// ```
#[derive(Clone)]
pub struct ClientOptions {
    user_agent: String,
    connect_timeout: Duration,
    request_timeout: Duration,
    keepalive_interval: Duration,
    ring_max_packets: usize,
    ring_max_gops: usize,
    credentials: Option<Credentials>,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            user_agent: concat!("rivulet/", env!("CARGO_PKG_VERSION")).to_owned(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            keepalive_interval: DEFAULT_KEEPALIVE_INTERVAL,
            ring_max_packets: 512,
            ring_max_gops: 2,
            credentials: None,
        }
    }
}

impl ClientOptions {
    /// `User-Agent` header value sent with every request.
    pub fn user_agent(self, user_agent: String) -> Self {
        Self { user_agent, ..self }
    }

    /// TCP connect deadline. Default 5 seconds.
    pub fn connect_timeout(self, connect_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            ..self
        }
    }

    /// Deadline for each dialog response. Default 10 seconds.
    pub fn request_timeout(self, request_timeout: Duration) -> Self {
        Self {
            request_timeout,
            ..self
        }
    }

    /// Interval between keepalive `OPTIONS` requests while playing.
    /// Default 30 seconds.
    pub fn keepalive_interval(self, keepalive_interval: Duration) -> Self {
        Self {
            keepalive_interval,
            ..self
        }
    }

    /// Ring buffer caps; see [`crate::ring::Ring::new`].
    /// Defaults: 512 packets across 2 GOPs.
    pub fn ring_capacity(self, max_packets: usize, max_gops: usize) -> Self {
        Self {
            ring_max_packets: max_packets,
            ring_max_gops: max_gops,
            ..self
        }
    }

    /// Credentials to use regardless of URL userinfo.
    pub fn credentials(self, credentials: Option<Credentials>) -> Self {
        Self {
            credentials,
            ..self
        }
    }
}

/// Dialog position. Each state is named for the request most recently sent.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum State {
    Init,
    Options,
    Describe,
    Setup,
    Play,
}

/// Mutable dialog state, shared between the reader task (which drives it)
/// and the caller's thread (which reads it at shutdown to build a parting
/// `TEARDOWN`).
pub(crate) struct SessionContext {
    user_agent: String,

    /// The canonical URL used for OPTIONS/DESCRIBE/PLAY: the caller's URL
    /// minus any userinfo.
    play_url: String,

    /// The per-track URL used for SETUP, resolved from the DESCRIBE
    /// response. Until then, equal to `play_url`.
    control_url: String,

    /// Latched from the first response carrying a `Session` header, then
    /// echoed on every subsequent request.
    session_id: Option<String>,

    /// Incremented before each send; never reused, even on an auth retry.
    cseq: u32,

    state: State,
    credentials: Option<Credentials>,

    /// Latched from the first 401 challenge, then applied to every request.
    auth: Option<AuthScheme>,

    /// Set when the 401-driven replay has been spent; a second 401 fails.
    auth_retry_done: bool,
}

impl SessionContext {
    /// Serializes one request, consuming the next CSeq.
    fn request(&mut self, method: &'static str, uri: &str, extra: &[(&str, &str)]) -> (u32, String) {
        self.cseq += 1;
        let mut req = format!(
            "{method} {uri} RTSP/1.0\r\nCSeq: {}\r\nUser-Agent: {}\r\n",
            self.cseq, self.user_agent,
        );
        if let Some(session_id) = &self.session_id {
            req.push_str(&format!("Session: {session_id}\r\n"));
        }
        if let (Some(auth), Some(creds)) = (&self.auth, &self.credentials) {
            req.push_str(&format!(
                "Authorization: {}\r\n",
                auth.authorization(creds, method, uri)
            ));
        }
        for (name, value) in extra {
            req.push_str(&format!("{name}: {value}\r\n"));
        }
        req.push_str("\r\n");
        (self.cseq, req)
    }
}

/// Returns the first `name:` header value within the header block,
/// case-insensitively, with surrounding whitespace trimmed.
pub(crate) fn header_value<'a>(head: &'a str, name: &str) -> Option<&'a str> {
    for line in head.lines().skip(1) {
        if let Some((n, v)) = line.split_once(':') {
            if n.trim().eq_ignore_ascii_case(name) {
                return Some(v.trim());
            }
        }
    }
    None
}

/// Parses `RTSP/1.0 <code> <reason>`.
fn parse_status(line: &str) -> Option<(u16, &str)> {
    let mut parts = line.splitn(3, ' ');
    if !parts.next()?.starts_with("RTSP/") {
        return None;
    }
    let status = parts.next()?.parse().ok()?;
    Some((status, parts.next().unwrap_or("").trim()))
}

type ResultSlot = Arc<Mutex<Option<Box<dyn FnMut(bool, &str) + Send>>>>;

fn deliver(slot: &ResultSlot, ok: bool, msg: &str) {
    if let Some(cb) = slot.lock().as_mut() {
        cb(ok, msg);
    }
}

/// A request awaiting its response.
#[derive(Copy, Clone)]
struct Await {
    method: &'static str,
    cseq: u32,
    deadline: tokio::time::Instant,
}

/// The dialog driver; the transport's [`ConnectionSink`].
struct RtspSession {
    ctx: Arc<Mutex<SessionContext>>,
    ring: Arc<Ring<Arc<RtpPacket>>>,
    result: ResultSlot,
    request_timeout: Duration,
    awaiting: Option<Await>,
    rtp_wanted: bool,
    play_reported: bool,
    failure_reported: bool,
}

impl RtspSession {
    /// Delivers a play result, at most one success and one failure.
    fn report(&mut self, ok: bool, msg: &str) {
        let latch = if ok {
            &mut self.play_reported
        } else {
            &mut self.failure_reported
        };
        if std::mem::replace(latch, true) {
            return;
        }
        deliver(&self.result, ok, msg);
    }

    fn send_request(
        &mut self,
        conn: &Connection,
        method: &'static str,
        uri: &str,
        extra: &[(&str, &str)],
    ) {
        let (cseq, text) = self.ctx.lock().request(method, uri, extra);
        debug!(">>> {method} {uri} CSeq={cseq}");
        trace!(">>> {} bytes:\n{text}", text.len());
        conn.send(Bytes::from(text));
        self.awaiting = Some(Await {
            method,
            cseq,
            deadline: tokio::time::Instant::now() + self.request_timeout,
        });
    }

    /// (Re)issues the request matching the current state. Used both to
    /// advance the dialog and to replay after an auth challenge.
    fn send_for_state(&mut self, conn: &Connection) {
        let (method, uri, extra): (&'static str, String, &[(&str, &str)]) = {
            let ctx = self.ctx.lock();
            match ctx.state {
                State::Init => return,
                State::Options => ("OPTIONS", ctx.play_url.clone(), &[]),
                State::Describe => (
                    "DESCRIBE",
                    ctx.play_url.clone(),
                    &[("Accept", "application/sdp")],
                ),
                State::Setup => (
                    "SETUP",
                    ctx.control_url.clone(),
                    &[("Transport", "RTP/AVP/TCP;unicast;interleaved=0-1")],
                ),
                State::Play => ("PLAY", ctx.play_url.clone(), &[("Range", "npt=0.000-")]),
            }
        };
        self.send_request(conn, method, &uri, extra);
    }

    fn advance(&mut self, conn: &Connection, state: State) {
        self.ctx.lock().state = state;
        self.send_for_state(conn);
    }

    /// Latches the challenge from a 401 and replays the current state's
    /// request once. Anything beyond that single replay is `AuthFailed`.
    fn handle_unauthorized(&mut self, conn: &Connection, head: &str) -> Result<(), Error> {
        {
            let mut ctx = self.ctx.lock();
            if ctx.auth.is_some() || ctx.auth_retry_done {
                bail!(ErrorInt::AuthFailed {
                    description: "server rejected the supplied credentials".to_owned(),
                });
            }
            if ctx.credentials.is_none() {
                bail!(ErrorInt::AuthFailed {
                    description: "authentication required but no credentials were supplied"
                        .to_owned(),
                });
            }
            let Some(challenge) = header_value(head, "WWW-Authenticate") else {
                bail!(ErrorInt::AuthFailed {
                    description: "401 without a WWW-Authenticate header".to_owned(),
                });
            };
            let Some(scheme) = AuthScheme::parse(challenge) else {
                bail!(ErrorInt::AuthFailed {
                    description: format!("unsupported challenge {challenge:?}"),
                });
            };
            debug!("latched {scheme:?} after 401; replaying request");
            ctx.auth = Some(scheme);
            ctx.auth_retry_done = true;
        }
        self.send_for_state(conn);
        Ok(())
    }
}

impl ConnectionSink for RtspSession {
    fn on_connect(&mut self, conn: &Connection) {
        debug!("connected; starting dialog");
        self.advance(conn, State::Options);
    }

    fn on_response(&mut self, conn: &Connection, message: String) -> Result<(), Error> {
        let head = message.split("\r\n\r\n").next().unwrap_or(&message);
        let first_line = head.lines().next().unwrap_or("");
        let Some((status, reason)) = parse_status(first_line) else {
            bail!(ErrorInt::RtspProtocolError {
                conn_ctx: *conn.ctx(),
                description: format!("malformed status line {first_line:?}"),
            });
        };
        trace!("<<< {} bytes:\n{message}", message.len());
        let outstanding = self.awaiting.take();

        // Latch the session id (sans parameters such as `;timeout=60`) from
        // whichever response first carries one.
        if let Some(session) = header_value(head, "Session") {
            let id = session.split(';').next().unwrap_or("").trim();
            if !id.is_empty() {
                self.ctx.lock().session_id = Some(id.to_owned());
            }
        }

        if status == 401 {
            return self.handle_unauthorized(conn, head);
        }

        let Some(Await { method, cseq, .. }) = outstanding else {
            // Keepalive response (or unsolicited message); not a dialog step.
            if status == 200 {
                trace!("<<< {status} to unawaited request");
            } else {
                warn!("ignoring {status} {reason} to unawaited request");
            }
            return Ok(());
        };

        if status != 200 {
            bail!(ErrorInt::RtspResponseError {
                method,
                cseq,
                status,
                description: reason.to_owned(),
            });
        }
        debug!("<<< 200 to {method} CSeq={cseq}");

        let state = self.ctx.lock().state;
        match state {
            State::Init => warn!("ignoring response before any request"),
            State::Options => self.advance(conn, State::Describe),
            State::Describe => {
                let control = {
                    let ctx = self.ctx.lock();
                    sdp::resolve_control(&message, &ctx.play_url)
                };
                debug!("control url: {control}");
                self.ctx.lock().control_url = control;
                self.advance(conn, State::Setup);
            }
            State::Setup => {
                self.advance(conn, State::Play);
                // Some cameras start interleaving before the PLAY reply is
                // on the wire; switching now is safe because the reply still
                // frames as text.
                self.rtp_wanted = true;
            }
            State::Play => self.report(true, "OK"),
        }
        Ok(())
    }

    fn on_frame(&mut self, track: usize, payload: Bytes) {
        match RtpPacket::parse(payload) {
            Ok(pkt) => {
                let key = pkt.is_keyframe();
                trace!(
                    "rtp track={track} seq={} ts={} pt={}{}",
                    pkt.sequence_number(),
                    pkt.timestamp(),
                    pkt.payload_type(),
                    if key { " [key]" } else { "" },
                );
                self.ring.write(Arc::new(pkt), key);
            }
            Err(e) => warn!(
                "dropping undecodable RTP frame on track {track}: {}\n{:?}",
                e.reason,
                LimitedHex::new(&e.data, 64),
            ),
        }
    }

    fn on_timeout(&mut self) {
        let (method, cseq) = self
            .awaiting
            .map(|a| (a.method, a.cseq))
            .unwrap_or(("(none)", 0));
        let err = wrap!(ErrorInt::ResponseTimeout {
            method,
            cseq,
            timeout: self.request_timeout,
        });
        warn!("{err}");
        self.report(false, &err.to_string());
    }

    fn on_error(&mut self, err: Error) {
        if err.kind() == ErrorKind::Shutdown {
            debug!("connection closed: {err}");
            if !self.play_reported {
                self.report(false, &err.to_string());
            }
            return;
        }
        warn!("session ended: {err}");
        self.report(false, &err.to_string());
    }

    fn rtp_wanted(&self) -> bool {
        self.rtp_wanted
    }

    fn response_deadline(&self) -> Option<tokio::time::Instant> {
        self.awaiting.map(|a| a.deadline)
    }

    fn wants_keepalive(&self) -> bool {
        self.play_reported && self.awaiting.is_none()
    }

    fn on_keepalive(&mut self, conn: &Connection) {
        let (cseq, text) = {
            let mut ctx = self.ctx.lock();
            let uri = ctx.play_url.clone();
            ctx.request("OPTIONS", &uri, &[])
        };
        debug!(">>> keepalive OPTIONS CSeq={cseq}");
        conn.send(Bytes::from(text));
    }
}

struct ClientInner {
    options: ClientOptions,
    ring: Arc<Ring<Arc<RtpPacket>>>,
    result: ResultSlot,
    shutdown_tx: Arc<watch::Sender<bool>>,
    shut: AtomicBool,
    conn: Mutex<Option<Arc<Connection>>>,
    session: Mutex<Option<Arc<Mutex<SessionContext>>>>,
}

/// An RTSP client pulling one interleaved presentation.
///
/// Cloning the handle is cheap; all clones refer to the same session.
/// See the crate-level docs for the calling sequence.
#[derive(Clone)]
pub struct RtspClient {
    inner: Arc<ClientInner>,
}

impl RtspClient {
    pub fn new(options: ClientOptions) -> Self {
        let ring = Arc::new(Ring::new(options.ring_max_packets, options.ring_max_gops));
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(ClientInner {
                options,
                ring,
                result: Arc::new(Mutex::new(None)),
                shutdown_tx: Arc::new(shutdown_tx),
                shut: AtomicBool::new(false),
                conn: Mutex::new(None),
                session: Mutex::new(None),
            }),
        }
    }

    /// The packet cache. Subscribe via [`Ring::set_on_data`]; a late
    /// subscriber first receives the cached keyframe-led prefix.
    pub fn ring(&self) -> Arc<Ring<Arc<RtpPacket>>> {
        self.inner.ring.clone()
    }

    /// Installs the play-result callback. Install *before* [`Self::play`]
    /// or early failures may be missed. Called with `(true, _)` once PLAY
    /// is accepted and with `(false, reason)` when the dialog or the
    /// connection fails.
    pub fn set_on_play_result<F: FnMut(bool, &str) + Send + 'static>(&self, cb: F) {
        *self.inner.result.lock() = Some(Box::new(cb));
    }

    /// Validates `url` and starts the dialog in the background. The outcome
    /// arrives via the play-result callback.
    ///
    /// Must be called within a tokio runtime. At most one `play` per client.
    pub fn play(&self, url: &str) -> Result<(), Error> {
        let parsed = Url::parse(url).map_err(|e| {
            wrap!(ErrorInt::InvalidArgument(format!("bad URL {url:?}: {e}")))
        })?;
        if parsed.scheme() != "rtsp" {
            bail!(ErrorInt::InvalidArgument(format!(
                "expected an rtsp:// URL, got scheme {:?}",
                parsed.scheme()
            )));
        }
        let host = match parsed.host_str() {
            Some(h) if !h.is_empty() => h.to_owned(),
            _ => bail!(ErrorInt::InvalidArgument(format!("no host in {url:?}"))),
        };
        let port = parsed.port().unwrap_or(554);
        let credentials = self.inner.options.credentials.clone().or_else(|| {
            if parsed.username().is_empty() && parsed.password().is_none() {
                None
            } else {
                Some(Credentials {
                    username: parsed.username().to_owned(),
                    password: parsed.password().unwrap_or("").to_owned(),
                })
            }
        });
        let play_url = {
            let mut u = parsed;
            let _ = u.set_username("");
            let _ = u.set_password(None);
            String::from(u)
        };

        let ctx = Arc::new(Mutex::new(SessionContext {
            user_agent: self.inner.options.user_agent.clone(),
            play_url: play_url.clone(),
            control_url: play_url,
            session_id: None,
            cseq: 0,
            state: State::Init,
            credentials,
            auth: None,
            auth_retry_done: false,
        }));
        {
            let mut slot = self.inner.session.lock();
            if slot.is_some() {
                bail!(ErrorInt::FailedPrecondition(
                    "play was already called on this client".to_owned()
                ));
            }
            *slot = Some(ctx.clone());
        }

        let inner = self.inner.clone();
        tokio::spawn(async move {
            let shutdown_rx = inner.shutdown_tx.subscribe();
            match conn::connect(&host, port, inner.options.connect_timeout, shutdown_rx).await {
                Err(e) => {
                    warn!("connect failed: {e}");
                    deliver(&inner.result, false, &e.to_string());
                }
                Ok((conn, reader)) => {
                    if *inner.shutdown_tx.borrow() {
                        debug!("shut down before the dialog started");
                        return;
                    }
                    *inner.conn.lock() = Some(conn.clone());
                    let session = RtspSession {
                        ctx,
                        ring: inner.ring.clone(),
                        result: inner.result.clone(),
                        request_timeout: inner.options.request_timeout,
                        awaiting: None,
                        rtp_wanted: false,
                        play_reported: false,
                        failure_reported: false,
                    };
                    conn::drive(
                        conn,
                        reader,
                        session,
                        inner.shutdown_tx.clone(),
                        inner.options.keepalive_interval,
                    )
                    .await;
                }
            }
        });
        Ok(())
    }

    /// Tears the session down: a best-effort `TEARDOWN` when playing, then
    /// the transport stops. Idempotent and safe from any thread, including
    /// from within callbacks.
    pub fn shutdown(&self) {
        if self.inner.shut.swap(true, Ordering::SeqCst) {
            return;
        }
        let conn = self.inner.conn.lock().clone();
        let session = self.inner.session.lock().clone();
        if let (Some(conn), Some(ctx)) = (conn, session) {
            let mut ctx = ctx.lock();
            if ctx.state == State::Play && ctx.session_id.is_some() {
                let uri = ctx.play_url.clone();
                let (cseq, text) = ctx.request("TEARDOWN", &uri, &[]);
                debug!(">>> TEARDOWN CSeq={cseq} (shutdown)");
                conn.send(Bytes::from(text));
            }
        }
        let _ = self.inner.shutdown_tx.send(true);
    }

    /// Best-effort liveness: a connection exists and no one has torn it down.
    pub fn is_alive(&self) -> bool {
        !*self.inner.shutdown_tx.borrow() && self.inner.conn.lock().is_some()
    }

    /// Addresses of the established connection, once there is one.
    pub fn connection_context(&self) -> Option<ConnectionContext> {
        self.inner.conn.lock().as_ref().map(|c| *c.ctx())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context() -> SessionContext {
        SessionContext {
            user_agent: "test-agent".to_owned(),
            play_url: "rtsp://h/s".to_owned(),
            control_url: "rtsp://h/s".to_owned(),
            session_id: None,
            cseq: 0,
            state: State::Init,
            credentials: None,
            auth: None,
            auth_retry_done: false,
        }
    }

    #[test]
    fn request_basic_form() {
        let mut ctx = context();
        let (cseq, req) = ctx.request("OPTIONS", "rtsp://h/s", &[]);
        assert_eq!(cseq, 1);
        assert_eq!(
            req,
            "OPTIONS rtsp://h/s RTSP/1.0\r\nCSeq: 1\r\nUser-Agent: test-agent\r\n\r\n"
        );
    }

    #[test]
    fn cseq_strictly_increases() {
        let mut ctx = context();
        let mut last = 0;
        for _ in 0..5 {
            let (cseq, _) = ctx.request("OPTIONS", "rtsp://h/s", &[]);
            assert!(cseq > last);
            last = cseq;
        }
    }

    #[test]
    fn request_includes_session_and_auth() {
        let mut ctx = context();
        ctx.session_id = Some("12345".to_owned());
        ctx.credentials = Some(Credentials {
            username: "u".to_owned(),
            password: "p".to_owned(),
        });
        ctx.auth = AuthScheme::parse("Basic realm=\"r\"");
        let (_, req) = ctx.request("PLAY", "rtsp://h/s", &[("Range", "npt=0.000-")]);
        assert!(req.contains("\r\nSession: 12345\r\n"));
        assert!(req.contains("\r\nAuthorization: Basic dTpw\r\n"));
        assert!(req.ends_with("\r\nRange: npt=0.000-\r\n\r\n"));
    }

    #[test]
    fn header_lookup_is_case_insensitive() {
        let head = "RTSP/1.0 200 OK\r\nCSeq: 3\r\nsession:  ABC;timeout=60\r\n";
        assert_eq!(header_value(head, "Session"), Some("ABC;timeout=60"));
        assert_eq!(header_value(head, "CSEQ"), Some("3"));
        assert_eq!(header_value(head, "Transport"), None);
    }

    #[test]
    fn status_line_parse() {
        assert_eq!(
            parse_status("RTSP/1.0 200 OK"),
            Some((200, "OK"))
        );
        assert_eq!(
            parse_status("RTSP/1.0 404 Stream Not Found"),
            Some((404, "Stream Not Found"))
        );
        assert_eq!(parse_status("HTTP/1.1 200 OK"), None);
        assert_eq!(parse_status("RTSP/1.0 abc OK"), None);
        assert_eq!(parse_status(""), None);
    }
}
