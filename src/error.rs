// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

use std::{fmt::Display, sync::Arc};

use crate::ConnectionContext;
use thiserror::Error;

/// An opaque `std::error::Error + Send + Sync + 'static` implementation.
///
/// The focus is on detailed human-readable messages; in most cases they have
/// enough information to find the offending exchange in a packet capture.
/// Programmatic inspection is limited to [`Error::kind`] and
/// [`Error::status`].
#[derive(Clone)]
pub struct Error(pub(crate) Arc<ErrorInt>);

/// Broad classification of an [`Error`], mirroring the failure modes of the
/// transport and the RTSP dialog.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// Hostname resolution failed.
    Dns,

    /// Connect or per-request deadline expired.
    Timeout,

    /// The peer rejected the TCP connection.
    Refused,

    /// The peer closed the connection mid-session.
    Eof,

    /// Local [`crate::RtspClient::shutdown`] was called.
    Shutdown,

    /// The server replied `401 Unauthorized` after a retry, or the
    /// challenge was unusable.
    AuthFailed,

    /// A non-200, non-401 RTSP status. See [`Error::status`].
    Rtsp,

    /// Unclassified socket or parse error.
    Other,
}

impl Error {
    /// Returns the broad classification of this error.
    pub fn kind(&self) -> ErrorKind {
        match self.0.as_ref() {
            ErrorInt::Dns { .. } => ErrorKind::Dns,
            ErrorInt::ConnectTimeout { .. } | ErrorInt::ResponseTimeout { .. } => {
                ErrorKind::Timeout
            }
            ErrorInt::ConnectRefused { .. } => ErrorKind::Refused,
            ErrorInt::Eof { .. } => ErrorKind::Eof,
            ErrorInt::Shutdown => ErrorKind::Shutdown,
            ErrorInt::AuthFailed { .. } => ErrorKind::AuthFailed,
            ErrorInt::RtspResponseError { .. } => ErrorKind::Rtsp,
            ErrorInt::InvalidArgument(_)
            | ErrorInt::FailedPrecondition(_)
            | ErrorInt::ConnectError { .. }
            | ErrorInt::ReadError { .. }
            | ErrorInt::WriteError { .. }
            | ErrorInt::RtspProtocolError { .. } => ErrorKind::Other,
        }
    }

    /// Returns the status code, if the error was generated from an RTSP response.
    pub fn status(&self) -> Option<u16> {
        match self.0.as_ref() {
            ErrorInt::RtspResponseError { status, .. } => Some(*status),
            _ => None,
        }
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl std::fmt::Debug for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(&self.0, f)
    }
}

impl std::error::Error for Error {}

#[derive(Debug, Error)]
pub(crate) enum ErrorInt {
    /// The method's caller provided an invalid argument.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Failed precondition: {0}")]
    FailedPrecondition(String),

    #[error("Unable to resolve host {host:?}: {source}")]
    Dns {
        host: String,
        source: std::io::Error,
    },

    #[error("Timed out connecting to {host}:{port} after {timeout:?}")]
    ConnectTimeout {
        host: String,
        port: u16,
        timeout: std::time::Duration,
    },

    #[error("Connection to {host}:{port} refused: {source}")]
    ConnectRefused {
        host: String,
        port: u16,
        source: std::io::Error,
    },

    #[error("Unable to connect to {host}:{port}: {source}")]
    ConnectError {
        host: String,
        port: u16,
        source: std::io::Error,
    },

    #[error("Error reading from RTSP peer: {source}\n\nconn: {conn_ctx}")]
    ReadError {
        conn_ctx: ConnectionContext,
        source: std::io::Error,
    },

    #[error("Error writing to RTSP peer: {source}\n\nconn: {conn_ctx}")]
    WriteError {
        conn_ctx: ConnectionContext,
        source: std::io::Error,
    },

    #[error("Peer closed the connection\n\nconn: {conn_ctx}")]
    Eof { conn_ctx: ConnectionContext },

    #[error("Shut down locally")]
    Shutdown,

    #[error("No response to {method} CSeq={cseq} within {timeout:?}")]
    ResponseTimeout {
        method: &'static str,
        cseq: u32,
        timeout: std::time::Duration,
    },

    #[error("Authentication failed: {description}")]
    AuthFailed { description: String },

    /// Unparseable or unexpected RTSP message.
    #[error("RTSP protocol error: {description}\n\nconn: {conn_ctx}")]
    RtspProtocolError {
        conn_ctx: ConnectionContext,
        description: String,
    },

    #[error("{status} response to {method} CSeq={cseq}: {description}")]
    RtspResponseError {
        method: &'static str,
        cseq: u32,
        status: u16,
        description: String,
    },
}
