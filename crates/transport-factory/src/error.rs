use std::net::SocketAddr;

use thiserror::Error;

use crate::session::Role;

/// Errors surfaced through a settled [`crate::TransportPromise`] or returned
/// by transport teardown.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("promise or transport already exists: {stream_id}")]
    DuplicateTransport { stream_id: String },
    #[error("accept transport: {reason}")]
    DemuxAcceptFailed { reason: String },
    #[error("retrieving transport conn {stream_id}: {reason}")]
    DemuxGetFailed { stream_id: String, reason: String },
    #[error("creating 's' and 'm' conns for raddr {remote_addr} {stream_id}: {reason}")]
    SecondLevelDemuxFailed {
        stream_id: String,
        remote_addr: String,
        reason: String,
    },
    #[error("creating {role} association for raddr {remote_addr} {stream_id}: {reason}")]
    SessionNegotiationFailed {
        stream_id: String,
        remote_addr: String,
        role: Role,
        reason: String,
    },
    #[error("creating {stream} stream for raddr {remote_addr} {stream_id}: {reason}")]
    StreamOpenFailed {
        stream_id: String,
        remote_addr: String,
        stream: &'static str,
        reason: String,
    },
    #[error("transport promise already settled: {stream_id}")]
    AlreadySettled { stream_id: String },
    #[error("transport promise canceled: {stream_id}")]
    Canceled { stream_id: String },
    #[error("closing transport {stream_id}: {reason}")]
    Close { stream_id: String, reason: String },
    #[error("transport factory closed")]
    FactoryClosed,
}

pub type TransportResult<T> = Result<T, TransportError>;

/// Errors reported by a session builder, its associations and streams.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("session closed")]
    Closed,
    #[error("session protocol error: {0}")]
    Protocol(String),
    #[error("session conn error: {0}")]
    Conn(#[from] transport_mux::MuxError),
}

pub(crate) fn describe_addr(addr: Option<SocketAddr>) -> String {
    match addr {
        Some(addr) => addr.to_string(),
        None => "unknown".to_string(),
    }
}
