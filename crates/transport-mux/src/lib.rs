//! Tagged sub-connection demultiplexing.
//!
//! A [`Demux`] splits one duplex packet connection into independent
//! [`SubConn`]s, each named by a short string tag. Sub-connections are
//! themselves duplex packet connections, so a [`DemuxBuilder`] can layer a
//! second demultiplexer on top of one of them.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

mod local;

pub use local::{LocalMux, LocalMuxBuilder};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MuxError {
    #[error("mux closed")]
    Closed,
    #[error("sub-connection closed: {0}")]
    ConnClosed(String),
    #[error("unknown sub-connection tag: {0}")]
    UnknownTag(String),
    #[error("mux transport error: {0}")]
    Transport(String),
}

pub type MuxResult<T> = Result<T, MuxError>;

/// One tagged, packet-oriented duplex channel carried by a [`Demux`].
#[async_trait]
pub trait SubConn: Send + Sync {
    fn tag(&self) -> &str;

    fn remote_addr(&self) -> Option<SocketAddr>;

    /// Reads the next packet into `buf`, truncating it if `buf` is too small.
    async fn read(&self, buf: &mut [u8]) -> MuxResult<usize>;

    async fn write(&self, buf: &[u8]) -> MuxResult<usize>;

    async fn close(&self) -> MuxResult<()>;

    /// Resolves once the sub-connection is closed by either end or by its
    /// demultiplexer.
    async fn closed(&self);
}

pub type Conn = Arc<dyn SubConn>;

#[async_trait]
pub trait Demux: Send + Sync {
    /// Waits for the next sub-connection opened by the remote side.
    async fn accept_conn(&self) -> MuxResult<Conn>;

    /// Returns the sub-connection for `tag` without waiting for the remote
    /// side. Implementations may create it locally; they fail once closed.
    fn get_conn(&self, tag: &str) -> MuxResult<Conn>;

    /// Closes every sub-connection and unblocks pending `accept_conn` calls.
    async fn close(&self) -> MuxResult<()>;
}

/// Layers a new [`Demux`] over an existing sub-connection.
pub trait DemuxBuilder: Send + Sync {
    fn build(&self, conn: Conn) -> MuxResult<Arc<dyn Demux>>;
}
