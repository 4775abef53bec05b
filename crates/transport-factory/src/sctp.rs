//! Session builder backed by the SCTP implementation shipped with `webrtc`.

use std::any::Any;
use std::net::{Shutdown, SocketAddr};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::debug;
use transport_mux::Conn;
use webrtc::sctp::association::{self, Association as SctpAssociationHandle};
use webrtc::sctp::chunk::chunk_payload_data::PayloadProtocolIdentifier;
use webrtc::sctp::stream::Stream as SctpStreamHandle;
use webrtc::util::Conn as NetConn;

use crate::error::SessionError;
use crate::session::{Association, MessageStream, PayloadKind, SessionBuilder, SessionOptions};

/// SCTP port used on both ends, the same one WebRTC data channels use.
const SCTP_PORT: u16 = 5000;

/// Presents a tagged sub-connection as the datagram connection the SCTP
/// association reads and writes.
struct ConnBridge {
    conn: Conn,
}

fn to_net_error<E: std::fmt::Display>(err: E) -> webrtc::util::Error {
    webrtc::util::Error::Other(err.to_string())
}

fn to_session_error<E: std::fmt::Display>(err: E) -> SessionError {
    SessionError::Protocol(err.to_string())
}

#[async_trait]
impl NetConn for ConnBridge {
    async fn connect(&self, _addr: SocketAddr) -> webrtc::util::Result<()> {
        Err(to_net_error("connect is not supported on a sub-connection"))
    }

    async fn recv(&self, buf: &mut [u8]) -> webrtc::util::Result<usize> {
        self.conn.read(buf).await.map_err(to_net_error)
    }

    async fn recv_from(&self, buf: &mut [u8]) -> webrtc::util::Result<(usize, SocketAddr)> {
        let len = self.conn.read(buf).await.map_err(to_net_error)?;
        Ok((len, self.conn.remote_addr().unwrap_or_else(unspecified_addr)))
    }

    async fn send(&self, buf: &[u8]) -> webrtc::util::Result<usize> {
        self.conn.write(buf).await.map_err(to_net_error)
    }

    async fn send_to(&self, buf: &[u8], _target: SocketAddr) -> webrtc::util::Result<usize> {
        self.conn.write(buf).await.map_err(to_net_error)
    }

    fn local_addr(&self) -> webrtc::util::Result<SocketAddr> {
        Ok(unspecified_addr())
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        self.conn.remote_addr()
    }

    async fn close(&self) -> webrtc::util::Result<()> {
        self.conn.close().await.map_err(to_net_error)
    }

    fn as_any(&self) -> &(dyn Any + Send + Sync) {
        self
    }
}

fn unspecified_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 0))
}

struct SctpStream {
    stream: Arc<SctpStreamHandle>,
}

#[async_trait]
impl MessageStream for SctpStream {
    fn stream_id(&self) -> u16 {
        self.stream.stream_identifier()
    }

    async fn read(&self, buf: &mut [u8]) -> Result<usize, SessionError> {
        self.stream.read(buf).await.map_err(to_session_error)
    }

    async fn write(&self, payload: Bytes) -> Result<usize, SessionError> {
        self.stream.write(&payload).await.map_err(to_session_error)
    }

    async fn close(&self) -> Result<(), SessionError> {
        self.stream
            .shutdown(Shutdown::Both)
            .await
            .map_err(to_session_error)
    }
}

struct SctpAssociation {
    association: SctpAssociationHandle,
}

#[async_trait]
impl Association for SctpAssociation {
    async fn open_stream(
        &self,
        stream_id: u16,
        kind: PayloadKind,
    ) -> Result<Arc<dyn MessageStream>, SessionError> {
        let payload_type = match kind {
            PayloadKind::Binary => PayloadProtocolIdentifier::Binary,
            PayloadKind::Text => PayloadProtocolIdentifier::String,
        };
        let stream = self
            .association
            .open_stream(stream_id, payload_type)
            .await
            .map_err(to_session_error)?;
        Ok(Arc::new(SctpStream { stream }) as Arc<dyn MessageStream>)
    }

    async fn close(&self) -> Result<(), SessionError> {
        self.association.close().await.map_err(to_session_error)
    }
}

/// Builds SCTP associations directly over a sub-connection, without DTLS.
#[derive(Debug, Default, Clone, Copy)]
pub struct SctpSessionBuilder;

impl SctpSessionBuilder {
    fn config(conn: Conn, options: SessionOptions) -> association::Config {
        let name = conn.tag().to_string();
        association::Config {
            net_conn: Arc::new(ConnBridge { conn }) as Arc<dyn NetConn + Send + Sync>,
            max_receive_buffer_size: options.max_receive_buffer_size,
            max_message_size: options.max_message_size,
            name,
            local_port: SCTP_PORT,
            remote_port: SCTP_PORT,
        }
    }
}

#[async_trait]
impl SessionBuilder for SctpSessionBuilder {
    async fn start_as_server(
        &self,
        conn: Conn,
        options: SessionOptions,
    ) -> Result<Arc<dyn Association>, SessionError> {
        debug!(tag = conn.tag(), remote_addr = ?conn.remote_addr(), "starting sctp server");
        let association = SctpAssociationHandle::server(Self::config(conn, options))
            .await
            .map_err(to_session_error)?;
        Ok(Arc::new(SctpAssociation { association }) as Arc<dyn Association>)
    }

    async fn start_as_client(
        &self,
        conn: Conn,
        options: SessionOptions,
    ) -> Result<Arc<dyn Association>, SessionError> {
        debug!(tag = conn.tag(), remote_addr = ?conn.remote_addr(), "starting sctp client");
        let association = SctpAssociationHandle::client(Self::config(conn, options))
            .await
            .map_err(to_session_error)?;
        Ok(Arc::new(SctpAssociation { association }) as Arc<dyn Association>)
    }
}
