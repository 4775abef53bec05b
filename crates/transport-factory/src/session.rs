use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use transport_mux::Conn;

use crate::error::SessionError;

/// Stream number of the reliable metadata channel.
pub const METADATA_STREAM_ID: u16 = 0;
/// Stream number of the reliable data channel.
pub const DATA_STREAM_ID: u16 = 1;

/// Which side of the association negotiation this peer plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Requested the transport locally; starts the association as client.
    Initiator,
    /// Accepted a transport requested by the peer; starts as server.
    Responder,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Initiator => f.write_str("client"),
            Role::Responder => f.write_str("server"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadKind {
    Binary,
    Text,
}

/// Tuning passed through to the session builder. Zero keeps the
/// implementation default.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionOptions {
    pub max_message_size: u32,
    pub max_receive_buffer_size: u32,
}

/// One numbered, ordered, reliable message channel within an association.
#[async_trait]
pub trait MessageStream: Send + Sync {
    fn stream_id(&self) -> u16;
    async fn read(&self, buf: &mut [u8]) -> Result<usize, SessionError>;
    async fn write(&self, payload: Bytes) -> Result<usize, SessionError>;
    async fn close(&self) -> Result<(), SessionError>;
}

/// A negotiated multi-stream association.
#[async_trait]
pub trait Association: Send + Sync {
    async fn open_stream(
        &self,
        stream_id: u16,
        kind: PayloadKind,
    ) -> Result<Arc<dyn MessageStream>, SessionError>;
    async fn close(&self) -> Result<(), SessionError>;
}

/// Negotiates associations over a raw sub-connection.
#[async_trait]
pub trait SessionBuilder: Send + Sync {
    async fn start_as_server(
        &self,
        conn: Conn,
        options: SessionOptions,
    ) -> Result<Arc<dyn Association>, SessionError>;

    async fn start_as_client(
        &self,
        conn: Conn,
        options: SessionOptions,
    ) -> Result<Arc<dyn Association>, SessionError>;
}

/// The application-facing object built from the negotiated channels.
#[async_trait]
pub trait Session: Send + Sync {
    /// Resolves once the session has finished, for whatever reason.
    async fn done(&self);
    async fn close(&self) -> Result<(), SessionError>;
}

pub struct SessionParts {
    pub media: Conn,
    pub data: Arc<dyn MessageStream>,
    pub metadata: Arc<dyn MessageStream>,
}

pub trait SessionAssembler: Send + Sync {
    fn assemble(&self, parts: SessionParts) -> Arc<dyn Session>;
}

/// Plain session exposing the raw media sub-connection and both streams.
///
/// The session is done once it is closed locally or once its media
/// sub-connection closes, whichever end closed it.
pub struct StreamSession {
    media: Conn,
    data: Arc<dyn MessageStream>,
    metadata: Arc<dyn MessageStream>,
    done: CancellationToken,
    closing: AtomicBool,
}

impl StreamSession {
    pub fn new(parts: SessionParts) -> Self {
        Self {
            media: parts.media,
            data: parts.data,
            metadata: parts.metadata,
            done: CancellationToken::new(),
            closing: AtomicBool::new(false),
        }
    }

    pub fn media(&self) -> &Conn {
        &self.media
    }

    pub fn data(&self) -> &Arc<dyn MessageStream> {
        &self.data
    }

    pub fn metadata(&self) -> &Arc<dyn MessageStream> {
        &self.metadata
    }

    pub fn is_done(&self) -> bool {
        self.done.is_cancelled()
    }
}

#[async_trait]
impl Session for StreamSession {
    async fn done(&self) {
        tokio::select! {
            _ = self.done.cancelled() => {}
            _ = self.media.closed() => {
                debug!(media = self.media.tag(), "media conn closed; session done");
                self.done.cancel();
            }
        }
    }

    async fn close(&self) -> Result<(), SessionError> {
        if self.closing.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.done.cancel();
        debug!(media = self.media.tag(), "closing stream session");

        let metadata = self.metadata.close().await;
        let data = self.data.close().await;
        let media = self.media.close().await.map_err(SessionError::from);
        metadata.and(data).and(media)
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct StreamSessionAssembler;

impl SessionAssembler for StreamSessionAssembler {
    fn assemble(&self, parts: SessionParts) -> Arc<dyn Session> {
        Arc::new(StreamSession::new(parts))
    }
}
