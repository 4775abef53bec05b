use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use transport_mux::Demux;

use crate::error::{SessionError, TransportError, TransportResult};
use crate::session::{Association, Session};

/// A fully negotiated transport for one stream identifier. It owns the
/// association and the second-level demultiplexer it was built on.
pub struct Transport {
    stream_id: String,
    remote_addr: Option<SocketAddr>,
    session: Arc<dyn Session>,
    association: Arc<dyn Association>,
    mux: Arc<dyn Demux>,
    closed: AtomicBool,
}

impl Transport {
    pub(crate) fn new(
        stream_id: impl Into<String>,
        remote_addr: Option<SocketAddr>,
        session: Arc<dyn Session>,
        association: Arc<dyn Association>,
        mux: Arc<dyn Demux>,
    ) -> Self {
        Self {
            stream_id: stream_id.into(),
            remote_addr,
            session,
            association,
            mux,
            closed: AtomicBool::new(false),
        }
    }

    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    pub fn session(&self) -> &Arc<dyn Session> {
        &self.session
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Closes the session, then the association, then the demultiplexer.
    /// Every step runs even if an earlier one fails; the first error is
    /// returned. Closing twice is a no-op.
    pub async fn close(&self) -> TransportResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let session = self.session.close().await;
        let association = self.association.close().await;
        let mux = self.mux.close().await.map_err(SessionError::from);
        session
            .and(association)
            .and(mux)
            .map_err(|err| TransportError::Close {
                stream_id: self.stream_id.clone(),
                reason: err.to_string(),
            })
    }
}

impl fmt::Debug for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transport")
            .field("stream_id", &self.stream_id)
            .field("remote_addr", &self.remote_addr)
            .field("closed", &self.is_closed())
            .finish()
    }
}
