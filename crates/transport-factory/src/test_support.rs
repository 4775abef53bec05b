use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use transport_mux::{Demux, LocalMux};

use crate::error::SessionError;
use crate::session::{
    Association, MessageStream, PayloadKind, SessionAssembler, SessionParts,
    StreamSessionAssembler,
};
use crate::transport::Transport;

pub(crate) struct NullStream(pub(crate) u16);

#[async_trait]
impl MessageStream for NullStream {
    fn stream_id(&self) -> u16 {
        self.0
    }

    async fn read(&self, _buf: &mut [u8]) -> Result<usize, SessionError> {
        Err(SessionError::Closed)
    }

    async fn write(&self, payload: Bytes) -> Result<usize, SessionError> {
        Ok(payload.len())
    }

    async fn close(&self) -> Result<(), SessionError> {
        Ok(())
    }
}

pub(crate) struct NullAssociation;

#[async_trait]
impl Association for NullAssociation {
    async fn open_stream(
        &self,
        stream_id: u16,
        _kind: PayloadKind,
    ) -> Result<Arc<dyn MessageStream>, SessionError> {
        Ok(Arc::new(NullStream(stream_id)) as Arc<dyn MessageStream>)
    }

    async fn close(&self) -> Result<(), SessionError> {
        Ok(())
    }
}

/// A transport over an in-memory link whose streams carry nothing.
pub(crate) fn null_transport(stream_id: &str) -> Arc<Transport> {
    let (mux, _peer) = LocalMux::pair();
    let media = mux.get_conn("m").expect("media conn");
    let session = StreamSessionAssembler.assemble(SessionParts {
        media,
        data: Arc::new(NullStream(1)),
        metadata: Arc::new(NullStream(0)),
    });
    Arc::new(Transport::new(
        stream_id,
        None,
        session,
        Arc::new(NullAssociation),
        Arc::new(mux),
    ))
}
