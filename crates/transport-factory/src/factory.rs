use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, warn};
use transport_mux::{Conn, Demux, DemuxBuilder};

use crate::config::FactoryConfig;
use crate::error::{TransportError, TransportResult};
use crate::promise::TransportPromise;
use crate::registry::Registry;
use crate::session::{Role, SessionAssembler, SessionBuilder, StreamSessionAssembler};
use crate::transport::Transport;

/// The external pieces a [`Factory`] drives.
pub struct Collaborators {
    /// Demultiplexer over the physical connection; one sub-connection per
    /// stream identifier.
    pub demux: Arc<dyn Demux>,
    /// Layers the per-transport demultiplexer over a stream's sub-connection.
    pub demux_builder: Arc<dyn DemuxBuilder>,
    pub session_builder: Arc<dyn SessionBuilder>,
    pub assembler: Arc<dyn SessionAssembler>,
}

impl Collaborators {
    pub fn new(
        demux: Arc<dyn Demux>,
        demux_builder: Arc<dyn DemuxBuilder>,
        session_builder: Arc<dyn SessionBuilder>,
    ) -> Self {
        Self {
            demux,
            demux_builder,
            session_builder,
            assembler: Arc::new(StreamSessionAssembler),
        }
    }

    pub fn with_assembler(mut self, assembler: Arc<dyn SessionAssembler>) -> Self {
        self.assembler = assembler;
        self
    }
}

pub(crate) struct FactoryInner {
    pub(crate) config: FactoryConfig,
    pub(crate) demux: Arc<dyn Demux>,
    pub(crate) demux_builder: Arc<dyn DemuxBuilder>,
    pub(crate) session_builder: Arc<dyn SessionBuilder>,
    pub(crate) assembler: Arc<dyn SessionAssembler>,
    pub(crate) registry: Registry,
    pub(crate) tracker: TaskTracker,
    pub(crate) root: CancellationToken,
}

/// Creates transports for incoming and locally requested streams over one
/// physical connection, keeping at most one transport, pending or active,
/// per stream identifier.
#[derive(Clone)]
pub struct Factory {
    inner: Arc<FactoryInner>,
}

impl Factory {
    pub fn new(config: FactoryConfig, collaborators: Collaborators) -> Self {
        Self {
            inner: Arc::new(FactoryInner {
                config,
                demux: collaborators.demux,
                demux_builder: collaborators.demux_builder,
                session_builder: collaborators.session_builder,
                assembler: collaborators.assembler,
                registry: Registry::default(),
                tracker: TaskTracker::new(),
                root: CancellationToken::new(),
            }),
        }
    }

    /// Waits for the next sub-connection the peer opens and starts
    /// negotiating a transport over it as the responder.
    ///
    /// The returned promise must be waited for or canceled. Accept failures
    /// come back as an already settled promise.
    pub async fn accept_transport(&self) -> TransportPromise {
        let conn = match self.inner.demux.accept_conn().await {
            Ok(conn) => conn,
            Err(err) => {
                return TransportPromise::failed(
                    &self.inner.root,
                    "",
                    TransportError::DemuxAcceptFailed {
                        reason: err.to_string(),
                    },
                );
            }
        };

        let promise = TransportPromise::new(&self.inner.root, conn.tag());
        if let Err(err) = self.register_pending(&promise) {
            debug!(stream_id = conn.tag(), error = %err, "rejecting accepted conn");
            if let Err(close_err) = conn.close().await {
                debug!(stream_id = conn.tag(), error = %close_err, "close rejected conn");
            }
            let _ = promise.settle(Err(err));
            return promise;
        }

        self.spawn_negotiation(promise.clone(), conn, Role::Responder);
        promise
    }

    /// Starts negotiating a transport for `stream_id` as the initiator.
    ///
    /// Returns without waiting for the network; the promise must be waited
    /// for or canceled.
    pub fn new_transport(&self, stream_id: &str) -> TransportPromise {
        let promise = TransportPromise::new(&self.inner.root, stream_id);
        if let Err(err) = self.register_pending(&promise) {
            let _ = promise.settle(Err(err));
            return promise;
        }

        let conn = match self.inner.demux.get_conn(stream_id) {
            Ok(conn) => conn,
            Err(err) => {
                let _ = self.inner.registry.settle(
                    &promise,
                    Err(TransportError::DemuxGetFailed {
                        stream_id: stream_id.to_string(),
                        reason: err.to_string(),
                    }),
                );
                return promise;
            }
        };

        self.spawn_negotiation(promise.clone(), conn, Role::Initiator);
        promise
    }

    /// Cancels a transport still being negotiated for `stream_id`, waiting
    /// for it to settle, then closes the active transport if there is one.
    /// Unknown identifiers are ignored.
    pub async fn close_transport(&self, stream_id: &str) {
        if let Some(promise) = self.inner.registry.pending(stream_id) {
            promise.cancel();
            promise.done().await;
        }

        if let Some(transport) = self.inner.registry.active(stream_id) {
            self.inner.registry.remove_active(&transport);
            if let Err(err) = transport.close().await {
                error!(stream_id, error = %err, "close transport");
            }
        }
    }

    /// Closes every active transport. With `cancel_pending_on_close`, pending
    /// negotiations are canceled and awaited first.
    pub async fn close(&self) -> TransportResult<()> {
        if self.inner.config.cancel_pending_on_close {
            for promise in self.inner.registry.pending_promises() {
                promise.cancel();
                promise.done().await;
            }
        }

        let mut result = Ok(());
        for transport in self.inner.registry.drain_active() {
            if let Err(err) = transport.close().await {
                warn!(stream_id = transport.stream_id(), error = %err, "close transport");
                if result.is_ok() {
                    result = Err(err);
                }
            }
        }
        result
    }

    /// Rejects new transports, cancels every pending one, closes the active
    /// ones and waits for every background task to finish.
    pub async fn shutdown(&self) -> TransportResult<()> {
        self.inner.registry.close();
        self.inner.root.cancel();
        for promise in self.inner.registry.pending_promises() {
            promise.done().await;
        }
        let result = self.close().await;
        self.inner.tracker.close();
        self.inner.tracker.wait().await;
        debug!("transport factory stopped");
        result
    }

    pub fn transport(&self, stream_id: &str) -> Option<Arc<Transport>> {
        self.inner.registry.active(stream_id)
    }

    /// Stream identifiers currently being negotiated, sorted.
    pub fn pending_ids(&self) -> Vec<String> {
        self.inner.registry.pending_ids()
    }

    /// Stream identifiers with an active transport, sorted.
    pub fn active_ids(&self) -> Vec<String> {
        self.inner.registry.active_ids()
    }

    fn register_pending(&self, promise: &TransportPromise) -> TransportResult<()> {
        self.inner.registry.register_pending(promise)?;
        debug!(stream_id = promise.stream_id(), "pending transport registered");

        let inner = Arc::clone(&self.inner);
        let promise = promise.clone();
        self.inner.tracker.spawn(async move {
            promise.done().await;
            inner.registry.remove_pending(&promise);
        });
        Ok(())
    }

    fn spawn_negotiation(&self, promise: TransportPromise, conn: Conn, role: Role) {
        let inner = Arc::clone(&self.inner);
        self.inner
            .tracker
            .spawn(async move { inner.negotiate(promise, conn, role).await });
    }
}
