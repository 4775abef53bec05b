use std::net::SocketAddr;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use transport_mux::{Conn, Demux};

use crate::collect::collect_tagged_conns;
use crate::error::{TransportError, TransportResult, describe_addr};
use crate::factory::FactoryInner;
use crate::promise::TransportPromise;
use crate::session::{DATA_STREAM_ID, METADATA_STREAM_ID, PayloadKind, Role, SessionParts};
use crate::transport::Transport;

/// Second-level tag of the sub-connection carrying the association.
pub const SESSION_TAG: &str = "s";
/// Second-level tag of the raw media sub-connection.
pub const MEDIA_TAG: &str = "m";

impl FactoryInner {
    /// Builds the transport for `promise` over `conn` and settles the promise
    /// with the result. Every failure path releases what was built so far.
    pub(crate) async fn negotiate(self: Arc<Self>, promise: TransportPromise, conn: Conn, role: Role) {
        let stream_id = promise.stream_id().to_string();
        let remote_addr = conn.remote_addr();

        let mux = match self.demux_builder.build(Arc::clone(&conn)) {
            Ok(mux) => mux,
            Err(err) => {
                if let Err(close_err) = conn.close().await {
                    debug!(stream_id = %stream_id, error = %close_err, "close stream conn");
                }
                let _ = self.registry.settle(
                    &promise,
                    Err(TransportError::SecondLevelDemuxFailed {
                        stream_id,
                        remote_addr: describe_addr(remote_addr),
                        reason: err.to_string(),
                    }),
                );
                return;
            }
        };

        // Fires when this task returns, so the guard stays armed for the
        // whole construction, association handshake included.
        let finished = CancellationToken::new();
        self.spawn_cancel_guard(&promise, Arc::clone(&mux), finished.clone());
        let _finished = finished.drop_guard();

        let mut conns = match collect_tagged_conns(
            &self.tracker,
            Arc::clone(&mux),
            &[SESSION_TAG, MEDIA_TAG],
        )
        .await
        {
            Ok(conns) => conns,
            Err(err) => {
                close_mux(mux.as_ref(), &stream_id).await;
                let _ = self.registry.settle(
                    &promise,
                    Err(TransportError::SecondLevelDemuxFailed {
                        stream_id,
                        remote_addr: describe_addr(remote_addr),
                        reason: err.to_string(),
                    }),
                );
                return;
            }
        };
        let (Some(control), Some(media)) = (conns.remove(SESSION_TAG), conns.remove(MEDIA_TAG))
        else {
            close_mux(mux.as_ref(), &stream_id).await;
            let _ = self.registry.settle(
                &promise,
                Err(TransportError::SecondLevelDemuxFailed {
                    stream_id,
                    remote_addr: describe_addr(remote_addr),
                    reason: "tagged conns missing after collection".to_string(),
                }),
            );
            return;
        };

        let built = self
            .build_transport(
                &stream_id,
                remote_addr,
                role,
                promise.context(),
                Arc::clone(&mux),
                Arc::clone(&control),
                Arc::clone(&media),
            )
            .await;

        let transport = match built {
            Ok(transport) => transport,
            Err(err) => {
                debug!(stream_id = %stream_id, %role, error = %err, "transport construction failed");
                let _ = media.close().await;
                let _ = control.close().await;
                close_mux(mux.as_ref(), &stream_id).await;
                let _ = self.registry.settle(&promise, Err(err));
                return;
            }
        };

        // A cancel requested before settlement wins even if construction got
        // here first.
        let outcome = if promise.context().is_cancelled() {
            Err(TransportError::Canceled {
                stream_id: stream_id.clone(),
            })
        } else {
            Ok(Arc::clone(&transport))
        };
        let claimed = outcome.is_ok();
        match self.registry.settle(&promise, outcome) {
            Ok(()) if claimed => {
                info!(
                    stream_id = %stream_id,
                    remote_addr = %describe_addr(remote_addr),
                    %role,
                    "transport active"
                );
                self.spawn_eviction(transport);
            }
            _ => {
                debug!(stream_id = %stream_id, "promise settled first; releasing transport");
                if let Err(err) = transport.close().await {
                    warn!(stream_id = %stream_id, error = %err, "close unclaimed transport");
                }
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn build_transport(
        &self,
        stream_id: &str,
        remote_addr: Option<SocketAddr>,
        role: Role,
        cancel: &CancellationToken,
        mux: Arc<dyn Demux>,
        control: Conn,
        media: Conn,
    ) -> TransportResult<Arc<Transport>> {
        let canceled = || TransportError::Canceled {
            stream_id: stream_id.to_string(),
        };
        let options = self.config.session;
        let started = match role {
            Role::Initiator => {
                until_canceled(cancel, self.session_builder.start_as_client(control, options)).await
            }
            Role::Responder => {
                until_canceled(cancel, self.session_builder.start_as_server(control, options)).await
            }
        };
        let association = started
            .ok_or_else(canceled)?
            .map_err(|err| TransportError::SessionNegotiationFailed {
                stream_id: stream_id.to_string(),
                remote_addr: describe_addr(remote_addr),
                role,
                reason: err.to_string(),
            })?;

        let opened = until_canceled(
            cancel,
            association.open_stream(METADATA_STREAM_ID, PayloadKind::Binary),
        )
        .await;
        let metadata = match opened {
            Some(Ok(stream)) => stream,
            None => {
                let _ = association.close().await;
                return Err(canceled());
            }
            Some(Err(err)) => {
                let _ = association.close().await;
                return Err(TransportError::StreamOpenFailed {
                    stream_id: stream_id.to_string(),
                    remote_addr: describe_addr(remote_addr),
                    stream: "metadata",
                    reason: err.to_string(),
                });
            }
        };

        let opened = until_canceled(
            cancel,
            association.open_stream(DATA_STREAM_ID, PayloadKind::Binary),
        )
        .await;
        let data = match opened {
            Some(Ok(stream)) => stream,
            None => {
                let _ = metadata.close().await;
                let _ = association.close().await;
                return Err(canceled());
            }
            Some(Err(err)) => {
                let _ = metadata.close().await;
                let _ = association.close().await;
                return Err(TransportError::StreamOpenFailed {
                    stream_id: stream_id.to_string(),
                    remote_addr: describe_addr(remote_addr),
                    stream: "data",
                    reason: err.to_string(),
                });
            }
        };

        let session = self.assembler.assemble(SessionParts {
            media,
            data,
            metadata,
        });
        Ok(Arc::new(Transport::new(
            stream_id,
            remote_addr,
            session,
            association,
            mux,
        )))
    }

    /// Settles the promise as canceled once its context is canceled, unless
    /// construction finished first. Winning the settlement tears down the
    /// second-level demultiplexer so a blocked handshake fails out.
    fn spawn_cancel_guard(
        self: &Arc<Self>,
        promise: &TransportPromise,
        mux: Arc<dyn Demux>,
        finished: CancellationToken,
    ) {
        let inner = Arc::clone(self);
        let promise = promise.clone();
        self.tracker.spawn(async move {
            tokio::select! {
                biased;
                _ = finished.cancelled() => {}
                _ = promise.context().cancelled() => {
                    let canceled = Err(TransportError::Canceled {
                        stream_id: promise.stream_id().to_string(),
                    });
                    if inner.registry.settle(&promise, canceled).is_ok() {
                        debug!(stream_id = promise.stream_id(), "transport construction canceled");
                        close_mux(mux.as_ref(), promise.stream_id()).await;
                    }
                }
            }
        });
    }

    /// Drops the transport from the active map and releases it once its
    /// session finishes.
    fn spawn_eviction(self: &Arc<Self>, transport: Arc<Transport>) {
        let inner = Arc::clone(self);
        self.tracker.spawn(async move {
            tokio::select! {
                _ = transport.session().done() => {}
                _ = inner.root.cancelled() => return,
            }
            if inner.registry.remove_active(&transport) {
                debug!(stream_id = transport.stream_id(), "transport session finished; evicted");
            }
            if let Err(err) = transport.close().await {
                debug!(stream_id = transport.stream_id(), error = %err, "close finished transport");
            }
        });
    }
}

/// Runs `fut` unless `cancel` fires first, in which case `fut` is dropped
/// and `None` is returned.
async fn until_canceled<F: Future>(cancel: &CancellationToken, fut: F) -> Option<F::Output> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => None,
        output = fut => Some(output),
    }
}

async fn close_mux(mux: &dyn Demux, stream_id: &str) {
    if let Err(err) = mux.close().await {
        debug!(stream_id, error = %err, "close second-level demux");
    }
}
