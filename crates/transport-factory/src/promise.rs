use std::fmt;
use std::sync::{Arc, OnceLock};

use tokio_util::sync::CancellationToken;

use crate::error::{TransportError, TransportResult};
use crate::transport::Transport;

type Outcome = TransportResult<Arc<Transport>>;

struct PromiseInner {
    stream_id: String,
    context: CancellationToken,
    outcome: OnceLock<Outcome>,
    done: CancellationToken,
}

/// The eventual outcome of building one [`Transport`].
///
/// A promise settles exactly once. The first settlement wins, whether it is
/// a transport, a failure or a cancellation; later attempts report
/// [`TransportError::AlreadySettled`] so their caller can release whatever it
/// was about to hand over. Every holder must eventually call [`wait`] or
/// [`cancel`](Self::cancel) and observe the outcome.
///
/// [`wait`]: TransportPromise::wait
#[derive(Clone)]
pub struct TransportPromise {
    inner: Arc<PromiseInner>,
}

impl TransportPromise {
    /// Creates an unsettled promise whose context is a child of `context`.
    pub fn new(context: &CancellationToken, stream_id: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(PromiseInner {
                stream_id: stream_id.into(),
                context: context.child_token(),
                outcome: OnceLock::new(),
                done: CancellationToken::new(),
            }),
        }
    }

    pub(crate) fn failed(
        context: &CancellationToken,
        stream_id: impl Into<String>,
        err: TransportError,
    ) -> Self {
        let promise = Self::new(context, stream_id);
        let _ = promise.settle(Err(err));
        promise
    }

    pub fn stream_id(&self) -> &str {
        &self.inner.stream_id
    }

    pub fn context(&self) -> &CancellationToken {
        &self.inner.context
    }

    /// Attempts the single authoritative settlement and fires the completion
    /// signal if this call won.
    pub fn settle(&self, outcome: Outcome) -> TransportResult<()> {
        self.inner
            .outcome
            .set(outcome)
            .map_err(|_| TransportError::AlreadySettled {
                stream_id: self.inner.stream_id.clone(),
            })?;
        self.inner.done.cancel();
        Ok(())
    }

    /// Requests cancellation. The construction in flight observes it and
    /// settles the promise; this call alone settles nothing.
    pub fn cancel(&self) {
        self.inner.context.cancel();
    }

    pub fn is_settled(&self) -> bool {
        self.inner.done.is_cancelled()
    }

    /// Completion signal: resolves once the promise has settled.
    pub async fn done(&self) {
        self.inner.done.cancelled().await;
    }

    /// Waits for settlement and returns the outcome.
    pub async fn wait(self) -> TransportResult<Arc<Transport>> {
        self.done().await;
        match self.inner.outcome.get() {
            Some(outcome) => outcome.clone(),
            None => Err(TransportError::Canceled {
                stream_id: self.inner.stream_id.clone(),
            }),
        }
    }

    pub(crate) fn ptr_eq(&self, other: &TransportPromise) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for TransportPromise {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportPromise")
            .field("stream_id", &self.inner.stream_id)
            .field("settled", &self.is_settled())
            .finish()
    }
}
