#![allow(dead_code)]

use std::sync::Arc;
use std::sync::Once;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{Notify, mpsc};
use tokio::time::{Instant, sleep};
use tracing_subscriber::EnvFilter;
use transport_factory::{
    Association, Collaborators, Factory, FactoryConfig, MessageStream, PayloadKind, Role,
    Session, SessionAssembler, SessionBuilder, SessionError, SessionOptions, SessionParts,
    StreamSessionAssembler, TransportPromise,
};
use transport_mux::{Conn, Demux, LocalMux, LocalMuxBuilder};

static TRACING: Once = Once::new();

pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
            )
            .with_test_writer()
            .try_init();
    });
}

/// What the scripted builder does once a negotiation reaches it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Script {
    Succeed,
    Fail,
    /// Reads the session conn until it closes, then fails.
    BlockUntilClosed,
}

pub struct ScriptedSessionBuilder {
    script: Mutex<Script>,
    roles: Mutex<Vec<Role>>,
    blocked: Notify,
}

impl ScriptedSessionBuilder {
    pub fn new(script: Script) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script),
            roles: Mutex::new(Vec::new()),
            blocked: Notify::new(),
        })
    }

    pub fn set_script(&self, script: Script) {
        *self.script.lock() = script;
    }

    pub fn roles(&self) -> Vec<Role> {
        self.roles.lock().clone()
    }

    /// Resolves once a negotiation is blocked inside the builder.
    pub async fn blocked(&self) {
        self.blocked.notified().await;
    }

    async fn run(&self, conn: Conn, role: Role) -> Result<Arc<dyn Association>, SessionError> {
        self.roles.lock().push(role);
        let script = *self.script.lock();
        match script {
            Script::Succeed => Ok(Arc::new(FakeAssociation) as Arc<dyn Association>),
            Script::Fail => Err(SessionError::Protocol("handshake rejected".into())),
            Script::BlockUntilClosed => {
                self.blocked.notify_one();
                let mut buf = [0u8; 16];
                loop {
                    conn.read(&mut buf).await?;
                }
            }
        }
    }
}

#[async_trait]
impl SessionBuilder for ScriptedSessionBuilder {
    async fn start_as_server(
        &self,
        conn: Conn,
        _options: SessionOptions,
    ) -> Result<Arc<dyn Association>, SessionError> {
        self.run(conn, Role::Responder).await
    }

    async fn start_as_client(
        &self,
        conn: Conn,
        _options: SessionOptions,
    ) -> Result<Arc<dyn Association>, SessionError> {
        self.run(conn, Role::Initiator).await
    }
}

struct FakeStream(u16);

#[async_trait]
impl MessageStream for FakeStream {
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

struct FakeAssociation;

#[async_trait]
impl Association for FakeAssociation {
    async fn open_stream(
        &self,
        stream_id: u16,
        _kind: PayloadKind,
    ) -> Result<Arc<dyn MessageStream>, SessionError> {
        Ok(Arc::new(FakeStream(stream_id)) as Arc<dyn MessageStream>)
    }

    async fn close(&self) -> Result<(), SessionError> {
        Ok(())
    }
}

/// Assembles plain stream sessions and hands the metadata and data streams
/// to the test.
pub struct CapturingAssembler {
    streams: mpsc::UnboundedSender<(Arc<dyn MessageStream>, Arc<dyn MessageStream>)>,
}

impl CapturingAssembler {
    pub fn new() -> (
        Arc<Self>,
        mpsc::UnboundedReceiver<(Arc<dyn MessageStream>, Arc<dyn MessageStream>)>,
    ) {
        let (streams, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { streams }), rx)
    }
}

impl SessionAssembler for CapturingAssembler {
    fn assemble(&self, parts: SessionParts) -> Arc<dyn Session> {
        let _ = self
            .streams
            .send((Arc::clone(&parts.metadata), Arc::clone(&parts.data)));
        StreamSessionAssembler.assemble(parts)
    }
}

/// Association that records its own teardown and that of its streams.
/// Opening `stall_stream` never completes.
pub struct RecordingAssociation {
    stall_stream: Option<u16>,
    stalled: Notify,
    closed: AtomicBool,
    closed_streams: Arc<Mutex<Vec<u16>>>,
}

impl RecordingAssociation {
    pub fn new(stall_stream: Option<u16>) -> Arc<Self> {
        Arc::new(Self {
            stall_stream,
            stalled: Notify::new(),
            closed: AtomicBool::new(false),
            closed_streams: Arc::new(Mutex::new(Vec::new())),
        })
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn closed_streams(&self) -> Vec<u16> {
        self.closed_streams.lock().clone()
    }

    /// Resolves once construction is stuck opening `stall_stream`.
    pub async fn stalled(&self) {
        self.stalled.notified().await;
    }
}

#[async_trait]
impl Association for RecordingAssociation {
    async fn open_stream(
        &self,
        stream_id: u16,
        _kind: PayloadKind,
    ) -> Result<Arc<dyn MessageStream>, SessionError> {
        if self.stall_stream == Some(stream_id) {
            self.stalled.notify_one();
            std::future::pending::<()>().await;
        }
        Ok(Arc::new(RecordingStream {
            id: stream_id,
            closed_streams: Arc::clone(&self.closed_streams),
        }) as Arc<dyn MessageStream>)
    }

    async fn close(&self) -> Result<(), SessionError> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}

struct RecordingStream {
    id: u16,
    closed_streams: Arc<Mutex<Vec<u16>>>,
}

#[async_trait]
impl MessageStream for RecordingStream {
    fn stream_id(&self) -> u16 {
        self.id
    }

    async fn read(&self, _buf: &mut [u8]) -> Result<usize, SessionError> {
        Err(SessionError::Closed)
    }

    async fn write(&self, payload: Bytes) -> Result<usize, SessionError> {
        Ok(payload.len())
    }

    async fn close(&self) -> Result<(), SessionError> {
        self.closed_streams.lock().push(self.id);
        Ok(())
    }
}

/// Hands out the same recording association to every negotiation.
pub struct RecordingSessionBuilder {
    association: Arc<RecordingAssociation>,
}

impl RecordingSessionBuilder {
    pub fn new(association: Arc<RecordingAssociation>) -> Arc<Self> {
        Arc::new(Self { association })
    }
}

#[async_trait]
impl SessionBuilder for RecordingSessionBuilder {
    async fn start_as_server(
        &self,
        _conn: Conn,
        _options: SessionOptions,
    ) -> Result<Arc<dyn Association>, SessionError> {
        Ok(Arc::clone(&self.association) as Arc<dyn Association>)
    }

    async fn start_as_client(
        &self,
        _conn: Conn,
        _options: SessionOptions,
    ) -> Result<Arc<dyn Association>, SessionError> {
        Ok(Arc::clone(&self.association) as Arc<dyn Association>)
    }
}

/// Cancels the armed promise while its session is being assembled, and
/// keeps every session it assembled.
pub struct CancelingAssembler {
    promise: Mutex<Option<TransportPromise>>,
    sessions: Mutex<Vec<Arc<dyn Session>>>,
}

impl CancelingAssembler {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            promise: Mutex::new(None),
            sessions: Mutex::new(Vec::new()),
        })
    }

    pub fn arm(&self, promise: TransportPromise) {
        *self.promise.lock() = Some(promise);
    }

    pub fn sessions(&self) -> Vec<Arc<dyn Session>> {
        self.sessions.lock().clone()
    }
}

impl SessionAssembler for CancelingAssembler {
    fn assemble(&self, parts: SessionParts) -> Arc<dyn Session> {
        if let Some(promise) = self.promise.lock().as_ref() {
            promise.cancel();
        }
        let session = StreamSessionAssembler.assemble(parts);
        self.sessions.lock().push(Arc::clone(&session));
        session
    }
}

/// Two factories joined by an in-memory physical connection.
pub struct FactoryPair {
    pub local: Factory,
    pub remote: Factory,
    pub local_demux: LocalMux,
    pub remote_demux: LocalMux,
}

pub fn factory_pair(
    config: FactoryConfig,
    local_builder: Arc<dyn SessionBuilder>,
    remote_builder: Arc<dyn SessionBuilder>,
) -> FactoryPair {
    factory_pair_with(config, |_, collaborators| collaborators, local_builder, remote_builder)
}

/// Like [`factory_pair`], letting the caller adjust each side's
/// collaborators; the closure sees `true` for the local side.
pub fn factory_pair_with(
    config: FactoryConfig,
    adjust: impl Fn(bool, Collaborators) -> Collaborators,
    local_builder: Arc<dyn SessionBuilder>,
    remote_builder: Arc<dyn SessionBuilder>,
) -> FactoryPair {
    let (local_demux, remote_demux) = LocalMux::pair_with_addrs(
        Some("10.0.0.2:5000".parse().expect("addr")),
        Some("10.0.0.1:5000".parse().expect("addr")),
    );
    let (local_mux_builder, remote_mux_builder) = LocalMuxBuilder::pair();
    let local = Factory::new(
        config.clone(),
        adjust(
            true,
            Collaborators::new(
                Arc::new(local_demux.clone()) as Arc<dyn Demux>,
                Arc::new(local_mux_builder),
                local_builder,
            ),
        ),
    );
    let remote = Factory::new(
        config,
        adjust(
            false,
            Collaborators::new(
                Arc::new(remote_demux.clone()) as Arc<dyn Demux>,
                Arc::new(remote_mux_builder),
                remote_builder,
            ),
        ),
    );
    FactoryPair {
        local,
        remote,
        local_demux,
        remote_demux,
    }
}

/// A single factory whose peer never answers.
pub fn lone_factory(config: FactoryConfig, builder: Arc<dyn SessionBuilder>) -> (Factory, LocalMux) {
    let pair = factory_pair(config, builder, ScriptedSessionBuilder::new(Script::Fail));
    (pair.local, pair.local_demux)
}

/// Like [`lone_factory`], with a custom session assembler.
pub fn lone_factory_with(
    config: FactoryConfig,
    builder: Arc<dyn SessionBuilder>,
    assembler: Arc<dyn SessionAssembler>,
) -> (Factory, LocalMux) {
    let pair = factory_pair_with(
        config,
        move |is_local, collaborators| {
            if is_local {
                collaborators.with_assembler(Arc::clone(&assembler))
            } else {
                collaborators
            }
        },
        builder,
        ScriptedSessionBuilder::new(Script::Fail),
    );
    (pair.local, pair.local_demux)
}

pub async fn wait_until(mut condition: impl FnMut() -> bool, timeout: Duration) {
    let deadline = Instant::now() + timeout;
    while !condition() {
        assert!(Instant::now() < deadline, "condition not met in time");
        sleep(Duration::from_millis(10)).await;
    }
}
