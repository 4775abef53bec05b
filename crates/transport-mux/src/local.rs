use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{Conn, Demux, DemuxBuilder, MuxError, MuxResult, SubConn};

type RemoteAddr = Arc<RwLock<Option<SocketAddr>>>;

/// One end of an in-memory tagged channel. Both ends share the close token,
/// so closing either end tears the channel down.
struct LocalConn {
    tag: String,
    remote_addr: RemoteAddr,
    outbound: mpsc::UnboundedSender<Bytes>,
    inbound: AsyncMutex<mpsc::UnboundedReceiver<Bytes>>,
    closed: CancellationToken,
}

impl LocalConn {
    fn pair(tag: &str, addrs: [RemoteAddr; 2]) -> [Arc<LocalConn>; 2] {
        let [first_addr, second_addr] = addrs;
        let (first_tx, first_rx) = mpsc::unbounded_channel();
        let (second_tx, second_rx) = mpsc::unbounded_channel();
        let closed = CancellationToken::new();
        let first = LocalConn {
            tag: tag.to_string(),
            remote_addr: first_addr,
            outbound: first_tx,
            inbound: AsyncMutex::new(second_rx),
            closed: closed.clone(),
        };
        let second = LocalConn {
            tag: tag.to_string(),
            remote_addr: second_addr,
            outbound: second_tx,
            inbound: AsyncMutex::new(first_rx),
            closed,
        };
        [Arc::new(first), Arc::new(second)]
    }

    fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }
}

#[async_trait]
impl SubConn for LocalConn {
    fn tag(&self) -> &str {
        &self.tag
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        *self.remote_addr.read()
    }

    async fn read(&self, buf: &mut [u8]) -> MuxResult<usize> {
        let mut inbound = self.inbound.lock().await;
        tokio::select! {
            biased;
            _ = self.closed.cancelled() => Err(MuxError::ConnClosed(self.tag.clone())),
            packet = inbound.recv() => {
                let packet = packet.ok_or_else(|| MuxError::ConnClosed(self.tag.clone()))?;
                let len = packet.len().min(buf.len());
                buf[..len].copy_from_slice(&packet[..len]);
                Ok(len)
            }
        }
    }

    async fn write(&self, buf: &[u8]) -> MuxResult<usize> {
        if self.is_closed() {
            return Err(MuxError::ConnClosed(self.tag.clone()));
        }
        self.outbound
            .send(Bytes::copy_from_slice(buf))
            .map_err(|_| MuxError::ConnClosed(self.tag.clone()))?;
        Ok(buf.len())
    }

    async fn close(&self) -> MuxResult<()> {
        self.closed.cancel();
        Ok(())
    }

    async fn closed(&self) {
        self.closed.cancelled().await;
    }
}

struct Side {
    conns: HashMap<String, Arc<LocalConn>>,
    accept_tx: mpsc::UnboundedSender<Conn>,
    remote_addr: RemoteAddr,
    closed: CancellationToken,
}

struct Link {
    sides: Mutex<[Side; 2]>,
}

struct LocalMuxInner {
    link: Arc<Link>,
    side: usize,
    accept_rx: AsyncMutex<mpsc::UnboundedReceiver<Conn>>,
    closed: CancellationToken,
    carrier: Mutex<Option<Conn>>,
}

/// In-memory demultiplexer. [`LocalMux::pair`] returns two ends of one
/// simulated physical connection: a sub-connection obtained with
/// [`Demux::get_conn`] on one end is announced to `accept_conn` on the other.
#[derive(Clone)]
pub struct LocalMux {
    inner: Arc<LocalMuxInner>,
}

impl LocalMux {
    pub fn pair() -> (LocalMux, LocalMux) {
        Self::pair_with_addrs(None, None)
    }

    /// `first_remote` is the peer address reported by sub-connections of the
    /// first end, `second_remote` likewise for the second end.
    pub fn pair_with_addrs(
        first_remote: Option<SocketAddr>,
        second_remote: Option<SocketAddr>,
    ) -> (LocalMux, LocalMux) {
        let (first_tx, first_rx) = mpsc::unbounded_channel();
        let (second_tx, second_rx) = mpsc::unbounded_channel();
        let first_closed = CancellationToken::new();
        let second_closed = CancellationToken::new();
        let link = Arc::new(Link {
            sides: Mutex::new([
                Side {
                    conns: HashMap::new(),
                    accept_tx: first_tx,
                    remote_addr: Arc::new(RwLock::new(first_remote)),
                    closed: first_closed.clone(),
                },
                Side {
                    conns: HashMap::new(),
                    accept_tx: second_tx,
                    remote_addr: Arc::new(RwLock::new(second_remote)),
                    closed: second_closed.clone(),
                },
            ]),
        });
        let first = LocalMux::end(Arc::clone(&link), 0, first_rx, first_closed);
        let second = LocalMux::end(link, 1, second_rx, second_closed);
        (first, second)
    }

    fn end(
        link: Arc<Link>,
        side: usize,
        accept_rx: mpsc::UnboundedReceiver<Conn>,
        closed: CancellationToken,
    ) -> LocalMux {
        LocalMux {
            inner: Arc::new(LocalMuxInner {
                link,
                side,
                accept_rx: AsyncMutex::new(accept_rx),
                closed,
                carrier: Mutex::new(None),
            }),
        }
    }

    /// Binds this end to the sub-connection it is layered over: the carrier's
    /// peer address is reported by every sub-connection and the carrier is
    /// closed together with this end.
    fn attach_carrier(&self, carrier: Conn) {
        {
            let sides = self.inner.link.sides.lock();
            *sides[self.inner.side].remote_addr.write() = carrier.remote_addr();
        }
        *self.inner.carrier.lock() = Some(carrier);
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.is_cancelled()
    }
}

#[async_trait]
impl Demux for LocalMux {
    async fn accept_conn(&self) -> MuxResult<Conn> {
        let mut accept_rx = self.inner.accept_rx.lock().await;
        tokio::select! {
            biased;
            _ = self.inner.closed.cancelled() => Err(MuxError::Closed),
            conn = accept_rx.recv() => conn.ok_or(MuxError::Closed),
        }
    }

    fn get_conn(&self, tag: &str) -> MuxResult<Conn> {
        let side = self.inner.side;
        let peer = 1 - side;
        let mut sides = self.inner.link.sides.lock();
        if sides[side].closed.is_cancelled() {
            return Err(MuxError::Closed);
        }
        if let Some(conn) = sides[side].conns.get(tag) {
            if !conn.is_closed() {
                let conn: Conn = conn.clone();
                return Ok(conn);
            }
        }

        let mut addrs = [
            Arc::clone(&sides[0].remote_addr),
            Arc::clone(&sides[1].remote_addr),
        ];
        if side == 1 {
            addrs.swap(0, 1);
        }
        let [local, remote] = LocalConn::pair(tag, addrs);
        sides[side].conns.insert(tag.to_string(), Arc::clone(&local));
        if !sides[peer].closed.is_cancelled() {
            sides[peer].conns.insert(tag.to_string(), Arc::clone(&remote));
            let _ = sides[peer].accept_tx.send(remote as Conn);
        }
        Ok(local as Conn)
    }

    async fn close(&self) -> MuxResult<()> {
        let conns: Vec<Arc<LocalConn>> = {
            let mut sides = self.inner.link.sides.lock();
            let own = &mut sides[self.inner.side];
            if own.closed.is_cancelled() {
                return Ok(());
            }
            own.closed.cancel();
            own.conns.drain().map(|(_, conn)| conn).collect()
        };
        for conn in conns {
            conn.closed.cancel();
        }
        let carrier = self.inner.carrier.lock().take();
        if let Some(carrier) = carrier {
            debug!(tag = carrier.tag(), "closing carrier sub-connection");
            carrier.close().await?;
        }
        Ok(())
    }
}

/// Builds second-level [`LocalMux`]es. Both builders of a pair hand out the
/// two ends of the same in-memory link for a given carrier tag, standing in
/// for a wire-level demultiplexer running over the carrier.
#[derive(Clone)]
pub struct LocalMuxBuilder {
    shared: Arc<Mutex<HashMap<String, [Option<LocalMux>; 2]>>>,
    side: usize,
}

impl LocalMuxBuilder {
    pub fn pair() -> (LocalMuxBuilder, LocalMuxBuilder) {
        let shared = Arc::new(Mutex::new(HashMap::new()));
        (
            LocalMuxBuilder {
                shared: Arc::clone(&shared),
                side: 0,
            },
            LocalMuxBuilder { shared, side: 1 },
        )
    }
}

impl DemuxBuilder for LocalMuxBuilder {
    fn build(&self, conn: Conn) -> MuxResult<Arc<dyn Demux>> {
        let mux = {
            let mut halves = self.shared.lock();
            let tag = conn.tag().to_string();
            let slot = halves.entry(tag.clone()).or_insert_with(|| [None, None]);
            if slot[self.side].is_none() {
                let (first, second) = LocalMux::pair();
                *slot = [Some(first), Some(second)];
            }
            let mux = slot[self.side].take().ok_or(MuxError::Closed)?;
            if slot.iter().all(Option::is_none) {
                halves.remove(&tag);
            }
            mux
        };
        mux.attach_carrier(conn);
        Ok(Arc::new(mux) as Arc<dyn Demux>)
    }
}
