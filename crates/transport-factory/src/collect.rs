use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::oneshot;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};
use transport_mux::{Conn, Demux, MuxError, MuxResult};

/// Gathers exactly one sub-connection per tag in `required` from `mux`.
///
/// Sub-connections the demultiplexer already knows are taken first; a single
/// accept loop, tracked by `tracker`, waits for the rest. Sub-connections
/// with tags outside `required` are logged and dropped without draining
/// them. Fails with the accept loop's error if the demultiplexer closes
/// before every tag has arrived.
pub async fn collect_tagged_conns(
    tracker: &TaskTracker,
    mux: Arc<dyn Demux>,
    required: &[&str],
) -> MuxResult<HashMap<String, Conn>> {
    let mut collected = HashMap::with_capacity(required.len());
    for tag in required {
        if let Ok(conn) = mux.get_conn(tag) {
            collected.insert(tag.to_string(), conn);
        }
    }

    let missing: HashSet<String> = required
        .iter()
        .filter(|tag| !collected.contains_key(**tag))
        .map(|tag| tag.to_string())
        .collect();
    if missing.is_empty() {
        return Ok(collected);
    }

    let (done_tx, done_rx) = oneshot::channel();
    let known: HashSet<String> = collected.keys().cloned().collect();
    tracker.spawn(async move {
        let result = accept_missing(mux.as_ref(), missing, known).await;
        let _ = done_tx.send(result);
    });

    let arrived = done_rx.await.map_err(|_| MuxError::Closed)??;
    collected.extend(arrived);
    Ok(collected)
}

async fn accept_missing(
    mux: &dyn Demux,
    mut missing: HashSet<String>,
    known: HashSet<String>,
) -> MuxResult<HashMap<String, Conn>> {
    let mut arrived = HashMap::with_capacity(missing.len());
    while !missing.is_empty() {
        let conn = mux.accept_conn().await?;
        let tag = conn.tag().to_string();
        if missing.remove(&tag) {
            arrived.insert(tag, conn);
        } else if known.contains(&tag) || arrived.contains_key(&tag) {
            debug!(tag = %tag, "sub-connection already collected");
        } else {
            // TODO: drain unexpected sub-connections so a chatty peer cannot
            // back up the shared link while they sit unread.
            warn!(
                tag = %tag,
                remote_addr = ?conn.remote_addr(),
                "unexpected sub-connection"
            );
        }
    }
    Ok(arrived)
}
