//! Builds per-stream transports over a shared physical connection.
//!
//! Every stream identifier maps to one tagged sub-connection of the outer
//! demultiplexer. A second-level demultiplexer splits that sub-connection
//! into a session channel, which carries a reliable association with a
//! metadata and a data stream, and a raw media channel. [`Factory`] keeps at
//! most one transport per stream identifier and hands out a
//! [`TransportPromise`] for each construction in flight.

mod collect;
mod config;
mod error;
mod factory;
mod negotiate;
mod promise;
mod registry;
mod sctp;
mod session;
mod transport;

#[cfg(test)]
mod test_support;

pub use collect::collect_tagged_conns;
pub use config::FactoryConfig;
pub use error::{SessionError, TransportError, TransportResult};
pub use factory::{Collaborators, Factory};
pub use negotiate::{MEDIA_TAG, SESSION_TAG};
pub use promise::TransportPromise;
pub use sctp::SctpSessionBuilder;
pub use session::{
    Association, DATA_STREAM_ID, METADATA_STREAM_ID, MessageStream, PayloadKind, Role, Session,
    SessionAssembler, SessionBuilder, SessionOptions, SessionParts, StreamSession,
    StreamSessionAssembler,
};
pub use transport::Transport;
