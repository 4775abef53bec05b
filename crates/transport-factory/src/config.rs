use std::env;

use crate::session::SessionOptions;

/// Transport factory configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FactoryConfig {
    /// Options handed to the session builder for every negotiation.
    pub session: SessionOptions,
    /// Whether `close()` also cancels transports still being negotiated.
    pub cancel_pending_on_close: bool,
}

impl FactoryConfig {
    /// Load configuration from environment variables, falling back to the
    /// defaults for anything unset or unparsable.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let max_message_size = env::var("TRANSPORT_SCTP_MAX_MESSAGE_SIZE")
            .ok()
            .and_then(|val| val.parse().ok())
            .unwrap_or(defaults.session.max_message_size);
        let max_receive_buffer_size = env::var("TRANSPORT_SCTP_MAX_RECEIVE_BUFFER")
            .ok()
            .and_then(|val| val.parse().ok())
            .unwrap_or(defaults.session.max_receive_buffer_size);
        let cancel_pending_on_close = env::var("TRANSPORT_CANCEL_PENDING_ON_CLOSE")
            .map(|value| value == "1" || value.eq_ignore_ascii_case("true"))
            .unwrap_or(defaults.cancel_pending_on_close);

        Self {
            session: SessionOptions {
                max_message_size,
                max_receive_buffer_size,
            },
            cancel_pending_on_close,
        }
    }
}

impl Default for FactoryConfig {
    fn default() -> Self {
        Self {
            session: SessionOptions::default(),
            cancel_pending_on_close: false,
        }
    }
}
