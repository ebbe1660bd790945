//! Tunables for the file-sharing core.

use std::time::Duration;

use crate::wire::DEFAULT_MAX_FRAME_LEN;

/// Default wait for a transfer response.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Default period between expiry sweeps when a TTL is set.
pub const DEFAULT_EXPIRY_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Upper bound on one framed message, in either direction.
    pub max_frame_len: u32,
    /// How long `request_file` waits for the response once the stream is open.
    pub request_timeout: Duration,
    /// Drop announced records this long after they arrived. `None` keeps them forever.
    pub available_ttl: Option<Duration>,
    pub expiry_interval: Duration,
    /// Drop a peer's announced records when the overlay reports it disconnected.
    pub forget_on_disconnect: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            available_ttl: None,
            expiry_interval: DEFAULT_EXPIRY_INTERVAL,
            forget_on_disconnect: false,
        }
    }
}
