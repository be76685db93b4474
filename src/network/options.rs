use std::time::Duration;

use crate::protocol::DEFAULT_MAX_PAYLOAD;

/// Socket tuning shared by publishers and subscribers
#[derive(Debug, Clone)]
pub struct BusOptions {
    /// Delay between connection attempts while a link is down
    pub reconnect_interval: Duration,
    /// Messages queued per peer before new ones are dropped for that peer
    pub send_high_water_mark: usize,
    /// How long closing a publisher keeps delivering queued messages
    pub linger: Duration,
    /// Largest accepted frame payload
    pub max_frame_size: usize,
    /// SO_SNDBUF / SO_RCVBUF size, if set (unix only)
    pub socket_buffer_size: Option<usize>,
}

impl Default for BusOptions {
    fn default() -> Self {
        Self {
            reconnect_interval: Duration::from_millis(100),
            send_high_water_mark: 1000,
            linger: Duration::from_secs(2),
            max_frame_size: DEFAULT_MAX_PAYLOAD,
            socket_buffer_size: Some(256 * 1024),
        }
    }
}
