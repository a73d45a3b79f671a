//! Tunables for one `Session`. Embedding SDKs are configured
//! programmatically by the host application rather than from a config
//! file on disk, so this is a plain struct with sensible defaults rather
//! than a `toml`-backed layer.

use std::time::Duration;

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Interval between heartbeat probes while connected.
    pub heartbeat_interval: Duration,
    /// Time to wait for a heartbeat response before declaring a timeout.
    pub heartbeat_timeout: Duration,

    /// Base delay for reconnect backoff (`delay_n = min(2^(n-1), 32) * base + jitter`).
    pub reconnect_base: Duration,
    /// Reconnect attempts before giving up; 0 means unbounded.
    pub reconnect_max_attempts: u32,

    /// Outbound queue ACK timeout before a retry is attempted.
    pub ack_timeout: Duration,
    /// Outbound queue retries before a message is reported failed.
    pub max_retry: u32,
    /// Interval of the periodic ACK-timeout sweep.
    pub ack_sweep_interval: Duration,

    /// Messages requested per incremental sync batch.
    pub sync_batch_size: u32,
    /// Receive-sequence gap (on `message.seq`) that triggers an immediate resync.
    pub sync_gap_threshold: i64,

    /// Minimum interval between outgoing "typing" frames per conversation.
    pub typing_send_interval: Duration,
    /// Delay of inactivity after which an auto "stop typing" frame is sent.
    pub typing_stop_delay: Duration,
    /// How long a received "typing" state is held before auto-expiring.
    pub typing_recv_timeout: Duration,

    /// Deadline for the authentication round-trip.
    pub auth_timeout: Duration,

    pub max_body_len: u32,
    pub max_buffer_len: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(30),
            heartbeat_timeout: Duration::from_secs(10),
            reconnect_base: Duration::from_secs(1),
            reconnect_max_attempts: 0,
            ack_timeout: Duration::from_secs(5),
            max_retry: 3,
            ack_sweep_interval: Duration::from_secs(5),
            sync_batch_size: 500,
            sync_gap_threshold: 3,
            typing_send_interval: Duration::from_secs(5),
            typing_stop_delay: Duration::from_secs(5),
            typing_recv_timeout: Duration::from_secs(8),
            auth_timeout: Duration::from_secs(30),
            max_body_len: imcore_wire::frame::DEFAULT_MAX_BODY_LEN,
            max_buffer_len: 16 * 1024 * 1024,
        }
    }
}
