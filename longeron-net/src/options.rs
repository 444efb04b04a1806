//! Session configuration.

use std::time::Duration;

/// Tunables for a consistent-socket session.
///
/// # Examples
///
/// ```
/// use longeron_net::options::SessionOptions;
/// use std::time::Duration;
///
/// let opts = SessionOptions::default()
///     .with_reconnect_ivl(Duration::from_millis(50))
///     .with_send_hwm(500);
/// ```
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Initial reconnection delay after a failed connect attempt.
    ///
    /// Default: 100 ms.
    pub reconnect_ivl: Duration,

    /// Ceiling for the exponential reconnect backoff.
    ///
    /// The delay doubles on every consecutive failure up to this value and
    /// resets on success. Default: 2 s.
    pub reconnect_ivl_max: Duration,

    /// High-water mark for the pending-receive queue.
    ///
    /// Submissions past this depth fail immediately with `BufferFull`.
    /// Default: 1000 operations.
    pub recv_hwm: usize,

    /// High-water mark for the pending-send queue.
    ///
    /// Default: 1000 operations.
    pub send_hwm: usize,

    /// Bytes reserved ahead of each read syscall.
    ///
    /// Default: 512.
    pub read_chunk: usize,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            reconnect_ivl: Duration::from_millis(100),
            reconnect_ivl_max: Duration::from_secs(2),
            recv_hwm: 1000,
            send_hwm: 1000,
            read_chunk: 512,
        }
    }
}

impl SessionOptions {
    #[must_use]
    pub fn with_reconnect_ivl(mut self, ivl: Duration) -> Self {
        self.reconnect_ivl = ivl;
        self
    }

    #[must_use]
    pub fn with_reconnect_ivl_max(mut self, max: Duration) -> Self {
        self.reconnect_ivl_max = max;
        self
    }

    #[must_use]
    pub fn with_recv_hwm(mut self, hwm: usize) -> Self {
        self.recv_hwm = hwm;
        self
    }

    #[must_use]
    pub fn with_send_hwm(mut self, hwm: usize) -> Self {
        self.send_hwm = hwm;
        self
    }

    #[must_use]
    pub fn with_read_chunk(mut self, chunk: usize) -> Self {
        self.read_chunk = chunk;
        self
    }
}

/// Exponential backoff schedule for reconnect attempts.
#[derive(Debug, Clone)]
pub(crate) struct Backoff {
    base: Duration,
    cap: Duration,
    next: Duration,
}

impl Backoff {
    pub(crate) fn new(options: &SessionOptions) -> Self {
        Self {
            base: options.reconnect_ivl,
            cap: options.reconnect_ivl_max.max(options.reconnect_ivl),
            next: options.reconnect_ivl,
        }
    }

    /// Delay to wait before the next attempt; doubles up to the cap.
    pub(crate) fn advance(&mut self) -> Duration {
        let delay = self.next;
        self.next = (self.next * 2).min(self.cap);
        delay
    }

    /// Rewind to the base delay after a successful connect.
    pub(crate) fn reset(&mut self) {
        self.next = self.base;
    }
}
