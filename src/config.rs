//! Engine configuration

use std::time::Duration;

/// Request handler configuration
#[derive(Debug, Clone)]
pub struct HandlerConfig {
    /// Upper bound on one selector poll. The registration snapshot and the
    /// shutdown flag are refreshed at least this often.
    pub poll_timeout: Duration,
    /// Readiness events fetched per poll.
    pub events_capacity: usize,
    /// Initial per-connection read buffer.
    pub read_buffer_size: usize,
    /// Stop draining a socket once this many undecoded bytes are buffered.
    pub max_buffered_bytes: usize,
    /// SO_SNDBUF / SO_RCVBUF applied to each registered socket.
    pub socket_buffer_size: Option<usize>,
    /// TCP_NODELAY on each registered socket.
    pub nodelay: bool,
}

impl Default for HandlerConfig {
    fn default() -> Self {
        Self {
            poll_timeout: Duration::from_secs(1),
            events_capacity: 1024,
            read_buffer_size: 64 * 1024, // 64KB
            max_buffered_bytes: 4 * 1024 * 1024,
            socket_buffer_size: None,
            nodelay: true,
        }
    }
}

impl HandlerConfig {
    pub fn with_poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = timeout;
        self
    }

    pub fn with_events_capacity(mut self, capacity: usize) -> Self {
        self.events_capacity = capacity.max(1);
        self
    }

    pub fn with_read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = size.max(512);
        self
    }

    pub fn with_max_buffered_bytes(mut self, size: usize) -> Self {
        self.max_buffered_bytes = size;
        self
    }

    pub fn with_socket_buffer_size(mut self, size: Option<usize>) -> Self {
        self.socket_buffer_size = size;
        self
    }

    pub fn with_nodelay(mut self, nodelay: bool) -> Self {
        self.nodelay = nodelay;
        self
    }
}

/// Write selector configuration
#[derive(Debug, Clone)]
pub struct WriterConfig {
    pub poll_timeout: Duration,
    pub events_capacity: usize,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            poll_timeout: Duration::from_millis(500),
            events_capacity: 1024,
        }
    }
}

impl WriterConfig {
    pub fn with_poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = timeout;
        self
    }

    pub fn with_events_capacity(mut self, capacity: usize) -> Self {
        self.events_capacity = capacity.max(1);
        self
    }
}
