/// Session configuration
///
/// All protocol tunables live in an immutable [`SessionConfig`] handed to the
/// session at open time, so sessions with different tunings can coexist in
/// one process. Defaults come from the crate level constants.
use std::time::Duration;

use crate::errors::{Result, SqaError};

/// Immutable per-session configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// Protocol version announced in the handshake and stamped on every packet
    pub version: u8,

    /// Local UDP port used by [`crate::session::Session::connect`]
    pub port: u16,

    /// Interval between a transmission and its retransmission
    pub retransmit_timeout: Duration,

    /// Number of retransmissions before a send is reported as exhausted
    pub max_retries: u32,

    /// How long to wait for a handshake answer before repeating HELLO
    pub handshake_timeout: Duration,

    /// First sequence number used by this side; random when `None`
    pub initial_sequence: Option<u32>,

    /// Suppress redelivery of DATA packets whose sequence number was already seen
    pub deduplicate: bool,

    /// Number of recent sequence numbers remembered for deduplication
    pub dedup_window: usize,
}

impl SessionConfig {
    pub fn builder() -> SessionConfigBuilder {
        SessionConfigBuilder::new()
    }

    /// Reject configurations the session cannot operate with
    pub fn validate(&self) -> Result<()> {
        if self.retransmit_timeout.is_zero() {
            return Err(SqaError::InvalidConfig("retransmit timeout must be non-zero".to_string()));
        }
        if self.handshake_timeout.is_zero() {
            return Err(SqaError::InvalidConfig("handshake timeout must be non-zero".to_string()));
        }
        if self.deduplicate && self.dedup_window == 0 {
            return Err(SqaError::InvalidConfig(
                "deduplication requires a non-empty window".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfigBuilder::new().build()
    }
}

/// SessionConfigBuilder - Fluent interface for session configuration
pub struct SessionConfigBuilder {
    config: SessionConfig,
}

impl SessionConfigBuilder {
    /// Create a new builder with the protocol defaults
    pub fn new() -> Self {
        let retransmit_timeout = Duration::from_millis(crate::RETRANSMIT_TIMEOUT_MS);
        Self {
            config: SessionConfig {
                version: crate::SQA_VERSION,
                port: crate::SQA_DEFAULT_PORT,
                retransmit_timeout,
                max_retries: crate::MAX_RETRIES,
                handshake_timeout: retransmit_timeout,
                initial_sequence: None,
                deduplicate: false,
                dedup_window: 1024,
            },
        }
    }

    pub fn with_version(mut self, version: u8) -> Self {
        self.config.version = version;
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.config.port = port;
        self
    }

    /// Set the retransmit timeout; the handshake timeout follows unless set explicitly
    pub fn with_retransmit_timeout(mut self, timeout: Duration) -> Self {
        if self.config.handshake_timeout == self.config.retransmit_timeout {
            self.config.handshake_timeout = timeout;
        }
        self.config.retransmit_timeout = timeout;
        self
    }

    pub fn with_retransmit_timeout_ms(self, timeout_ms: u64) -> Self {
        self.with_retransmit_timeout(Duration::from_millis(timeout_ms))
    }

    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.config.max_retries = retries;
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.config.handshake_timeout = timeout;
        self
    }

    pub fn with_initial_sequence(mut self, sequence: u32) -> Self {
        self.config.initial_sequence = Some(sequence);
        self
    }

    pub fn with_deduplication(mut self, window: usize) -> Self {
        self.config.deduplicate = true;
        self.config.dedup_window = window;
        self
    }

    pub fn build(self) -> SessionConfig {
        self.config
    }
}

impl Default for SessionConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
