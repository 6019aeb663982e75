//! Error taxonomy for the bridge
//!
//! - [`UsageError`]: host programming mistakes and resource exhaustion. These are
//!   never propagated as failures of a host call; they go to the diagnostic
//!   channel (see [`crate::diagnostics`]).
//! - [`BridgeError`]: failures surfaced synchronously from session init/shutdown,
//!   where the host decides whether tracing is mandatory.
//! - [`DecodeError`]: consumer-side failures while reading an event stream.
//!
//! Transport errors never appear here: they stay inside the worker thread and
//! drive its reconnect policy.

use serde::Serialize;
use thiserror::Error;

/// Host usage errors reported through the diagnostic channel
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum UsageError {
    #[error("zone opened on thread {owner} was ended on thread {caller}")]
    ZoneEndOnWrongThread { owner: u32, caller: u32 },

    #[error("zone at depth {actual} ended while depth {expected} is innermost (LIFO violation)")]
    ZoneEndOutOfOrder { expected: u32, actual: u32 },

    #[error("zone at depth {depth} ended but no zone is open on this thread")]
    ZoneEndWithoutBegin { depth: u32 },

    #[error("zone nesting exceeded the configured maximum depth of {max}")]
    ZoneDepthExceeded { max: u32 },

    #[error("a tracing session is already active (session {session})")]
    AlreadyInitialized { session: u64 },

    #[error("free of address {address:#x} with no recorded allocation")]
    UnmatchedFree { address: u64 },

    #[error("string argument is not valid UTF-8")]
    InvalidUtf8,
}

impl UsageError {
    /// Number of distinct kinds, used to size per-kind counters
    pub const KIND_COUNT: usize = 7;

    /// Stable index of this error kind
    pub fn kind_index(&self) -> usize {
        match self {
            UsageError::ZoneEndOnWrongThread { .. } => 0,
            UsageError::ZoneEndOutOfOrder { .. } => 1,
            UsageError::ZoneEndWithoutBegin { .. } => 2,
            UsageError::ZoneDepthExceeded { .. } => 3,
            UsageError::AlreadyInitialized { .. } => 4,
            UsageError::UnmatchedFree { .. } => 5,
            UsageError::InvalidUtf8 => 6,
        }
    }

    /// Short stable name of this error kind
    pub fn kind_name(&self) -> &'static str {
        match self {
            UsageError::ZoneEndOnWrongThread { .. } => "zone_end_on_wrong_thread",
            UsageError::ZoneEndOutOfOrder { .. } => "zone_end_out_of_order",
            UsageError::ZoneEndWithoutBegin { .. } => "zone_end_without_begin",
            UsageError::ZoneDepthExceeded { .. } => "zone_depth_exceeded",
            UsageError::AlreadyInitialized { .. } => "already_initialized",
            UsageError::UnmatchedFree { .. } => "unmatched_free",
            UsageError::InvalidUtf8 => "invalid_utf8",
        }
    }
}

/// Errors surfaced synchronously by session lifecycle operations
#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("tracing session {0} is already active")]
    AlreadyInitialized(u64),

    #[error("no tracing session is active")]
    NotInitialized,

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("failed to spawn serializer thread: {0}")]
    SpawnFailed(#[source] std::io::Error),

    #[error("serializer thread panicked")]
    WorkerPanicked,

    #[error(transparent)]
    Config(#[from] anyhow::Error),
}

/// Result type for session lifecycle operations
pub type Result<T> = std::result::Result<T, BridgeError>;

/// Errors while decoding an event stream
#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("record truncated: needed more bytes at offset {0}")]
    Truncated(usize),

    #[error("unknown event kind {0:#04x}")]
    UnknownEventKind(u8),

    #[error("unknown frame tag {0:#04x}")]
    UnknownFrame(u8),

    #[error("varint overflows 64 bits at offset {0}")]
    VarintOverflow(usize),

    #[error("stream does not start with the megatrace magic")]
    BadMagic,

    #[error("unsupported protocol version {found} (expected {expected})")]
    UnsupportedVersion { expected: u16, found: u16 },

    #[error("frame of {0} bytes exceeds the maximum frame size")]
    FrameTooLarge(u32),

    #[error("events frame declared {declared} records but contained {found}")]
    RecordCountMismatch { declared: u64, found: u64 },

    #[error("invalid frame payload: {0}")]
    Payload(#[from] rmp_serde::decode::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
