//! Default configuration values.
//!
//! Centralized default constants for use across all crates.

// ============================================================================
// Protocol Constants
// ============================================================================

/// Credential hash length (SHA-224 hex = 56 chars).
pub const HASH_LEN: usize = 56;
/// Initial capture capacity of the rewind buffer: hash (56) + CRLF + a small
/// envelope prefix. Larger envelopes flow through once buffering stops.
pub const REWIND_BUFFER_CAPACITY: usize = 128;

// ============================================================================
// Dispatch Defaults
// ============================================================================

/// Capacity of each dispatch channel (stream / mux / packet).
pub const DISPATCH_CHANNEL_CAPACITY: usize = 64;

// ============================================================================
// Timeout Defaults
// ============================================================================

/// Default handshake deadline in seconds.
pub const DEFAULT_HANDSHAKE_TIMEOUT_SECS: u64 = 10;
/// Default TLS handshake timeout in seconds.
pub const DEFAULT_TLS_HANDSHAKE_TIMEOUT_SECS: u64 = 10;
/// Default idle timeout for spliced TCP streams in seconds.
pub const DEFAULT_SPLICE_IDLE_TIMEOUT_SECS: u64 = 600;
/// Default idle timeout for packet sessions in seconds.
pub const DEFAULT_UDP_TIMEOUT_SECS: u64 = 60;

// ============================================================================
// Buffer/Size Defaults
// ============================================================================

/// Default buffer size for bidirectional splicing.
pub const DEFAULT_SPLICE_BUFFER_SIZE: usize = 32768;
/// Maximum UDP payload carried in one packet frame (8 KiB).
pub const MAX_UDP_PAYLOAD: usize = 8192;
/// Maximum domain name length in an envelope address.
pub const MAX_DOMAIN_LEN: usize = 255;

// ============================================================================
// Connection Defaults
// ============================================================================

/// Default TCP listener backlog.
pub const DEFAULT_CONNECTION_BACKLOG: u32 = 1024;

// ============================================================================
// Recorder Defaults
// ============================================================================

/// Default capacity of the connection-event recorder ring.
pub const DEFAULT_RECORD_CAPACITY: usize = 128;
