/// Protocol version string advertised in the `connected` handshake.
pub const PROTOCOL_VERSION: &str = "atelier/1";

/// Capacity of a connection's outbound message queue. A full queue drops
/// the message for that one slow consumer; a closed queue tears the
/// connection down.
pub const OUTBOUND_QUEUE_SIZE: usize = 256;

/// Maximum accepted inbound WebSocket text frame size in bytes (256 KiB).
pub const MAX_MESSAGE_SIZE: usize = 262_144;

/// Metrics sampler interval in seconds. Fixed rate, no catch-up on overrun.
pub const SAMPLER_INTERVAL_SECS: u64 = 60;

/// Default HTTP/WebSocket listen port.
pub const DEFAULT_HTTP_PORT: u16 = 8080;
