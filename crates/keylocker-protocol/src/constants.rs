// ============================================================================
// Protocol constants
// ============================================================================

/// Envelope format version carried in every envelope.
pub const PROTOCOL_VERSION: &str = "1.0.0";

/// Client version string stamped into outbound envelopes.
pub const CLIENT_VERSION: &str = concat!("keylocker-node/", env!("CARGO_PKG_VERSION"));

// --- Stream protocols -------------------------------------------------------

/// Stream protocol carrying one relayed get-key request envelope.
pub const GET_KEY_REQUEST: &str = "/getkeyreq/0.0.1";

/// Stream protocol carrying one get-key response envelope.
pub const GET_KEY_RESPONSE: &str = "/getkeyresp/0.0.1";

/// Identify protocol prefix; the rendezvous string is appended.
pub const IDENTIFY_PROTOCOL_PREFIX: &str = "/keylocker/";

/// Acknowledgement written back on every accepted stream.
pub const ACK: &[u8] = b"ACK";

// --- Transport --------------------------------------------------------------

/// Maximum encoded envelope size in bytes.
pub const MAX_MESSAGE_SIZE: usize = 65_536; // 64 KB

/// Freshness window for a peer's addresses after a successful connect (12 h).
pub const PEER_ADDR_TTL_SECS: u64 = 12 * 60 * 60;

/// Connection manager: trim down to this many connections.
pub const CONN_LOW_WATER: usize = 100;

/// Connection manager: start trimming above this many connections.
pub const CONN_HIGH_WATER: usize = 400;

/// Connection manager: fresh connections are never trimmed within this window.
pub const CONN_GRACE_SECS: u64 = 60;

// --- Fault tolerance --------------------------------------------------------

/// Default number of peers tried when relaying a get-key request.
pub const DEFAULT_FAULT_TOLERANCE_TIMES: usize = 3;

/// Interval of the caller-side ticker while waiting for a relayed response.
pub const RELAY_POLL_INTERVAL_SECS: u64 = 3;

// --- Application ------------------------------------------------------------

/// Message returned for requests naming a chain with no registered adaptor.
pub const UNSUPPORTED_OPERATION: &str = "Unsupported Operation";
