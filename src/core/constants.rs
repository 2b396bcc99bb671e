//! Protocol constants for the TETHER secured socket layer.
//!
//! These values are fixed by the wire protocol and MUST NOT be changed.

use std::time::Duration;

// =============================================================================
// WIRE FORMAT
// =============================================================================

/// Protocol header sent once before the first handshake frame.
///
/// Distinguishes a fresh connection's handshake traffic from steady-state
/// frames; the server never echoes it back.
pub const PROTOCOL_HEADER: [u8; 4] = *b"TET\x01";

/// Width of the frame length prefix (big-endian).
pub const FRAME_LEN_SIZE: usize = 3;

/// Maximum frame body size representable by the 3-byte length prefix.
pub const MAX_FRAME_SIZE: usize = (1 << 24) - 1;

// =============================================================================
// CRYPTOGRAPHIC CONSTANTS
// =============================================================================

/// Noise handshake pattern. XX: the client learns the server static key
/// in-band rather than pinning it up front.
pub const NOISE_PATTERN: &str = "Noise_XX_25519_ChaChaPoly_BLAKE2s";

/// Poly1305 authentication tag size.
pub const AEAD_TAG_SIZE: usize = 16;

/// XChaCha20 nonce size.
pub const AEAD_NONCE_SIZE: usize = 24;

/// X25519 public key size.
pub const PUBLIC_KEY_SIZE: usize = 32;

/// X25519 private key size.
pub const PRIVATE_KEY_SIZE: usize = 32;

/// Noise handshake hash size (BLAKE2s).
pub const HASH_SIZE: usize = 32;

/// Session (transport) key size.
pub const SESSION_KEY_SIZE: usize = 32;

/// Nonce direction byte: client -> server.
pub const NONCE_DIR_CLIENT: u8 = 0x00;

/// Nonce direction byte: server -> client.
pub const NONCE_DIR_SERVER: u8 = 0x01;

// =============================================================================
// TIMING
// =============================================================================

/// Default timeout for the transport open + handshake exchange, and for
/// individual sends.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(20);

/// Default timeout for a tagged query awaiting its reply.
pub const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_secs(60);

/// Interval between liveness probes while the session is ready.
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

/// Base value for the rate-limit backoff window.
pub const DEFAULT_BACKOFF_BASE: Duration = Duration::from_secs(1);

/// Hard cap on the rate-limit backoff window, regardless of the configured
/// base value.
pub const MAX_RATE_LIMIT_BACKOFF: Duration = Duration::from_secs(30);

// =============================================================================
// KEY MATERIAL
// =============================================================================

/// Number of one-time prekeys uploaded in one republish batch.
pub const PREKEY_BATCH_SIZE: usize = 30;

/// Key-store namespace for one-time prekeys.
pub const PREKEY_NAMESPACE: &str = "prekey";

/// Key-store key holding the next unused prekey id.
pub const PREKEY_NEXT_ID: &str = "prekey.next-id";
