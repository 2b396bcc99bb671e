//! TETHER Protocol - Transport Layer
//!
//! Everything between the raw byte stream and decoded structured payloads:
//!
//! - **Frame codec / handshake engine**: [`FrameCodec`] - length-prefixed
//!   framing, Noise handshake driving, per-frame AEAD
//! - **Endpoint validation**: [`Endpoint`] - fail-fast scheme/mode checks and
//!   the routing query parameter
//! - **In-memory adapter**: [`MemoryTransport`] - stand-in [`crate::core::Transport`]
//!   implementation for harnesses and tests
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │           Session Layer                 │
//! ├─────────────────────────────────────────┤
//! │          Transport Layer                │  ← This module
//! │   framing, handshake, endpoint checks   │
//! ├─────────────────────────────────────────┤
//! │        External byte stream             │
//! └─────────────────────────────────────────┘
//! ```

mod endpoint;
mod frame;
mod memory;

pub use endpoint::{ClientMode, Endpoint};
pub use frame::{CodecState, FrameCodec};
pub use memory::MemoryTransport;
