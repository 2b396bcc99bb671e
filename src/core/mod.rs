//! TETHER Protocol - Core Layer
//!
//! Constants, error types, and the external-collaborator contracts shared by
//! every other layer.

pub mod constants;
mod error;
mod traits;

pub use constants::*;
pub use error::{CodecError, DisconnectReason, NodeError, SessionError};
pub use traits::{Transport, TransportEvent};
