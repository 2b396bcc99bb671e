//! Session layer: the stateful client above the secured channel.
//!
//! Everything that outlives a single frame lives here - credentials,
//! request correlation, event delivery, key storage, failure recovery,
//! and the [`Client`] that ties them to a [`Transport`](crate::core::Transport).

mod client;
mod config;
mod correlator;
mod creds;
mod events;
mod keystore;
mod node;
mod recovery;

pub use client::Client;
pub use config::{SessionConfig, SessionConfigBuilder};
pub use correlator::RequestCorrelator;
pub use creds::{Credentials, CredsUpdate};
pub use events::{ConnectionUpdate, Event, EventBus, SessionState};
pub use keystore::{KeyStore, KeyTransaction, MemoryKeyStore};
pub use node::{ATTR_ID, Node};
pub use recovery::{FailureClass, RecoveryPolicy, classify_failure};
