//! Failure classification and recovery.
//!
//! Server failures arrive as free-text condition strings; this module is
//! the single place that text is translated into a typed class. Rate
//! limits impose an enforced send gate with exponential backoff, and
//! authentication MAC failures trigger a one-shot best-effort prekey
//! republish.

use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, warn};

use crate::core::constants::{
    MAX_RATE_LIMIT_BACKOFF, PREKEY_BATCH_SIZE, PREKEY_NAMESPACE, PREKEY_NEXT_ID,
};
use crate::crypto::PreKey;

use super::keystore::{KeyStore, KeyTransaction};

/// Typed class of a server-reported failure condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Message authentication failed; peers likely hold stale key state.
    MacMismatch,
    /// The server is throttling this client.
    RateLimited,
    /// Anything we have no specific handling for.
    Other,
}

/// Map a raw failure condition string to a [`FailureClass`].
///
/// Matching is case-insensitive and substring-based; the server wording
/// varies across versions.
pub fn classify_failure(condition: &str) -> FailureClass {
    let lower = condition.to_ascii_lowercase();
    if lower.contains("mac") || lower.contains("hmac") {
        FailureClass::MacMismatch
    } else if lower.contains("rate") || lower.contains("429") {
        FailureClass::RateLimited
    } else {
        FailureClass::Other
    }
}

/// Per-connection recovery state: rate-limit gate and republish latch.
pub struct RecoveryPolicy {
    backoff_base: Duration,
    rate_limit_hits: AtomicU32,
    throttle_until: Mutex<Option<Instant>>,
    republish_done: AtomicBool,
}

impl RecoveryPolicy {
    /// Create a policy with the given initial backoff.
    pub fn new(backoff_base: Duration) -> Self {
        Self {
            backoff_base,
            rate_limit_hits: AtomicU32::new(0),
            throttle_until: Mutex::new(None),
            republish_done: AtomicBool::new(false),
        }
    }

    /// Record a rate-limit hit and extend the send gate.
    ///
    /// The delay doubles per consecutive hit and is capped at
    /// [`MAX_RATE_LIMIT_BACKOFF`] no matter the configured base.
    pub fn record_rate_limit(&self) {
        let hits = self.rate_limit_hits.fetch_add(1, Ordering::SeqCst);
        let delay = self
            .backoff_base
            .checked_mul(1u32 << hits.min(16))
            .unwrap_or(MAX_RATE_LIMIT_BACKOFF)
            .min(MAX_RATE_LIMIT_BACKOFF);
        let until = Instant::now() + delay;
        *self.lock_throttle() = Some(until);
        warn!(?delay, hits = hits + 1, "rate limited; gating sends");
    }

    /// Hold the caller until the rate-limit gate has passed.
    ///
    /// Sends go through here unconditionally, so throttling is enforced
    /// rather than advisory.
    pub async fn wait_until_ready(&self) {
        let deadline = *self.lock_throttle();
        if let Some(deadline) = deadline {
            if deadline > Instant::now() {
                tokio::time::sleep_until(deadline).await;
            }
        }
    }

    /// Clear backoff state after a successful exchange.
    pub fn record_success(&self) {
        self.rate_limit_hits.store(0, Ordering::SeqCst);
        *self.lock_throttle() = None;
    }

    /// Generate and persist a fresh prekey batch in response to a MAC
    /// failure, at most once per connection.
    ///
    /// Returns the new prekeys for upload, or `None` when the republish
    /// already ran or persistence failed. Failures are logged, never
    /// escalated; this path is best-effort by design of the caller.
    pub async fn republish_prekeys<S: KeyStore>(&self, store: &S) -> Option<Vec<PreKey>> {
        if self.republish_done.swap(true, Ordering::SeqCst) {
            debug!("prekey republish already performed on this connection");
            return None;
        }
        match generate_prekey_batch(store).await {
            Ok(batch) => Some(batch),
            Err(err) => {
                warn!(error = %err, "prekey republish failed");
                None
            }
        }
    }

    fn lock_throttle(&self) -> std::sync::MutexGuard<'_, Option<Instant>> {
        self.throttle_until.lock().unwrap_or_else(|p| p.into_inner())
    }
}

/// Mint the next [`PREKEY_BATCH_SIZE`] prekeys and commit them, together
/// with the advanced id counter, as one transaction.
async fn generate_prekey_batch<S: KeyStore>(
    store: &S,
) -> Result<Vec<PreKey>, crate::core::SessionError> {
    let mut txn = KeyTransaction::new(store);
    let next_id = match txn.get(PREKEY_NAMESPACE, PREKEY_NEXT_ID).await? {
        Some(raw) if raw.len() == 4 => u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]),
        _ => 1,
    };

    let count = PREKEY_BATCH_SIZE as u32;
    let mut batch = Vec::with_capacity(PREKEY_BATCH_SIZE);
    for offset in 0..count {
        let prekey = PreKey::generate(next_id + offset);
        let mut record = Vec::with_capacity(64);
        record.extend_from_slice(prekey.private_key());
        record.extend_from_slice(&prekey.public);
        txn.put(PREKEY_NAMESPACE, &prekey.id.to_string(), record);
        batch.push(prekey);
    }
    txn.put(
        PREKEY_NAMESPACE,
        PREKEY_NEXT_ID,
        (next_id + count).to_be_bytes().to_vec(),
    );
    txn.commit().await?;
    debug!(
        first = next_id,
        count = PREKEY_BATCH_SIZE,
        "generated prekey batch"
    );
    Ok(batch)
}
