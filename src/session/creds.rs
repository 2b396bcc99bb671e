//! Long-lived credential state.
//!
//! Credentials are owned by the caller across reconnects and mutated in
//! place by merging incremental updates; they are never replaced wholesale.

use rand::Rng;
use rand::rngs::OsRng;

use crate::core::SessionError;
use crate::crypto::IdentityKeypair;

/// Long-lived device identity state.
#[derive(Debug, Clone)]
pub struct Credentials {
    /// Static device identity keypair.
    pub identity: IdentityKeypair,
    /// Registration id assigned at pairing.
    pub registration_id: u32,
    /// Currently published signed-prekey id.
    pub signed_prekey_id: u32,
    /// Whether a prior logged-in session exists (drives catch-up buffering).
    pub registered: bool,
    /// Optional routing blob appended to the endpoint as a query parameter.
    pub routing_info: Option<Vec<u8>>,
    user: Option<String>,
}

impl Credentials {
    /// Generate fresh, unregistered credentials.
    pub fn generate() -> Result<Self, SessionError> {
        Ok(Self {
            identity: IdentityKeypair::generate()?,
            registration_id: OsRng.gen_range(1..0x4000),
            signed_prekey_id: 1,
            registered: false,
            routing_info: None,
            user: None,
        })
    }

    /// The currently signed-in user, if any.
    ///
    /// Explicit accessor over the owned credential state; there is no live
    /// aliasing of this field elsewhere.
    pub fn current_user(&self) -> Option<&str> {
        self.user.as_deref()
    }

    /// Merge a partial update into this credential state in place.
    pub fn merge(&mut self, update: &CredsUpdate) {
        if let Some(registered) = update.registered {
            self.registered = registered;
        }
        if let Some(id) = update.signed_prekey_id {
            self.signed_prekey_id = id;
        }
        if let Some(routing_info) = &update.routing_info {
            self.routing_info = Some(routing_info.clone());
        }
        if let Some(user) = &update.user {
            self.user = Some(user.clone());
        }
    }
}

/// Incremental credential fields that changed, as carried by the
/// `creds.update` event.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CredsUpdate {
    /// New registration status.
    pub registered: Option<bool>,
    /// New signed-prekey id.
    pub signed_prekey_id: Option<u32>,
    /// New routing blob.
    pub routing_info: Option<Vec<u8>>,
    /// New signed-in user.
    pub user: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_is_unregistered() {
        let creds = Credentials::generate().unwrap();
        assert!(!creds.registered);
        assert!(creds.current_user().is_none());
        assert!(creds.registration_id >= 1);
    }

    #[test]
    fn test_merge_is_partial() {
        let mut creds = Credentials::generate().unwrap();
        let original_prekey_id = creds.signed_prekey_id;

        creds.merge(&CredsUpdate {
            registered: Some(true),
            user: Some("alice@s.example".into()),
            ..Default::default()
        });

        assert!(creds.registered);
        assert_eq!(creds.current_user(), Some("alice@s.example"));
        // Untouched fields survive the merge.
        assert_eq!(creds.signed_prekey_id, original_prekey_id);
    }

    #[test]
    fn test_later_merge_overrides_earlier() {
        let mut creds = Credentials::generate().unwrap();
        creds.merge(&CredsUpdate {
            signed_prekey_id: Some(5),
            ..Default::default()
        });
        creds.merge(&CredsUpdate {
            signed_prekey_id: Some(9),
            ..Default::default()
        });
        assert_eq!(creds.signed_prekey_id, 9);
    }
}
