//! Binding lifecycle: challenge ceremony for first-time linking plus the
//! administrator pre-provisioning path for offline environments.
//!
//! Challenges are ephemeral and in-memory only; expired entries are swept
//! opportunistically on every lookup. Bindings live in the gateway store.

use crate::store::{BindingRecord, BindingStatus, GatewayStore};
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use uuid::Uuid;

const CHALLENGE_CODE_LEN: usize = 8;
// No 0/1/I/O: codes get read aloud and retyped.
const CHALLENGE_CODE_ALPHABET: &[u8] = b"23456789ABCDEFGHJKLMNPQRSTUVWXYZ";
const MAX_IDENTITY_LEN: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Challenge {
    pub code: String,
    pub channel: String,
    pub channel_user_id: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Challenge {
    fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BindError {
    #[error("invalid channel identity")]
    InvalidIdentity,
    #[error("invalid internal user id")]
    InvalidUserId,
    #[error("challenge code is unknown or expired")]
    UnknownOrExpiredCode,
    #[error("an active binding already exists for this channel identity")]
    AlreadyBound,
    #[error("store error: {0}")]
    Store(String),
}

/// Manages the (channel, channel user id) to internal identity mapping.
pub struct UserBinder {
    store: Arc<GatewayStore>,
    challenges: Mutex<HashMap<String, Challenge>>,
}

impl UserBinder {
    pub fn new(store: Arc<GatewayStore>) -> Self {
        Self {
            store,
            challenges: Mutex::new(HashMap::new()),
        }
    }

    /// Creates a short-lived challenge code for a channel identity. The
    /// identity does not need any existing record.
    pub fn create_challenge(
        &self,
        channel: &str,
        channel_user_id: &str,
        ttl_minutes: i64,
    ) -> Result<Challenge, BindError> {
        self.create_challenge_at(channel, channel_user_id, ttl_minutes, Utc::now())
    }

    fn create_challenge_at(
        &self,
        channel: &str,
        channel_user_id: &str,
        ttl_minutes: i64,
        now: DateTime<Utc>,
    ) -> Result<Challenge, BindError> {
        let channel = normalize_identity(channel)?;
        let channel_user_id = normalize_identity(channel_user_id)?;

        let mut challenges = self.lock_challenges();
        challenges.retain(|_, challenge| !challenge.is_expired_at(now));

        let code = loop {
            let candidate = generate_challenge_code();
            if !challenges.contains_key(&candidate) {
                break candidate;
            }
        };
        let challenge = Challenge {
            code: code.clone(),
            channel,
            channel_user_id,
            created_at: now,
            expires_at: now + Duration::minutes(ttl_minutes.max(1)),
        };
        challenges.insert(code, challenge.clone());
        Ok(challenge)
    }

    /// Consumes a challenge and creates an active binding. Fails without
    /// consuming the code when an active binding already exists for the
    /// channel identity; unknown and expired codes fail outright.
    pub fn verify_challenge(
        &self,
        code: &str,
        user_id: &str,
        tenant_id: Option<&str>,
    ) -> Result<String, BindError> {
        self.verify_challenge_at(code, user_id, tenant_id, Utc::now())
    }

    fn verify_challenge_at(
        &self,
        code: &str,
        user_id: &str,
        tenant_id: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<String, BindError> {
        let user_id = normalize_user_id(user_id)?;
        let code = code.trim().to_ascii_uppercase();

        // The lock is held across the store calls so two concurrent verifies
        // of the same code cannot both mint a binding.
        let mut challenges = self.lock_challenges();
        challenges.retain(|_, challenge| !challenge.is_expired_at(now));
        let Some(challenge) = challenges.get(&code).cloned() else {
            return Err(BindError::UnknownOrExpiredCode);
        };

        let existing = self
            .store
            .active_binding(&challenge.channel, &challenge.channel_user_id)
            .map_err(store_error)?;
        if existing.is_some() {
            return Err(BindError::AlreadyBound);
        }

        let binding_id = self
            .store
            .insert_active_binding(
                &challenge.channel,
                &challenge.channel_user_id,
                &user_id,
                tenant_id.map(str::trim).filter(|t| !t.is_empty()),
                now,
            )
            .map_err(store_error)?;
        challenges.remove(&code);
        tracing::info!(
            channel = %challenge.channel,
            channel_user_id = %challenge.channel_user_id,
            binding_id = %binding_id,
            "challenge verified, binding activated"
        );
        Ok(binding_id)
    }

    /// Administrator path: no challenge, straight to an active binding.
    /// Re-provisioning a bound identity to the same internal user is a no-op
    /// returning the existing binding; a different user supersedes it with a
    /// fresh record.
    pub fn provision_binding(
        &self,
        channel: &str,
        channel_user_id: &str,
        user_id: &str,
        tenant_id: Option<&str>,
    ) -> Result<String, BindError> {
        let channel = normalize_identity(channel)?;
        let channel_user_id = normalize_identity(channel_user_id)?;
        let user_id = normalize_user_id(user_id)?;
        let now = Utc::now();

        if let Some(existing) = self
            .store
            .active_binding(&channel, &channel_user_id)
            .map_err(store_error)?
        {
            if existing.user_id == user_id {
                return Ok(existing.id);
            }
            self.store
                .revoke_binding(&existing.id, "superseded by re-provisioning", now)
                .map_err(store_error)?;
        }

        let binding_id = self
            .store
            .insert_active_binding(
                &channel,
                &channel_user_id,
                &user_id,
                tenant_id.map(str::trim).filter(|t| !t.is_empty()),
                now,
            )
            .map_err(store_error)?;
        tracing::info!(
            %channel,
            %channel_user_id,
            binding_id = %binding_id,
            "binding provisioned by administrator"
        );
        Ok(binding_id)
    }

    /// Active binding only; pending and revoked records are invisible here.
    pub fn resolve_binding(
        &self,
        channel: &str,
        channel_user_id: &str,
    ) -> Result<Option<BindingRecord>, BindError> {
        let channel = normalize_identity(channel)?;
        let channel_user_id = normalize_identity(channel_user_id)?;
        self.store
            .active_binding(&channel, &channel_user_id)
            .map_err(store_error)
    }

    /// Idempotent: false when the binding is absent or already revoked.
    pub fn revoke_binding(&self, binding_id: &str, reason: &str) -> Result<bool, BindError> {
        let reason = if reason.trim().is_empty() {
            "revoked by administrator"
        } else {
            reason.trim()
        };
        self.store
            .revoke_binding(binding_id.trim(), reason, Utc::now())
            .map_err(store_error)
    }

    pub fn list_bindings(
        &self,
        channel: Option<&str>,
        status: Option<BindingStatus>,
    ) -> Result<Vec<BindingRecord>, BindError> {
        self.store.list_bindings(channel, status).map_err(store_error)
    }

    /// Pending (unexpired) challenge count, surfaced by the health endpoint.
    pub fn pending_challenges(&self) -> usize {
        let now = Utc::now();
        let mut challenges = self.lock_challenges();
        challenges.retain(|_, challenge| !challenge.is_expired_at(now));
        challenges.len()
    }

    fn lock_challenges(&self) -> std::sync::MutexGuard<'_, HashMap<String, Challenge>> {
        self.challenges
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn store_error(error: anyhow::Error) -> BindError {
    BindError::Store(error.to_string())
}

fn normalize_identity(value: &str) -> Result<String, BindError> {
    let normalized = value.trim().to_string();
    if normalized.is_empty() || normalized.len() > MAX_IDENTITY_LEN {
        return Err(BindError::InvalidIdentity);
    }
    if normalized.chars().any(char::is_control) {
        return Err(BindError::InvalidIdentity);
    }
    Ok(normalized)
}

fn normalize_user_id(value: &str) -> Result<String, BindError> {
    let normalized = value.trim().to_string();
    if normalized.is_empty() || normalized.len() > MAX_IDENTITY_LEN {
        return Err(BindError::InvalidUserId);
    }
    if normalized.chars().any(char::is_control) {
        return Err(BindError::InvalidUserId);
    }
    Ok(normalized)
}

fn generate_challenge_code() -> String {
    let seed = Uuid::new_v4().into_bytes();
    let mut code = String::with_capacity(CHALLENGE_CODE_LEN);
    for byte in seed.iter().take(CHALLENGE_CODE_LEN) {
        let idx = usize::from(*byte) % CHALLENGE_CODE_ALPHABET.len();
        code.push(char::from(CHALLENGE_CODE_ALPHABET[idx]));
    }
    code
}

#[cfg(test)]
mod tests {
    use super::{BindError, CHALLENGE_CODE_LEN, UserBinder};
    use crate::store::{BindingStatus, GatewayStore};
    use chrono::{Duration, Utc};
    use std::sync::Arc;

    fn binder() -> UserBinder {
        UserBinder::new(Arc::new(GatewayStore::open_in_memory().expect("store")))
    }

    #[test]
    fn challenge_codes_use_confusion_resistant_alphabet() {
        let binder = binder();
        let challenge = binder
            .create_challenge("slack", "U123", 15)
            .expect("challenge");
        assert_eq!(challenge.code.len(), CHALLENGE_CODE_LEN);
        for banned in ['0', '1', 'I', 'O'] {
            assert!(!challenge.code.contains(banned), "{}", challenge.code);
        }
        assert_eq!(
            challenge.expires_at,
            challenge.created_at + Duration::minutes(15)
        );
    }

    #[test]
    fn verify_consumes_challenge_and_creates_active_binding() {
        let binder = binder();
        let challenge = binder
            .create_challenge("slack", "U123", 15)
            .expect("challenge");

        let binding_id = binder
            .verify_challenge(&challenge.code, "user-1", Some("tenant-a"))
            .expect("verify");
        let resolved = binder
            .resolve_binding("slack", "U123")
            .expect("resolve")
            .expect("binding");
        assert_eq!(resolved.id, binding_id);
        assert_eq!(resolved.user_id, "user-1");
        assert_eq!(resolved.tenant_id.as_deref(), Some("tenant-a"));
        assert_eq!(resolved.status, BindingStatus::Active);

        // Consumed: the same code cannot be redeemed twice.
        let err = binder
            .verify_challenge(&challenge.code, "user-2", None)
            .expect_err("second verify must fail");
        assert_eq!(err, BindError::UnknownOrExpiredCode);
    }

    #[test]
    fn verify_fails_for_already_bound_identity_without_mutation() {
        let binder = binder();
        let first = binder
            .create_challenge("slack", "U123", 15)
            .expect("challenge");
        let original = binder
            .verify_challenge(&first.code, "user-1", None)
            .expect("verify");

        let second = binder
            .create_challenge("slack", "U123", 15)
            .expect("challenge");
        let err = binder
            .verify_challenge(&second.code, "user-2", None)
            .expect_err("already bound must fail");
        assert_eq!(err, BindError::AlreadyBound);

        let resolved = binder
            .resolve_binding("slack", "U123")
            .expect("resolve")
            .expect("binding");
        assert_eq!(resolved.id, original);
        assert_eq!(resolved.user_id, "user-1");
    }

    #[test]
    fn expired_challenge_is_swept_and_rejected() {
        let binder = binder();
        let challenge = binder
            .create_challenge_at("slack", "U123", 10, Utc::now() - Duration::minutes(30))
            .expect("challenge");

        let err = binder
            .verify_challenge(&challenge.code, "user-1", None)
            .expect_err("expired code must fail");
        assert_eq!(err, BindError::UnknownOrExpiredCode);
        assert_eq!(binder.pending_challenges(), 0);
        assert!(
            binder
                .resolve_binding("slack", "U123")
                .expect("resolve")
                .is_none()
        );
    }

    #[test]
    fn unknown_code_is_rejected() {
        let binder = binder();
        let err = binder
            .verify_challenge("ZZZZZZZZ", "user-1", None)
            .expect_err("unknown code must fail");
        assert_eq!(err, BindError::UnknownOrExpiredCode);
    }

    #[test]
    fn provisioning_is_idempotent_for_same_user_and_supersedes_for_new_user() {
        let binder = binder();
        let first = binder
            .provision_binding("internal", "u-7", "user-7", None)
            .expect("provision");
        let again = binder
            .provision_binding("internal", "u-7", "user-7", None)
            .expect("provision again");
        assert_eq!(first, again);

        let replaced = binder
            .provision_binding("internal", "u-7", "user-8", None)
            .expect("re-provision");
        assert_ne!(first, replaced);
        let bindings = binder.list_bindings(Some("internal"), None).expect("list");
        assert_eq!(bindings.len(), 2);
        let resolved = binder
            .resolve_binding("internal", "u-7")
            .expect("resolve")
            .expect("binding");
        assert_eq!(resolved.user_id, "user-8");
    }

    #[test]
    fn revoke_is_idempotent_through_the_binder() {
        let binder = binder();
        let id = binder
            .provision_binding("internal", "u-7", "user-7", None)
            .expect("provision");
        assert!(binder.revoke_binding(&id, "offboarded").expect("revoke"));
        assert!(!binder.revoke_binding(&id, "again").expect("no-op"));
        assert!(
            binder
                .resolve_binding("internal", "u-7")
                .expect("resolve")
                .is_none()
        );
    }

    #[test]
    fn identity_validation_rejects_control_characters() {
        let binder = binder();
        let err = binder
            .create_challenge("slack\n", "U123", 15)
            .expect_err("control chars must fail");
        assert_eq!(err, BindError::InvalidIdentity);
        let err = binder
            .provision_binding("slack", "U123", "\u{0007}", None)
            .expect_err("control chars must fail");
        assert_eq!(err, BindError::InvalidUserId);
    }
}
