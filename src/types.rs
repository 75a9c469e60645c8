//! Data model shared by the combiner components.
use crate::auth::AuthSigner;
use crate::error::ConfigError;
use crate::identifier::Account;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::num::NonZeroU16;
use std::sync::Arc;
use tokio::time::Instant;
use uuid::Uuid;

/// Stable 1-based index of a signer's key share.
///
/// Signer `k` holds the share polynomial evaluated at `x = k`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SignerIndex(NonZeroU16);

impl SignerIndex {
    pub fn new(index: u16) -> Option<Self> {
        NonZeroU16::new(index).map(Self)
    }

    pub fn get(&self) -> u16 {
        self.0.get()
    }

    /// Zero-based position, as used by `blsttc` share sets.
    pub fn share_position(&self) -> usize {
        usize::from(self.0.get()) - 1
    }
}

impl fmt::Display for SignerIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Version of the threshold key the partial signatures are produced with.
pub type KeyVersion = u32;

/// `{n, t}` quorum configuration, fixed for the lifetime of a deployment.
///
/// With `n == t` there is no slack: a single misbehaving signer makes the
/// service unavailable until it is fixed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Quorum {
    n: usize,
    t: usize,
}

impl Quorum {
    pub fn new(n: usize, t: usize) -> Result<Self, ConfigError> {
        if n > usize::from(u16::MAX) {
            return Err(ConfigError::TooManySigners(n));
        }
        if t == 0 || t > n {
            return Err(ConfigError::InvalidQuorum { n, t });
        }
        Ok(Self { n, t })
    }

    /// Total number of signers.
    pub fn n(&self) -> usize {
        self.n
    }

    /// Number of partial signatures needed to combine.
    pub fn t(&self) -> usize {
        self.t
    }

    pub fn contains(&self, index: SignerIndex) -> bool {
        usize::from(index.get()) <= self.n
    }
}

/// Quota counters reported by a signer for the requesting account.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct QuotaStatus {
    pub performed_query_count: u64,
    pub total_quota: u64,
}

/// One signer's answer to a blinded signing request.
///
/// Only checked to deserialize correctly on receipt; the share itself is
/// validated when combined.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PartialSignature {
    pub signer_index: SignerIndex,
    pub bytes: [u8; 96],
    pub block_number: Option<u64>,
    pub quota: Option<QuotaStatus>,
    pub key_version: KeyVersion,
    pub signer_version: String,
    pub warnings: Vec<String>,
    pub session_id: Option<String>,
}

/// Per-call state: who is asking, until when, and under which session.
///
/// Built for exactly one call and dropped with it.
#[derive(Clone)]
pub struct RequestContext {
    pub session_id: Uuid,
    pub deadline: Instant,
    pub account: Account,
    pub auth: Arc<AuthSigner>,
    pub key_version: KeyVersion,
}

impl RequestContext {
    pub fn new(
        account: Account,
        auth: Arc<AuthSigner>,
        key_version: KeyVersion,
        deadline: Instant,
    ) -> Self {
        Self {
            session_id: Uuid::new_v4(),
            deadline,
            account,
            auth,
            key_version,
        }
    }

    /// Time left until the deadline, zero once it has passed.
    pub fn remaining(&self) -> std::time::Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }
}

impl fmt::Debug for RequestContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestContext")
            .field("session_id", &self.session_id)
            .field("account", &self.account)
            .field("key_version", &self.key_version)
            .field("auth", &"omitted")
            .finish()
    }
}
