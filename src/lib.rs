//! Oblivious identifier hashing with threshold BLS blind signatures.
//!
//! An identifier is hashed to G2 and blinded, partially signed by `n`
//! independent signers, combined from any `t` partial signatures, then
//! unblinded and verified against the service public key. No single signer
//! learns the identifier.
#![cfg_attr(not(test), deny(clippy::unwrap_used, clippy::expect_used))]

pub mod api;
mod auth;
mod blinding;
mod combiner;
pub mod config;
mod dispatcher;
mod error;
mod identifier;
pub mod metrics;
pub mod monitor;
mod service;
mod signer;
mod types;
mod utils;

#[cfg(test)]
mod test_utils;

pub use crate::auth::{AuthSigner, CustomSigner};
pub use crate::blinding::{
    BlindedMessage, BlindingCodec, BlindingFactor, UnblindedSignature, PEPPER_CHAR_LENGTH,
};
pub use crate::combiner::{lagrange_coefficients, CombinedSignature, ThresholdCombiner};
pub use crate::config::CombinerConfig;
pub use crate::dispatcher::{
    default_max_combine_attempts, DispatchOutcome, QuorumDispatcher, DEFAULT_MAX_COMBINE_ATTEMPTS,
};
pub use crate::error::{
    AuthError, BlindingError, CombineError, CombinerError, ConfigError, InsufficientSigners,
    PrivacyServiceError, Result, SignerError, SignerErrorKind,
};
pub use crate::identifier::{Account, Identifier, PHONE_NUMBER_PREFIX};
pub use crate::monitor::{DiscrepancyMonitor, MonitorHandle, MonitorSummary, Tolerances};
pub use crate::service::{IdentifierHash, PrivacyService};
pub use crate::signer::{HttpSignerClient, SignRequest, SignerClient};
pub use crate::types::{
    KeyVersion, PartialSignature, QuotaStatus, Quorum, RequestContext, SignerIndex,
};
