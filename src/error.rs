use crate::types::SignerIndex;
use blsttc::error::FromBytesError;
use std::array::TryFromSliceError;
use thiserror::Error;

/// Specialisation of `std::Result`.
pub type Result<T, E = BlindingError> = std::result::Result<T, E>;

#[derive(Error, Debug)]
/// Errors of the client-side blinding primitive.
pub enum BlindingError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// The unblinded signature does not verify against the service key.
    /// Never retried: it means a corrupted combination or a malicious signer.
    #[error("signature verification failed")]
    SignatureVerification,

    #[error("blinding factor is zero")]
    ZeroBlindingFactor,

    #[error("bytes do not encode a valid group element")]
    InvalidPoint,

    #[error("deserialization from bytes failed")]
    BlsttcFromBytes(#[from] FromBytesError),

    #[error("deserialization from bytes failed")]
    InvalidBytes(#[from] TryFromSliceError),
}

/// Errors of [`ThresholdCombiner::combine`](crate::ThresholdCombiner::combine).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CombineError {
    #[error("expected exactly {expected} partial signatures, got {got}")]
    WrongSubsetSize { expected: usize, got: usize },

    #[error("signer {0} appears more than once in the subset")]
    DuplicateSignerIndex(SignerIndex),

    #[error("signer {index} is outside the quorum of {n} signers")]
    SignerIndexOutOfRange { index: SignerIndex, n: usize },

    #[error("partial signatures were produced under different key versions: {0:?}")]
    InconsistentShareVersions(Vec<u32>),

    #[error("partial signature of signer {0} is not a valid G2 point")]
    InvalidShare(SignerIndex),
}

/// Fieldless view of [`SignerError`], used to aggregate and label failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SignerErrorKind {
    AuthRejected,
    QuotaExceeded,
    Timeout,
    MalformedResponse,
    Unreachable,
}

impl SignerErrorKind {
    /// The HTTP status a signer answers with for this kind of failure.
    /// Used to break ties when picking the majority failure reason.
    pub fn status_code(&self) -> u16 {
        match self {
            SignerErrorKind::AuthRejected => 401,
            SignerErrorKind::QuotaExceeded => 403,
            SignerErrorKind::Timeout => 408,
            SignerErrorKind::MalformedResponse => 502,
            SignerErrorKind::Unreachable => 503,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SignerErrorKind::AuthRejected => "auth_rejected",
            SignerErrorKind::QuotaExceeded => "quota_exceeded",
            SignerErrorKind::Timeout => "timeout",
            SignerErrorKind::MalformedResponse => "malformed_response",
            SignerErrorKind::Unreachable => "unreachable",
        }
    }
}

/// Failure of a single signer call. Recovered by the dispatcher by leaving
/// the signer out of the subset search.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SignerError {
    #[error("signer did not answer in time")]
    Timeout,

    #[error("signer rejected the request authentication")]
    AuthRejected,

    #[error("account quota exceeded")]
    QuotaExceeded,

    #[error("signer unreachable: {reason}")]
    Unreachable { reason: String },

    #[error("malformed signer response: {reason}")]
    MalformedResponse { reason: String },
}

impl SignerError {
    pub fn kind(&self) -> SignerErrorKind {
        match self {
            SignerError::Timeout => SignerErrorKind::Timeout,
            SignerError::AuthRejected => SignerErrorKind::AuthRejected,
            SignerError::QuotaExceeded => SignerErrorKind::QuotaExceeded,
            SignerError::Unreachable { .. } => SignerErrorKind::Unreachable,
            SignerError::MalformedResponse { .. } => SignerErrorKind::MalformedResponse,
        }
    }

    pub(crate) fn malformed(reason: impl Into<String>) -> Self {
        SignerError::MalformedResponse {
            reason: reason.into(),
        }
    }

    pub(crate) fn unreachable(reason: impl Into<String>) -> Self {
        SignerError::Unreachable {
            reason: reason.into(),
        }
    }
}

/// Failure to authenticate a request before it leaves the caller.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("invalid secp256k1 key: {0}")]
    InvalidKey(String),

    #[error("could not sign request: {0}")]
    Signing(String),

    #[error("could not encode request: {0}")]
    Encoding(String),
}

/// Not enough signers produced a usable partial signature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InsufficientSigners {
    pub threshold: usize,
    pub received: usize,
    pub failures: Vec<(SignerIndex, SignerError)>,
}

impl InsufficientSigners {
    /// Most common failure kind among the failing signers.
    ///
    /// Timeouts only count when nothing else failed. Ties go to the lower
    /// HTTP status, so an auth problem is reported before a quota problem.
    pub fn majority_reason(&self) -> Option<SignerErrorKind> {
        let mut counts: Vec<(SignerErrorKind, usize)> = Vec::new();
        for (_, err) in &self.failures {
            let kind = err.kind();
            if kind == SignerErrorKind::Timeout {
                continue;
            }
            match counts.iter_mut().find(|(k, _)| *k == kind) {
                Some((_, c)) => *c += 1,
                None => counts.push((kind, 1)),
            }
        }
        let majority = counts
            .into_iter()
            .max_by(|(ka, ca), (kb, cb)| {
                ca.cmp(cb)
                    .then_with(|| kb.status_code().cmp(&ka.status_code()))
            })
            .map(|(kind, _)| kind);
        match majority {
            Some(kind) => Some(kind),
            None if self.failures.is_empty() => None,
            None => Some(SignerErrorKind::Timeout),
        }
    }
}

impl std::fmt::Display for InsufficientSigners {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "expected {} partial signatures, got {} ({} signers failed)",
            self.threshold,
            self.received,
            self.failures.len()
        )
    }
}

/// Terminal errors of [`QuorumDispatcher::dispatch`](crate::QuorumDispatcher::dispatch).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CombinerError {
    #[error("insufficient signers: {0}")]
    InsufficientSigners(InsufficientSigners),

    /// Every candidate subset failed verification.
    #[error("combined signature failed verification after {attempts} attempts")]
    Corrupted { attempts: usize },

    #[error("partial signatures were produced under different key versions: {0:?}")]
    InconsistentShareVersions(Vec<u32>),

    /// The request could not be signed. Nothing was sent.
    #[error(transparent)]
    Auth(#[from] AuthError),
}

/// Errors surfaced to callers of [`PrivacyService`](crate::PrivacyService).
#[derive(Error, Debug)]
pub enum PrivacyServiceError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// A majority of the signers reported the account out of quota.
    #[error("account quota exceeded: {0}")]
    QuotaExceeded(InsufficientSigners),

    #[error(transparent)]
    Combiner(#[from] CombinerError),

    #[error("unblinded signature failed verification")]
    SignatureVerification,

    #[error("blinding failed: {0}")]
    Blinding(BlindingError),

    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error("could not start runtime: {0}")]
    Runtime(#[from] std::io::Error),

    /// Blocking calls cannot be made from a runtime thread.
    #[error("blocking call made from within a tokio runtime")]
    InsideRuntime,
}

impl From<BlindingError> for PrivacyServiceError {
    fn from(e: BlindingError) -> Self {
        match e {
            BlindingError::InvalidInput(msg) => Self::InvalidInput(msg),
            BlindingError::SignatureVerification => Self::SignatureVerification,
            other => Self::Blinding(other),
        }
    }
}

/// Rejected configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("threshold must be between 1 and the number of signers ({n}), got {t}")]
    InvalidQuorum { n: usize, t: usize },

    #[error("signer timeout ({signer:?}) must be shorter than the request deadline ({deadline:?})")]
    SignerTimeoutTooLong {
        signer: std::time::Duration,
        deadline: std::time::Duration,
    },

    #[error("too many signers: {0}")]
    TooManySigners(usize),

    #[error("invalid public key: {0}")]
    InvalidPublicKey(String),

    #[error("invalid signer list: {0}")]
    InvalidSigners(String),

    #[error("http client: {0}")]
    HttpClient(#[from] reqwest::Error),
}
