use crate::error::ConfigError;
use crate::monitor::Tolerances;
use crate::types::{KeyVersion, Quorum, SignerIndex};
use blsttc::{PublicKey, PublicKeyShare};
use clap::Parser;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::time::Duration;

/// One signer as configured. Its index is its position in the list, starting at 1.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignerConfig {
    pub url: String,
    #[serde(default)]
    pub fallback_url: Option<String>,
    /// Hex of the signer's 48-byte public key share.
    #[serde(default)]
    pub public_key_share: Option<String>,
}

/// JSON list of signers, e.g. `[{"url":"https://signer-1"},{"url":"https://signer-2"}]`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SignerList(pub Vec<SignerConfig>);

impl SignerList {
    pub fn parse(s: &str) -> Result<Self, String> {
        let signers: Vec<SignerConfig> =
            serde_json::from_str(s).map_err(|e| format!("invalid signer list: {e}"))?;
        if signers.is_empty() {
            return Err("signer list is empty".to_string());
        }
        Ok(Self(signers))
    }
}

/// The configuration for the combiner.
///
/// It can be configured via environment variables or command line arguments using `clap`.
#[derive(Parser, Debug, Clone)]
pub struct CombinerConfig {
    /// The signers as a JSON list of `{url, fallbackUrl?, publicKeyShare?}`
    #[clap(long, env = "PNP_COMBINER_SIGNERS", value_parser = SignerList::parse)]
    pub signers: SignerList,

    /// The number of partial signatures needed to combine
    #[clap(long, env = "PNP_COMBINER_THRESHOLD")]
    pub threshold: usize,

    /// Hex of the 48-byte service public key
    #[clap(long, env = "PNP_COMBINER_PUBLIC_KEY")]
    pub public_key: String,

    /// The key version requested from the signers
    #[clap(long, env = "PNP_COMBINER_KEY_VERSION", default_value = "1")]
    pub key_version: KeyVersion,

    /// Max time to wait for a single signer
    #[clap(long, env = "PNP_COMBINER_SIGNER_TIMEOUT", default_value = "3s", value_parser = humantime::parse_duration)]
    pub signer_timeout: Duration,

    /// Max time for a whole request, must exceed the signer timeout
    #[clap(long, env = "PNP_COMBINER_REQUEST_DEADLINE", default_value = "5s", value_parser = humantime::parse_duration)]
    pub request_deadline: Duration,

    /// Block number spread between signers that gets reported
    #[clap(long, env = "PNP_COMBINER_MAX_BLOCK_DISCREPANCY", default_value = "3")]
    pub max_block_discrepancy: u64,

    /// Query count spread between signers that is reported as severe
    #[clap(long, env = "PNP_COMBINER_MAX_QUERY_COUNT_DISCREPANCY", default_value = "5")]
    pub max_query_count_discrepancy: u64,

    /// Total quota spread between signers that is reported as severe
    #[clap(long, env = "PNP_COMBINER_MAX_TOTAL_QUOTA_DISCREPANCY", default_value = "5")]
    pub max_total_quota_discrepancy: u64,

    /// Max number of signer subsets to combine per request, defaults to the number of signers plus one (at least 10)
    #[clap(long, env = "PNP_COMBINER_MAX_COMBINE_ATTEMPTS")]
    pub max_combine_attempts: Option<usize>,
}

impl CombinerConfig {
    /// Checks everything that can be checked without talking to a signer.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.quorum()?;
        self.public_key()?;
        self.share_keys()?;
        if self.signer_timeout.is_zero() || self.signer_timeout >= self.request_deadline {
            return Err(ConfigError::SignerTimeoutTooLong {
                signer: self.signer_timeout,
                deadline: self.request_deadline,
            });
        }
        Ok(())
    }

    pub fn quorum(&self) -> Result<Quorum, ConfigError> {
        Quorum::new(self.signers.0.len(), self.threshold)
    }

    pub fn public_key(&self) -> Result<PublicKey, ConfigError> {
        let bytes = decode_hex_array::<48>(&self.public_key).map_err(ConfigError::InvalidPublicKey)?;
        PublicKey::from_bytes(bytes).map_err(|e| ConfigError::InvalidPublicKey(e.to_string()))
    }

    /// Per-signer keys, either for every signer or for none.
    pub fn share_keys(&self) -> Result<Option<BTreeMap<SignerIndex, PublicKeyShare>>, ConfigError> {
        let configured = self
            .signers
            .0
            .iter()
            .filter(|s| s.public_key_share.is_some())
            .count();
        if configured == 0 {
            return Ok(None);
        }
        if configured != self.signers.0.len() {
            return Err(ConfigError::InvalidSigners(
                "public key shares must be given for all signers or none".to_string(),
            ));
        }
        let mut keys = BTreeMap::new();
        for (index, signer) in self.signer_indices() {
            let hex_key = signer.public_key_share.as_deref().unwrap_or_default();
            let bytes = decode_hex_array::<48>(hex_key)
                .map_err(|e| ConfigError::InvalidSigners(format!("signer {index}: {e}")))?;
            let share = PublicKeyShare::from_bytes(bytes)
                .map_err(|e| ConfigError::InvalidSigners(format!("signer {index}: {e}")))?;
            keys.insert(index, share);
        }
        Ok(Some(keys))
    }

    /// Signers paired with their 1-based index.
    pub fn signer_indices(&self) -> impl Iterator<Item = (SignerIndex, &SignerConfig)> {
        self.signers
            .0
            .iter()
            .zip(1u16..)
            .filter_map(|(signer, i)| SignerIndex::new(i).map(|index| (index, signer)))
    }

    pub fn tolerances(&self) -> Tolerances {
        Tolerances {
            max_block_discrepancy: self.max_block_discrepancy,
            max_query_count_discrepancy: self.max_query_count_discrepancy,
            max_total_quota_discrepancy: self.max_total_quota_discrepancy,
        }
    }
}

fn decode_hex_array<const N: usize>(s: &str) -> Result<[u8; N], String> {
    let bytes = hex::decode(s.trim_start_matches("0x")).map_err(|e| format!("invalid hex: {e}"))?;
    bytes
        .as_slice()
        .try_into()
        .map_err(|_| format!("expected {N} bytes, got {}", bytes.len()))
}
