//! Wire types of the signer RPC.
use crate::error::SignerError;
use crate::types::{KeyVersion, PartialSignature, QuotaStatus, SignerIndex};
use base64::Engine as _;
use serde::{Deserialize, Serialize};

/// Path of the partial signature endpoint, relative to a signer's base URL.
pub const SIGN_ENDPOINT: &str = "/getBlindedMessagePartialSig";

/// Header carrying the key version on requests and responses.
pub const KEY_VERSION_HEADER: &str = "odis-key-version";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignMessageRequest {
    pub account: String,
    /// Base64 of the compressed blinded G2 point.
    pub blinded_query_phone_number: String,
    #[serde(rename = "sessionID")]
    pub session_id: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignMessageResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub performed_query_count: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_quota: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_number: Option<u64>,
    #[serde(default)]
    pub version: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, rename = "sessionID", skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

impl SignMessageResponse {
    /// Checks the envelope of a 200 response and extracts the share.
    ///
    /// The share bytes are only length checked here.
    pub fn into_partial_signature(
        self,
        signer_index: SignerIndex,
        key_version: KeyVersion,
    ) -> Result<PartialSignature, SignerError> {
        if !self.success {
            return Err(SignerError::malformed(format!(
                "success=false: {}",
                self.error.as_deref().unwrap_or("no error message")
            )));
        }
        let encoded = self
            .signature
            .ok_or_else(|| SignerError::malformed("missing signature"))?;
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .map_err(|e| SignerError::malformed(format!("signature is not base64: {e}")))?;
        let bytes: [u8; 96] = decoded.as_slice().try_into().map_err(|_| {
            SignerError::malformed(format!("signature has {} bytes, expected 96", decoded.len()))
        })?;

        let quota = match (self.performed_query_count, self.total_quota) {
            (Some(performed_query_count), Some(total_quota)) => Some(QuotaStatus {
                performed_query_count,
                total_quota,
            }),
            _ => None,
        };

        Ok(PartialSignature {
            signer_index,
            bytes,
            block_number: self.block_number,
            quota,
            key_version,
            signer_version: self.version,
            warnings: self.warnings,
            session_id: self.session_id,
        })
    }
}
