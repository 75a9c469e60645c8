//! Authentication of signing requests on behalf of an account.
use crate::error::AuthError;
use k256::ecdsa::signature::Signer;
use k256::ecdsa::{Signature, SigningKey};
use std::fmt;
use std::sync::Arc;

/// Signs custom request bodies, e.g. through a wallet that never exposes the key.
pub type CustomSigner = Arc<dyn Fn(&[u8]) -> Result<String, AuthError> + Send + Sync>;

/// How the combiner proves to the signers that the caller controls the
/// account being charged.
#[derive(Clone)]
pub enum AuthSigner {
    /// The account's data encryption key. The body is signed with ECDSA over
    /// secp256k1 and SHA-256.
    EncryptionKey(SigningKey),
    Custom(CustomSigner),
    /// Send requests without an `Authorization` header.
    None,
}

impl AuthSigner {
    pub fn encryption_key(bytes: &[u8]) -> Result<Self, AuthError> {
        SigningKey::from_slice(bytes)
            .map(AuthSigner::EncryptionKey)
            .map_err(|e| AuthError::InvalidKey(e.to_string()))
    }

    pub fn custom<F>(f: F) -> Self
    where
        F: Fn(&[u8]) -> Result<String, AuthError> + Send + Sync + 'static,
    {
        AuthSigner::Custom(Arc::new(f))
    }

    /// Value of the `Authorization` header for `body`, if any.
    ///
    /// `body` must be the exact bytes sent on the wire.
    pub fn sign(&self, body: &[u8]) -> Result<Option<String>, AuthError> {
        match self {
            AuthSigner::EncryptionKey(key) => {
                let signature: Signature = key.sign(body);
                Ok(Some(hex::encode(signature.to_der().as_bytes())))
            }
            AuthSigner::Custom(f) => f(body).map(Some),
            AuthSigner::None => Ok(None),
        }
    }
}

impl fmt::Debug for AuthSigner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthSigner::EncryptionKey(_) => f.write_str("AuthSigner::EncryptionKey(omitted)"),
            AuthSigner::Custom(_) => f.write_str("AuthSigner::Custom"),
            AuthSigner::None => f.write_str("AuthSigner::None"),
        }
    }
}
