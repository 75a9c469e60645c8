use crate::api::{SignMessageRequest, SignMessageResponse, KEY_VERSION_HEADER, SIGN_ENDPOINT};
use crate::blinding::BlindedMessage;
use crate::error::{AuthError, SignerError};
use crate::types::{KeyVersion, PartialSignature, RequestContext, SignerIndex};
use async_trait::async_trait;
use reqwest::StatusCode;
use std::time::Duration;
use tracing::instrument;

/// A request body encoded and authenticated once per round and sent
/// unchanged to every signer.
#[derive(Clone, Debug)]
pub struct SignRequest {
    blinded: BlindedMessage,
    body: Vec<u8>,
    authorization: Option<String>,
}

impl SignRequest {
    /// Encodes the request for `blinded` and signs it with the context's
    /// account credentials.
    pub fn new(blinded: &BlindedMessage, ctx: &RequestContext) -> Result<Self, AuthError> {
        let request = SignMessageRequest {
            account: ctx.account.to_string(),
            blinded_query_phone_number: blinded.to_base64(),
            session_id: ctx.session_id.to_string(),
        };
        let body = serde_json::to_vec(&request).map_err(|e| AuthError::Encoding(e.to_string()))?;
        let authorization = ctx.auth.sign(&body)?;
        Ok(Self {
            blinded: blinded.clone(),
            body,
            authorization,
        })
    }

    pub fn blinded(&self) -> &BlindedMessage {
        &self.blinded
    }

    /// The exact bytes covered by the authorization.
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn authorization(&self) -> Option<&str> {
        self.authorization.as_deref()
    }
}

/// One signer node holding a key share.
///
/// Implementations are long-lived and shared by concurrent requests. A call
/// may be cancelled at any await point once the dispatcher has its result.
#[async_trait]
pub trait SignerClient: Send + Sync {
    fn index(&self) -> SignerIndex;

    fn url(&self) -> &str;

    /// Requests a partial signature over the request's blinded message.
    ///
    /// Never waits longer than the context's deadline allows.
    async fn send(
        &self,
        request: &SignRequest,
        ctx: &RequestContext,
    ) -> Result<PartialSignature, SignerError>;
}

/// [`SignerClient`] talking JSON over HTTP.
#[derive(Clone, Debug)]
pub struct HttpSignerClient {
    index: SignerIndex,
    url: String,
    fallback_url: Option<String>,
    client: reqwest::Client,
    signer_timeout: Duration,
}

impl HttpSignerClient {
    pub fn new(
        index: SignerIndex,
        url: impl Into<String>,
        client: reqwest::Client,
        signer_timeout: Duration,
    ) -> Self {
        Self {
            index,
            url: url.into(),
            fallback_url: None,
            client,
            signer_timeout,
        }
    }

    /// Second address of the same signer, tried only when the primary one
    /// refuses the connection.
    pub fn with_fallback_url(mut self, fallback_url: impl Into<String>) -> Self {
        self.fallback_url = Some(fallback_url.into());
        self
    }

    fn timeout(&self, ctx: &RequestContext) -> Result<Duration, SignerError> {
        let timeout = self.signer_timeout.min(ctx.remaining());
        if timeout.is_zero() {
            return Err(SignerError::Timeout);
        }
        Ok(timeout)
    }

    async fn post(
        &self,
        base_url: &str,
        request: &SignRequest,
        ctx: &RequestContext,
    ) -> Result<reqwest::Response, reqwest::Error> {
        let mut builder = self
            .client
            .post(format!("{}{SIGN_ENDPOINT}", base_url.trim_end_matches('/')))
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .header(KEY_VERSION_HEADER, ctx.key_version.to_string())
            .body(request.body().to_vec());
        if let Some(authorization) = request.authorization() {
            builder = builder.header(reqwest::header::AUTHORIZATION, authorization);
        }
        let timeout = self.signer_timeout.min(ctx.remaining());
        builder.timeout(timeout).send().await
    }

    async fn read_response(
        &self,
        response: reqwest::Response,
        key_version: KeyVersion,
    ) -> Result<PartialSignature, SignerError> {
        match response.status() {
            StatusCode::UNAUTHORIZED => return Err(SignerError::AuthRejected),
            StatusCode::FORBIDDEN => return Err(SignerError::QuotaExceeded),
            status if !status.is_success() => {
                return Err(SignerError::unreachable(format!("status {status}")))
            }
            _ => {}
        }

        if let Some(header) = response.headers().get(KEY_VERSION_HEADER) {
            let served = header
                .to_str()
                .ok()
                .and_then(|v| v.trim().parse::<KeyVersion>().ok())
                .ok_or_else(|| SignerError::malformed("unreadable key version header"))?;
            if served != key_version {
                return Err(SignerError::malformed(format!(
                    "signed with key version {served}, requested {key_version}"
                )));
            }
        }

        let body = response.bytes().await.map_err(transport_error)?;
        let parsed: SignMessageResponse = serde_json::from_slice(&body)
            .map_err(|e| SignerError::malformed(format!("invalid body: {e}")))?;
        parsed.into_partial_signature(self.index, key_version)
    }
}

fn transport_error(e: reqwest::Error) -> SignerError {
    if e.is_timeout() {
        SignerError::Timeout
    } else {
        SignerError::unreachable(e.to_string())
    }
}

#[async_trait]
impl SignerClient for HttpSignerClient {
    fn index(&self) -> SignerIndex {
        self.index
    }

    fn url(&self) -> &str {
        &self.url
    }

    #[instrument(level = "debug", skip_all, fields(signer = %self.index, session_id = %ctx.session_id))]
    async fn send(
        &self,
        request: &SignRequest,
        ctx: &RequestContext,
    ) -> Result<PartialSignature, SignerError> {
        self.timeout(ctx)?;

        let response = match self.post(&self.url, request, ctx).await {
            Err(e) if e.is_connect() => match &self.fallback_url {
                Some(fallback_url) => {
                    tracing::warn!(signer = %self.index, "primary url unreachable, trying fallback");
                    self.timeout(ctx)?;
                    self.post(fallback_url, request, ctx)
                        .await
                        .map_err(transport_error)?
                }
                None => return Err(transport_error(e)),
            },
            other => other.map_err(transport_error)?,
        };

        let partial = self.read_response(response, ctx.key_version).await?;
        tracing::debug!(block_number = ?partial.block_number, "received partial signature");
        Ok(partial)
    }
}
