use crate::auth::AuthSigner;
use crate::blinding::{BlindingCodec, UnblindedSignature};
use crate::config::CombinerConfig;
use crate::dispatcher::QuorumDispatcher;
use crate::error::{CombinerError, ConfigError, PrivacyServiceError, SignerErrorKind};
use crate::identifier::{Account, Identifier};
use crate::metrics::MetricsSink;
use crate::monitor::{DiscrepancyMonitor, MonitorHandle, MonitorSummary};
use crate::signer::{HttpSignerClient, SignerClient};
use crate::types::{KeyVersion, RequestContext};
use blsttc::PublicKey;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::instrument;

/// The oblivious hash of an identifier.
#[derive(Clone, Debug, PartialEq)]
pub struct IdentifierHash {
    pub signature: UnblindedSignature,
    pub pepper: String,
    pub obfuscated_identifier: String,
}

/// Entry point for callers: turns an identifier into its hash without any
/// single signer learning the identifier.
pub struct PrivacyService {
    dispatcher: QuorumDispatcher,
    codec: BlindingCodec,
    public_key: PublicKey,
    key_version: KeyVersion,
    request_deadline: Duration,
    monitor: Option<MonitorHandle>,
}

impl PrivacyService {
    pub fn new(
        dispatcher: QuorumDispatcher,
        public_key: PublicKey,
        key_version: KeyVersion,
        request_deadline: Duration,
    ) -> Self {
        Self {
            dispatcher,
            codec: BlindingCodec::new(),
            public_key,
            key_version,
            request_deadline,
            monitor: None,
        }
    }

    /// Builds HTTP signer clients and starts the discrepancy monitor.
    ///
    /// Must be called from within a tokio runtime.
    pub fn from_config(
        config: &CombinerConfig,
        sink: Arc<dyn MetricsSink>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let quorum = config.quorum()?;
        let public_key = config.public_key()?;

        let client = reqwest::Client::builder().build()?;
        let signers: Vec<Arc<dyn SignerClient>> = config
            .signer_indices()
            .map(|(index, signer)| {
                let http = HttpSignerClient::new(
                    index,
                    signer.url.clone(),
                    client.clone(),
                    config.signer_timeout,
                );
                let http = match &signer.fallback_url {
                    Some(fallback_url) => http.with_fallback_url(fallback_url.clone()),
                    None => http,
                };
                Arc::new(http) as Arc<dyn SignerClient>
            })
            .collect();

        let (monitor, handle) = DiscrepancyMonitor::spawn(sink, config.tolerances());
        let mut dispatcher =
            QuorumDispatcher::new(signers, quorum, public_key)?.with_monitor(monitor);
        if let Some(max_combine_attempts) = config.max_combine_attempts {
            dispatcher = dispatcher.with_max_combine_attempts(max_combine_attempts);
        }
        if let Some(share_keys) = config.share_keys()? {
            dispatcher = dispatcher.with_share_keys(share_keys);
        }

        tracing::info!(
            n = quorum.n(),
            t = quorum.t(),
            key_version = config.key_version,
            "combiner ready"
        );
        let mut service = Self::new(
            dispatcher,
            public_key,
            config.key_version,
            config.request_deadline,
        );
        service.monitor = Some(handle);
        Ok(service)
    }

    /// Hashes `identifier` on behalf of `account`.
    ///
    /// Fails with [`PrivacyServiceError::QuotaExceeded`] when most signers
    /// refused for lack of quota. Nothing is sent for invalid input.
    #[instrument(skip_all, fields(prefix = identifier.prefix(), session_id = tracing::field::Empty))]
    pub async fn hash_identifier(
        &self,
        identifier: &Identifier,
        account: &Account,
        auth: Arc<AuthSigner>,
    ) -> Result<IdentifierHash, PrivacyServiceError> {
        let (blinded, factor) = self.codec.blind(identifier)?;
        let ctx = RequestContext::new(
            account.clone(),
            auth,
            self.key_version,
            Instant::now() + self.request_deadline,
        );
        tracing::Span::current().record("session_id", tracing::field::display(ctx.session_id));

        let outcome = match self.dispatcher.dispatch(&blinded, &ctx).await {
            Ok(outcome) => outcome,
            Err(CombinerError::InsufficientSigners(e))
                if e.majority_reason() == Some(SignerErrorKind::QuotaExceeded) =>
            {
                return Err(PrivacyServiceError::QuotaExceeded(e));
            }
            Err(CombinerError::Auth(e)) => return Err(e.into()),
            Err(e) => return Err(e.into()),
        };

        let signature = self.codec.unblind_and_verify(
            &outcome.signature,
            factor,
            &self.public_key,
            identifier,
        )?;
        let pepper = signature.pepper();
        let obfuscated_identifier = signature.obfuscated_identifier(identifier);
        tracing::debug!(signers = ?outcome.signers, "identifier hashed");
        Ok(IdentifierHash {
            signature,
            pepper,
            obfuscated_identifier,
        })
    }

    /// [`Self::hash_identifier`] for an E.164 phone number.
    pub async fn hash_phone_number(
        &self,
        e164: &str,
        account: &Account,
        auth: Arc<AuthSigner>,
    ) -> Result<IdentifierHash, PrivacyServiceError> {
        let identifier = Identifier::phone_number(e164)?;
        self.hash_identifier(&identifier, account, auth).await
    }

    /// [`Self::hash_identifier`] for callers outside of a tokio runtime.
    ///
    /// Fails with [`PrivacyServiceError::InsideRuntime`] on a runtime thread.
    pub fn hash_identifier_blocking(
        &self,
        identifier: &Identifier,
        account: &Account,
        auth: Arc<AuthSigner>,
    ) -> Result<IdentifierHash, PrivacyServiceError> {
        if tokio::runtime::Handle::try_current().is_ok() {
            return Err(PrivacyServiceError::InsideRuntime);
        }
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        runtime.block_on(self.hash_identifier(identifier, account, auth))
    }

    /// Stops the monitor after it has processed every round so far.
    pub async fn shutdown(self) -> Option<MonitorSummary> {
        match self.monitor {
            Some(handle) => Some(handle.shutdown().await),
            None => None,
        }
    }
}
