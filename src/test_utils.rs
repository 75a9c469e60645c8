//! In-process signer set built from a `blsttc` key set.
use crate::auth::AuthSigner;
use crate::blinding::BlindedMessage;
use crate::combiner::CombinedSignature;
use crate::error::SignerError;
use crate::identifier::Account;
use crate::metrics::{Labels, MetricsSink};
use crate::signer::{SignRequest, SignerClient};
use crate::types::{KeyVersion, PartialSignature, QuotaStatus, Quorum, RequestContext, SignerIndex};
use crate::utils::*;
use async_trait::async_trait;
use blsttc::ff::Field;
use blsttc::pairing::bls12_381::Fr;
use blsttc::{PublicKey, PublicKeyShare, SecretKeySet, SignatureShare};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub(crate) fn idx(i: u16) -> SignerIndex {
    SignerIndex::new(i).unwrap()
}

pub(crate) fn account() -> Account {
    Account::parse("0x1111111111111111111111111111111111111111").unwrap()
}

pub(crate) fn context(deadline_in: Duration) -> RequestContext {
    RequestContext::new(
        account(),
        Arc::new(AuthSigner::encryption_key(&[7u8; 32]).unwrap()),
        1,
        tokio::time::Instant::now() + deadline_in,
    )
}

/// A threshold key dealt to `n` signers, `t` of which are needed.
pub(crate) struct KeyFixture {
    sks: SecretKeySet,
    quorum: Quorum,
}

impl KeyFixture {
    pub(crate) fn new(n: usize, t: usize) -> Self {
        let mut rng = rand::thread_rng();
        Self {
            sks: SecretKeySet::random(t - 1, &mut rng),
            quorum: Quorum::new(n, t).unwrap(),
        }
    }

    pub(crate) fn n(&self) -> usize {
        self.quorum.n()
    }

    pub(crate) fn quorum(&self) -> Quorum {
        self.quorum
    }

    pub(crate) fn public_key(&self) -> PublicKey {
        self.sks.public_keys().public_key()
    }

    pub(crate) fn public_key_share(&self, index: SignerIndex) -> PublicKeyShare {
        self.sks.public_keys().public_key_share(index.share_position())
    }

    pub(crate) fn share_keys(&self) -> BTreeMap<SignerIndex, PublicKeyShare> {
        (1..=self.n() as u16)
            .map(|i| (idx(i), self.public_key_share(idx(i))))
            .collect()
    }

    fn share_scalar(&self, index: SignerIndex) -> Fr {
        let share = self.sks.secret_key_share(index.share_position());
        fr_from_be_bytes(share.to_bytes()).unwrap()
    }

    /// What signer `index` computes for `blinded`.
    pub(crate) fn partial_signature(
        &self,
        index: SignerIndex,
        blinded: &BlindedMessage,
    ) -> PartialSignature {
        // signing a G2, not message bytes, so SecretKeyShare::sign does not apply
        let sig_g2 = sign_g2(blinded.point(), self.share_scalar(index));
        PartialSignature {
            signer_index: index,
            bytes: g2_to_be_bytes(sig_g2),
            block_number: Some(100),
            quota: Some(QuotaStatus {
                performed_query_count: 1,
                total_quota: 10,
            }),
            key_version: 1,
            signer_version: "1.0.0".to_string(),
            warnings: vec![],
            session_id: None,
        }
    }

    /// The combined signature over `blinded`, computed by `blsttc`.
    pub(crate) fn full_signature(&self, blinded: &BlindedMessage) -> CombinedSignature {
        let shares: Vec<SignatureShare> = (1..=self.quorum.t() as u16)
            .map(|i| SignatureShare::from_bytes(self.partial_signature(idx(i), blinded).bytes))
            .collect::<Result<_, _>>()
            .unwrap();
        let signature = self
            .sks
            .public_keys()
            .combine_signatures(shares.iter().enumerate())
            .unwrap();
        CombinedSignature::from(signature)
    }
}

#[derive(Clone, Debug)]
pub(crate) enum Behavior {
    Honest,
    /// A valid point signed with the wrong scalar.
    WrongShare,
    /// Bytes that do not decode to a point.
    Garbage,
    KeyVersion(KeyVersion),
    Fail(SignerError),
    Hang,
    Panic,
}

/// Signer answering from a [`KeyFixture`] after a fixed delay.
pub(crate) struct FakeSigner {
    index: SignerIndex,
    url: String,
    keys: Arc<KeyFixture>,
    delay: Duration,
    behavior: Behavior,
    block_number: Option<u64>,
    total_quota: u64,
    warnings: Vec<String>,
    received: Mutex<Vec<BlindedMessage>>,
}

impl FakeSigner {
    pub(crate) fn new(keys: Arc<KeyFixture>, index: u16, delay_ms: u64) -> Self {
        Self {
            index: idx(index),
            url: format!("http://signer-{index}.test"),
            keys,
            delay: Duration::from_millis(delay_ms),
            behavior: Behavior::Honest,
            block_number: Some(100),
            total_quota: 10,
            warnings: vec![],
            received: Mutex::default(),
        }
    }

    pub(crate) fn behave(mut self, behavior: Behavior) -> Self {
        self.behavior = behavior;
        self
    }

    pub(crate) fn block_number(mut self, block_number: Option<u64>) -> Self {
        self.block_number = block_number;
        self
    }

    pub(crate) fn total_quota(mut self, total_quota: u64) -> Self {
        self.total_quota = total_quota;
        self
    }

    pub(crate) fn warning(mut self, warning: &str) -> Self {
        self.warnings.push(warning.to_string());
        self
    }

    pub(crate) fn calls(&self) -> usize {
        self.received().len()
    }

    /// Every blinded message this signer was asked to sign, in call order.
    pub(crate) fn received(&self) -> Vec<BlindedMessage> {
        self.received.lock().unwrap().clone()
    }
}

#[async_trait]
impl SignerClient for FakeSigner {
    fn index(&self) -> SignerIndex {
        self.index
    }

    fn url(&self) -> &str {
        &self.url
    }

    async fn send(
        &self,
        request: &SignRequest,
        ctx: &RequestContext,
    ) -> Result<PartialSignature, SignerError> {
        let blinded = request.blinded();
        self.received.lock().unwrap().push(blinded.clone());
        tokio::time::sleep(self.delay).await;

        let mut partial = self.keys.partial_signature(self.index, blinded);
        partial.block_number = self.block_number;
        partial.quota = Some(QuotaStatus {
            performed_query_count: 1,
            total_quota: self.total_quota,
        });
        partial.key_version = ctx.key_version;
        partial.warnings = self.warnings.clone();
        partial.session_id = Some(ctx.session_id.to_string());

        match &self.behavior {
            Behavior::Honest => {}
            Behavior::WrongShare => {
                let mut wrong = self.keys.share_scalar(self.index);
                wrong.add_assign(&Fr::one());
                partial.bytes = g2_to_be_bytes(sign_g2(blinded.point(), wrong));
            }
            Behavior::Garbage => partial.bytes = [0x5a; 96],
            Behavior::KeyVersion(version) => partial.key_version = *version,
            Behavior::Fail(err) => return Err(err.clone()),
            Behavior::Hang => std::future::pending::<()>().await,
            Behavior::Panic => panic!("signer {} crashed", self.index),
        }
        Ok(partial)
    }
}

/// Records every measurement, keyed by metric name and labels.
#[derive(Default)]
pub(crate) struct InMemorySink {
    counters: Mutex<BTreeMap<String, u64>>,
    histograms: Mutex<BTreeMap<String, Vec<f64>>>,
}

fn series(key: &str, labels: &Labels) -> String {
    let labels: Vec<String> = labels.iter().map(|(k, v)| format!("{k}={v}")).collect();
    format!("{key}{{{}}}", labels.join(","))
}

impl InMemorySink {
    pub(crate) fn counter(&self, key: &str, labels: &Labels) -> u64 {
        let counters = self.counters.lock().unwrap();
        counters.get(&series(key, labels)).copied().unwrap_or(0)
    }

    /// Sum of a counter over all label values.
    pub(crate) fn counter_total(&self, key: &str) -> u64 {
        let counters = self.counters.lock().unwrap();
        counters
            .iter()
            .filter(|(series, _)| series.starts_with(&format!("{key}{{")))
            .map(|(_, v)| *v)
            .sum()
    }

    pub(crate) fn samples(&self, key: &str, labels: &Labels) -> Vec<f64> {
        let histograms = self.histograms.lock().unwrap();
        histograms
            .get(&series(key, labels))
            .cloned()
            .unwrap_or_default()
    }
}

impl MetricsSink for InMemorySink {
    fn increment(&self, key: &'static str, labels: &Labels) {
        *self
            .counters
            .lock()
            .unwrap()
            .entry(series(key, labels))
            .or_default() += 1;
    }

    fn record(&self, key: &'static str, labels: &Labels, value: f64) {
        self.histograms
            .lock()
            .unwrap()
            .entry(series(key, labels))
            .or_default()
            .push(value);
    }
}
