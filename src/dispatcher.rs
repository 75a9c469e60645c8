use crate::blinding::{BlindedMessage, BlindingCodec};
use crate::combiner::{CombinedSignature, ThresholdCombiner};
use crate::error::{CombineError, CombinerError, ConfigError, InsufficientSigners, SignerError};
use crate::monitor::{DiscrepancyMonitor, ResponseMetadata, RoundReport, SignerObservation};
use crate::signer::{SignRequest, SignerClient};
use crate::types::{KeyVersion, PartialSignature, Quorum, RequestContext, SignerIndex};
use blsttc::{PublicKey, PublicKeyShare, SignatureShare};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::instrument;

/// Lower bound of the default number of combinations tried per round.
pub const DEFAULT_MAX_COMBINE_ATTEMPTS: usize = 10;

/// Combinations tried per round unless configured otherwise.
///
/// A single bad signer among the first `t` answers costs up to `t + 1`
/// attempts, so the bound grows with the quorum.
pub fn default_max_combine_attempts(quorum: Quorum) -> usize {
    DEFAULT_MAX_COMBINE_ATTEMPTS.max(quorum.n() + 1)
}

/// A verified combined signature and the signers it was built from, in
/// index order.
#[derive(Clone, Debug, PartialEq)]
pub struct DispatchOutcome {
    pub signature: CombinedSignature,
    pub signers: Vec<SignerIndex>,
    pub attempts: usize,
}

/// Fans a blinded message out to every signer and combines the first
/// verifying `t`-subset of their answers.
pub struct QuorumDispatcher {
    signers: Vec<Arc<dyn SignerClient>>,
    combiner: ThresholdCombiner,
    codec: BlindingCodec,
    public_key: PublicKey,
    share_keys: Option<BTreeMap<SignerIndex, PublicKeyShare>>,
    max_combine_attempts: usize,
    monitor: Option<DiscrepancyMonitor>,
}

impl QuorumDispatcher {
    /// `signers` must hold exactly one client per index `1..=n`.
    pub fn new(
        signers: Vec<Arc<dyn SignerClient>>,
        quorum: Quorum,
        public_key: PublicKey,
    ) -> Result<Self, ConfigError> {
        if signers.len() != quorum.n() {
            return Err(ConfigError::InvalidSigners(format!(
                "expected {} signers, got {}",
                quorum.n(),
                signers.len()
            )));
        }
        let mut seen = BTreeSet::new();
        for signer in &signers {
            let index = signer.index();
            if !quorum.contains(index) || !seen.insert(index) {
                return Err(ConfigError::InvalidSigners(format!(
                    "signer index {index} is duplicated or out of range"
                )));
            }
        }
        Ok(Self {
            signers,
            combiner: ThresholdCombiner::new(quorum),
            codec: BlindingCodec::new(),
            public_key,
            share_keys: None,
            max_combine_attempts: default_max_combine_attempts(quorum),
            monitor: None,
        })
    }

    /// Per-signer public keys. With them a failed combination is followed by
    /// a check of every share in it, and signers with a bad share are dropped
    /// from the round.
    pub fn with_share_keys(mut self, share_keys: BTreeMap<SignerIndex, PublicKeyShare>) -> Self {
        self.share_keys = Some(share_keys);
        self
    }

    pub fn with_max_combine_attempts(mut self, max_combine_attempts: usize) -> Self {
        self.max_combine_attempts = max_combine_attempts.max(1);
        self
    }

    pub fn with_monitor(mut self, monitor: DiscrepancyMonitor) -> Self {
        self.monitor = Some(monitor);
        self
    }

    pub fn quorum(&self) -> Quorum {
        self.combiner.quorum()
    }

    fn url_of(&self, index: SignerIndex) -> String {
        self.signers
            .iter()
            .find(|s| s.index() == index)
            .map(|s| s.url().to_string())
            .unwrap_or_default()
    }

    /// Runs one round: asks every signer at once and returns as soon as a
    /// `t`-subset of the answers combines into a signature that verifies
    /// against the blinded message.
    ///
    /// The request is signed once up front; if that fails nothing is sent.
    /// Calls still in flight when the result is known are aborted. Their
    /// signers may still have charged the account.
    #[instrument(level = "debug", skip_all, fields(session_id = %ctx.session_id))]
    pub async fn dispatch(
        &self,
        blinded: &BlindedMessage,
        ctx: &RequestContext,
    ) -> Result<DispatchOutcome, CombinerError> {
        let request = Arc::new(SignRequest::new(blinded, ctx)?);
        let started = Instant::now();
        let mut calls = JoinSet::new();
        let mut tasks = HashMap::new();
        for signer in &self.signers {
            let index = signer.index();
            let signer = Arc::clone(signer);
            let request = Arc::clone(&request);
            let ctx = ctx.clone();
            let handle = calls.spawn(async move {
                let started = Instant::now();
                let result = signer.send(&request, &ctx).await;
                (signer.index(), result, started.elapsed())
            });
            tasks.insert(handle.id(), index);
        }

        let mut round = Round::new(self.quorum().t(), ctx.key_version);
        let deadline = tokio::time::sleep_until(ctx.deadline);
        tokio::pin!(deadline);

        let result = loop {
            tokio::select! {
                joined = calls.join_next() => match joined {
                    Some(Ok((index, result, latency))) => {
                        self.record(&mut round, index, result, latency)
                    }
                    Some(Err(err)) => {
                        tracing::error!("signer task failed: {err:?}");
                        if let Some(index) = tasks.get(&err.id()) {
                            self.record(
                                &mut round,
                                *index,
                                Err(SignerError::unreachable("signer task failed")),
                                started.elapsed(),
                            );
                        }
                    }
                    None => break Err(round.give_up()),
                },
                _ = &mut deadline => {
                    tracing::debug!(pending = calls.len(), "deadline passed");
                    for signer in &self.signers {
                        if !round.answered(signer.index()) {
                            self.record(
                                &mut round,
                                signer.index(),
                                Err(SignerError::Timeout),
                                started.elapsed(),
                            );
                        }
                    }
                    break Err(round.give_up());
                }
            }

            if let Some(done) = self.try_combine(&mut round, blinded) {
                break done;
            }
            if round.usable().len() + calls.len() < round.t {
                break Err(round.give_up());
            }
        };
        // aborts the calls still in flight
        drop(calls);

        match &result {
            Ok(outcome) => tracing::debug!(
                attempts = outcome.attempts,
                elapsed = ?started.elapsed(),
                "combined signature"
            ),
            Err(err) => tracing::warn!(attempts = round.attempts, "round failed: {err}"),
        }
        if let Some(monitor) = &self.monitor {
            monitor.observe(RoundReport {
                session_id: ctx.session_id,
                account: ctx.account.clone(),
                observations: round.observations,
                attempts: round.attempts,
                combined: result.is_ok(),
            });
        }
        result
    }

    fn record(
        &self,
        round: &mut Round,
        index: SignerIndex,
        result: Result<PartialSignature, SignerError>,
        latency: Duration,
    ) {
        let result = match result {
            Ok(partial) if partial.signer_index != index => Err(SignerError::malformed(format!(
                "answered as signer {}",
                partial.signer_index
            ))),
            Ok(partial) if SignatureShare::from_bytes(partial.bytes).is_err() => {
                Err(SignerError::malformed("partial signature is not a valid G2 point"))
            }
            other => other,
        };
        let outcome = match result {
            Ok(partial) => {
                let meta = ResponseMetadata::from(&partial);
                round.successes.push(partial);
                Ok(meta)
            }
            Err(err) => {
                tracing::debug!(signer = %index, "signer failed: {err}");
                let kind = err.kind();
                round.failures.push((index, err));
                Err(kind)
            }
        };
        round.observations.push(SignerObservation {
            signer: index,
            url: self.url_of(index),
            outcome,
            latency,
        });
    }

    /// Tries candidate subsets until one verifies or none is left.
    ///
    /// `None` means the round has to wait for more answers.
    fn try_combine(
        &self,
        round: &mut Round,
        blinded: &BlindedMessage,
    ) -> Option<Result<DispatchOutcome, CombinerError>> {
        loop {
            let subset = round.next_candidate()?;
            if round.attempts >= self.max_combine_attempts {
                return Some(Err(CombinerError::Corrupted {
                    attempts: round.attempts,
                }));
            }

            let versions: BTreeSet<KeyVersion> = subset
                .iter()
                .map(|p| p.key_version)
                .chain([round.key_version])
                .collect();
            if versions.len() > 1 {
                return Some(Err(CombinerError::InconsistentShareVersions(
                    versions.into_iter().collect(),
                )));
            }

            let mut signers: Vec<SignerIndex> = subset.iter().map(|p| p.signer_index).collect();
            signers.sort();
            let combined = match self.combiner.combine(&subset) {
                // shares are decoded on arrival, so this is not a combination attempt
                Err(CombineError::InvalidShare(index)) => {
                    tracing::warn!(signer = %index, "partial signature is not a valid point");
                    round.excluded.insert(index);
                    continue;
                }
                Err(CombineError::InconsistentShareVersions(versions)) => {
                    return Some(Err(CombinerError::InconsistentShareVersions(versions)));
                }
                combined => combined,
            };

            round.attempts += 1;
            match combined {
                Ok(signature)
                    if self.codec.verify_blinded(&signature, blinded, &self.public_key) =>
                {
                    return Some(Ok(DispatchOutcome {
                        signature,
                        signers,
                        attempts: round.attempts,
                    }));
                }
                Ok(_) => {
                    tracing::warn!(?signers, "combined signature failed verification");
                    round.mark_failed(&signers);
                    self.exclude_invalid_shares(round, &subset, blinded);
                }
                Err(err) => {
                    tracing::error!(?signers, "could not combine: {err}");
                    round.mark_failed(&signers);
                }
            }
        }
    }

    fn exclude_invalid_shares(
        &self,
        round: &mut Round,
        subset: &[PartialSignature],
        blinded: &BlindedMessage,
    ) {
        let share_keys = match &self.share_keys {
            Some(keys) => keys,
            None => return,
        };
        for partial in subset {
            let key = match share_keys.get(&partial.signer_index) {
                Some(key) => key,
                None => continue,
            };
            let valid = SignatureShare::from_bytes(partial.bytes)
                .map(|share| key.verify_g2(&share, blinded.point()))
                .unwrap_or(false);
            if !valid {
                tracing::warn!(signer = %partial.signer_index, "partial signature failed verification");
                round.excluded.insert(partial.signer_index);
            }
        }
    }
}

/// State of one dispatch round. Lives on the dispatching task only.
struct Round {
    t: usize,
    key_version: KeyVersion,
    /// In arrival order.
    successes: Vec<PartialSignature>,
    failures: Vec<(SignerIndex, SignerError)>,
    observations: Vec<SignerObservation>,
    excluded: BTreeSet<SignerIndex>,
    failed_subsets: BTreeSet<Vec<SignerIndex>>,
    /// Number of failed subsets each signer took part in.
    suspicion: BTreeMap<SignerIndex, usize>,
    attempts: usize,
}

impl Round {
    fn new(t: usize, key_version: KeyVersion) -> Self {
        Self {
            t,
            key_version,
            successes: Vec::new(),
            failures: Vec::new(),
            observations: Vec::new(),
            excluded: BTreeSet::new(),
            failed_subsets: BTreeSet::new(),
            suspicion: BTreeMap::new(),
            attempts: 0,
        }
    }

    fn answered(&self, index: SignerIndex) -> bool {
        self.observations.iter().any(|o| o.signer == index)
    }

    fn usable(&self) -> Vec<&PartialSignature> {
        self.successes
            .iter()
            .filter(|p| !self.excluded.contains(&p.signer_index))
            .collect()
    }

    /// The first untried subset of the usable answers ranked by suspicion,
    /// then by arrival. With no failures yet that is the first `t` answers.
    ///
    /// Every skipped subset is a failed one, so this walks at most
    /// `failed_subsets.len() + 1` combinations.
    fn next_candidate(&self) -> Option<Vec<PartialSignature>> {
        let mut ranked = self.usable();
        // stable, so arrival order breaks ties
        ranked.sort_by_key(|p| self.suspicion.get(&p.signer_index).copied().unwrap_or(0));
        combinations(ranked.len(), self.t)
            .map(|positions| positions.into_iter().map(|i| ranked[i]).collect::<Vec<_>>())
            .find(|subset| !self.failed_subsets.contains(&subset_key(subset)))
            .map(|subset| subset.into_iter().cloned().collect())
    }

    fn mark_failed(&mut self, signers: &[SignerIndex]) {
        let mut key = signers.to_vec();
        key.sort();
        self.failed_subsets.insert(key);
        for signer in signers {
            *self.suspicion.entry(*signer).or_default() += 1;
        }
    }

    fn give_up(&self) -> CombinerError {
        if self.attempts > 0 {
            CombinerError::Corrupted {
                attempts: self.attempts,
            }
        } else {
            CombinerError::InsufficientSigners(InsufficientSigners {
                threshold: self.t,
                received: self.usable().len(),
                failures: self.failures.clone(),
            })
        }
    }
}

fn subset_key(subset: &[&PartialSignature]) -> Vec<SignerIndex> {
    let mut key: Vec<SignerIndex> = subset.iter().map(|p| p.signer_index).collect();
    key.sort();
    key
}

/// `k`-combinations of `0..n` in lexicographic order.
fn combinations(n: usize, k: usize) -> Combinations {
    Combinations {
        n,
        k,
        next: (k > 0 && k <= n).then(|| (0..k).collect()),
    }
}

struct Combinations {
    n: usize,
    k: usize,
    next: Option<Vec<usize>>,
}

impl Iterator for Combinations {
    type Item = Vec<usize>;

    fn next(&mut self) -> Option<Vec<usize>> {
        let current = self.next.take()?;
        let mut advanced = current.clone();
        for i in (0..self.k).rev() {
            if advanced[i] < self.n - self.k + i {
                advanced[i] += 1;
                for j in i + 1..self.k {
                    advanced[j] = advanced[j - 1] + 1;
                }
                self.next = Some(advanced);
                break;
            }
        }
        Some(current)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{AuthError, SignerErrorKind};
    use crate::monitor::Tolerances;
    use crate::test_utils::{context, idx, Behavior, FakeSigner, InMemorySink, KeyFixture};
    use crate::Identifier;

    fn blinded() -> BlindedMessage {
        let id = Identifier::phone_number("+14155550000").unwrap();
        BlindingCodec::new().blind(&id).unwrap().0
    }

    fn honest(keys: &Arc<KeyFixture>, delays_ms: &[u64]) -> Vec<FakeSigner> {
        delays_ms
            .iter()
            .enumerate()
            .map(|(i, delay)| FakeSigner::new(Arc::clone(keys), i as u16 + 1, *delay))
            .collect()
    }

    fn dispatcher(
        keys: &KeyFixture,
        signers: Vec<FakeSigner>,
    ) -> (QuorumDispatcher, Vec<Arc<FakeSigner>>) {
        let signers: Vec<Arc<FakeSigner>> = signers.into_iter().map(Arc::new).collect();
        let clients = signers
            .iter()
            .map(|s| Arc::clone(s) as Arc<dyn SignerClient>)
            .collect();
        let dispatcher = QuorumDispatcher::new(clients, keys.quorum(), keys.public_key()).unwrap();
        (dispatcher, signers)
    }

    #[test]
    fn combinations_in_lexicographic_order() {
        let all: Vec<Vec<usize>> = combinations(4, 2).collect();
        assert_eq!(
            all,
            vec![
                vec![0, 1],
                vec![0, 2],
                vec![0, 3],
                vec![1, 2],
                vec![1, 3],
                vec![2, 3]
            ]
        );
        assert_eq!(combinations(3, 3).count(), 1);
        assert_eq!(combinations(2, 3).count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn combines_first_t_arrivals() {
        let keys = Arc::new(KeyFixture::new(5, 3));
        let (dispatcher, _) = dispatcher(&keys, honest(&keys, &[50, 10, 40, 20, 30]));
        let blinded = blinded();

        let outcome = dispatcher
            .dispatch(&blinded, &context(Duration::from_secs(5)))
            .await
            .unwrap();
        assert_eq!(outcome.signers, vec![idx(2), idx(4), idx(5)]);
        assert_eq!(outcome.attempts, 1);
        assert_eq!(outcome.signature, keys.full_signature(&blinded));
    }

    #[tokio::test(start_paused = true)]
    async fn latency_is_bounded_by_the_t_th_answer() {
        let keys = Arc::new(KeyFixture::new(5, 3));
        let mut signers = honest(&keys, &[50, 50, 50, 0, 0]);
        signers[3] = FakeSigner::new(Arc::clone(&keys), 4, 0).behave(Behavior::Hang);
        signers[4] = FakeSigner::new(Arc::clone(&keys), 5, 0).behave(Behavior::Hang);
        let (dispatcher, fakes) = dispatcher(&keys, signers);

        let start = Instant::now();
        let outcome = dispatcher
            .dispatch(&blinded(), &context(Duration::from_secs(5)))
            .await
            .unwrap();
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(50));
        assert!(elapsed < Duration::from_millis(60), "took {elapsed:?}");
        assert_eq!(outcome.signers.len(), 3);
        // everybody was asked at once
        assert!(fakes.iter().all(|f| f.calls() == 1));
    }

    #[tokio::test(start_paused = true)]
    async fn wrong_share_is_routed_around() {
        let keys = Arc::new(KeyFixture::new(5, 3));
        let mut signers = honest(&keys, &[10, 20, 30, 40, 50]);
        signers[1] = FakeSigner::new(Arc::clone(&keys), 2, 20).behave(Behavior::WrongShare);
        let (dispatcher, _) = dispatcher(&keys, signers);
        let blinded = blinded();

        let outcome = dispatcher
            .dispatch(&blinded, &context(Duration::from_secs(5)))
            .await
            .unwrap();
        // {1,2,3} and {1,2,4} fail before {1,3,4} is tried
        assert_eq!(outcome.signers, vec![idx(1), idx(3), idx(4)]);
        assert_eq!(outcome.attempts, 3);
        assert_eq!(outcome.signature, keys.full_signature(&blinded));
    }

    #[tokio::test(start_paused = true)]
    async fn share_keys_pin_down_the_bad_signer() {
        let keys = Arc::new(KeyFixture::new(5, 3));
        let mut signers = honest(&keys, &[10, 20, 30, 40, 50]);
        signers[1] = FakeSigner::new(Arc::clone(&keys), 2, 20).behave(Behavior::WrongShare);
        let (dispatcher, _) = dispatcher(&keys, signers);
        let dispatcher = dispatcher.with_share_keys(keys.share_keys());

        let outcome = dispatcher
            .dispatch(&blinded(), &context(Duration::from_secs(5)))
            .await
            .unwrap();
        assert_eq!(outcome.signers, vec![idx(1), idx(3), idx(4)]);
        assert_eq!(outcome.attempts, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn undecodable_share_is_a_malformed_response() {
        let keys = Arc::new(KeyFixture::new(5, 3));
        let mut signers = honest(&keys, &[10, 20, 30, 40, 50]);
        signers[0] = FakeSigner::new(Arc::clone(&keys), 1, 10).behave(Behavior::Garbage);
        let (dispatcher, _) = dispatcher(&keys, signers);

        let outcome = dispatcher
            .dispatch(&blinded(), &context(Duration::from_secs(5)))
            .await
            .unwrap();
        assert_eq!(outcome.signers, vec![idx(2), idx(3), idx(4)]);
        assert_eq!(outcome.attempts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn undecodable_share_does_not_count_as_corruption() {
        let keys = Arc::new(KeyFixture::new(3, 2));
        let signers = vec![
            FakeSigner::new(Arc::clone(&keys), 1, 10).behave(Behavior::Garbage),
            FakeSigner::new(Arc::clone(&keys), 2, 20),
            FakeSigner::new(Arc::clone(&keys), 3, 30)
                .behave(Behavior::Fail(SignerError::QuotaExceeded)),
        ];
        let (dispatcher, _) = dispatcher(&keys, signers);

        let err = dispatcher
            .dispatch(&blinded(), &context(Duration::from_secs(5)))
            .await
            .unwrap_err();
        match err {
            CombinerError::InsufficientSigners(e) => {
                assert_eq!(e.received, 1);
                let kinds: Vec<(SignerIndex, SignerErrorKind)> =
                    e.failures.iter().map(|(i, err)| (*i, err.kind())).collect();
                assert_eq!(
                    kinds,
                    vec![
                        (idx(1), SignerErrorKind::MalformedResponse),
                        (idx(3), SignerErrorKind::QuotaExceeded)
                    ]
                );
                assert_eq!(e.majority_reason(), Some(SignerErrorKind::QuotaExceeded));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn one_bad_signer_in_a_large_quorum() {
        let keys = Arc::new(KeyFixture::new(24, 12));
        let signers = (1..=24)
            .map(|i| {
                if i == 1 {
                    FakeSigner::new(Arc::clone(&keys), 1, 1).behave(Behavior::WrongShare)
                } else {
                    FakeSigner::new(Arc::clone(&keys), i, 10 + u64::from(i))
                }
            })
            .collect();
        let (dispatcher, _) = dispatcher(&keys, signers);
        assert_eq!(dispatcher.max_combine_attempts, 25);
        let blinded = blinded();

        let outcome = dispatcher
            .dispatch(&blinded, &context(Duration::from_secs(5)))
            .await
            .unwrap();
        assert!(!outcome.signers.contains(&idx(1)));
        assert_eq!(outcome.attempts, 13);
        assert_eq!(outcome.signature, keys.full_signature(&blinded));
    }

    #[test]
    fn candidate_search_skips_only_failed_subsets() {
        let partial = |i: u16| PartialSignature {
            signer_index: idx(i),
            bytes: [0u8; 96],
            block_number: None,
            quota: None,
            key_version: 1,
            signer_version: String::new(),
            warnings: vec![],
            session_id: None,
        };
        // C(60, 30) subsets; only the failed ones may be walked
        let key = |round: &Round| {
            let next = round.next_candidate().unwrap();
            subset_key(&next.iter().collect::<Vec<_>>())
        };
        let mut round = Round::new(30, 1);
        round.successes = (1..=60).map(partial).collect();
        let first: Vec<SignerIndex> = (1..=30).map(idx).collect();
        assert_eq!(key(&round), first);

        round.mark_failed(&first);
        // the unsuspected answers come first
        let second: Vec<SignerIndex> = (31..=60).map(idx).collect();
        assert_eq!(key(&round), second);

        // equal suspicion again: arrival order, skipping the failed subset
        round.mark_failed(&second);
        let third: Vec<SignerIndex> = (1..=29).chain([31]).map(idx).collect();
        assert_eq!(key(&round), third);
    }

    #[tokio::test(start_paused = true)]
    async fn crashed_signer_is_reported() {
        let keys = Arc::new(KeyFixture::new(3, 2));
        let signers = vec![
            FakeSigner::new(Arc::clone(&keys), 1, 10).behave(Behavior::Panic),
            FakeSigner::new(Arc::clone(&keys), 2, 20),
            FakeSigner::new(Arc::clone(&keys), 3, 0).behave(Behavior::Hang),
        ];
        let (dispatcher, _) = dispatcher(&keys, signers);

        let err = dispatcher
            .dispatch(&blinded(), &context(Duration::from_secs(1)))
            .await
            .unwrap_err();
        match err {
            CombinerError::InsufficientSigners(e) => {
                assert_eq!(e.received, 1);
                let kinds: Vec<(SignerIndex, SignerErrorKind)> =
                    e.failures.iter().map(|(i, err)| (*i, err.kind())).collect();
                assert_eq!(
                    kinds,
                    vec![
                        (idx(1), SignerErrorKind::Unreachable),
                        (idx(3), SignerErrorKind::Timeout)
                    ]
                );
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn unsigned_request_sends_nothing() {
        let keys = Arc::new(KeyFixture::new(3, 2));
        let (dispatcher, fakes) = dispatcher(&keys, honest(&keys, &[10, 20, 30]));
        let mut ctx = context(Duration::from_secs(5));
        ctx.auth = Arc::new(crate::AuthSigner::custom(|_| {
            Err(AuthError::Signing("wallet locked".to_string()))
        }));

        let err = dispatcher.dispatch(&blinded(), &ctx).await.unwrap_err();
        assert_eq!(
            err,
            CombinerError::Auth(AuthError::Signing("wallet locked".to_string()))
        );
        assert!(fakes.iter().all(|f| f.calls() == 0));
    }

    #[tokio::test(start_paused = true)]
    async fn no_slack_with_n_equal_t() {
        let keys = Arc::new(KeyFixture::new(3, 3));
        let mut signers = honest(&keys, &[10, 20, 30]);
        signers[1] = FakeSigner::new(Arc::clone(&keys), 2, 20).behave(Behavior::WrongShare);
        let (dispatcher, _) = dispatcher(&keys, signers);

        let err = dispatcher
            .dispatch(&blinded(), &context(Duration::from_secs(5)))
            .await
            .unwrap_err();
        assert_eq!(err, CombinerError::Corrupted { attempts: 1 });
    }

    #[tokio::test(start_paused = true)]
    async fn attempts_are_bounded() {
        let keys = Arc::new(KeyFixture::new(4, 2));
        let signers = (1..=4)
            .map(|i| {
                let fake = FakeSigner::new(Arc::clone(&keys), i, u64::from(i) * 10);
                if i < 4 {
                    fake.behave(Behavior::WrongShare)
                } else {
                    fake
                }
            })
            .collect();
        let (dispatcher, _) = dispatcher(&keys, signers);
        let dispatcher = dispatcher.with_max_combine_attempts(2);

        let err = dispatcher
            .dispatch(&blinded(), &context(Duration::from_secs(5)))
            .await
            .unwrap_err();
        assert_eq!(err, CombinerError::Corrupted { attempts: 2 });
    }

    #[tokio::test(start_paused = true)]
    async fn fails_fast_when_quorum_is_out_of_reach() {
        let keys = Arc::new(KeyFixture::new(5, 3));
        let signers = (1..=5)
            .map(|i| {
                if i <= 3 {
                    FakeSigner::new(Arc::clone(&keys), i, 5)
                        .behave(Behavior::Fail(SignerError::QuotaExceeded))
                } else {
                    FakeSigner::new(Arc::clone(&keys), i, 1000)
                }
            })
            .collect();
        let (dispatcher, _) = dispatcher(&keys, signers);

        let start = Instant::now();
        let err = dispatcher
            .dispatch(&blinded(), &context(Duration::from_secs(5)))
            .await
            .unwrap_err();
        assert!(start.elapsed() < Duration::from_millis(10));
        match err {
            CombinerError::InsufficientSigners(e) => {
                assert_eq!(e.threshold, 3);
                assert_eq!(e.received, 0);
                assert_eq!(e.failures.len(), 3);
                assert_eq!(e.majority_reason(), Some(SignerErrorKind::QuotaExceeded));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn quorum_boundary() {
        let keys = Arc::new(KeyFixture::new(5, 3));
        let hang_after = |answering: u16| -> Vec<FakeSigner> {
            (1..=5)
                .map(|i| {
                    let signer = FakeSigner::new(Arc::clone(&keys), i, 10);
                    if i > answering {
                        signer.behave(Behavior::Hang)
                    } else {
                        signer
                    }
                })
                .collect()
        };

        let (three, _) = dispatcher(&keys, hang_after(3));
        let outcome = three
            .dispatch(&blinded(), &context(Duration::from_secs(1)))
            .await
            .unwrap();
        assert_eq!(outcome.signers, vec![idx(1), idx(2), idx(3)]);

        let (two, _) = dispatcher(&keys, hang_after(2));
        match two.dispatch(&blinded(), &context(Duration::from_secs(1))).await {
            Err(CombinerError::InsufficientSigners(e)) => {
                assert_eq!(e.received, 2);
                assert_eq!(e.failures.len(), 3);
                assert!(e.failures.iter().all(|(_, err)| *err == SignerError::Timeout));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_turns_pending_signers_into_timeouts() {
        let keys = Arc::new(KeyFixture::new(3, 2));
        let signers = vec![
            FakeSigner::new(Arc::clone(&keys), 1, 10),
            FakeSigner::new(Arc::clone(&keys), 2, 0).behave(Behavior::Hang),
            FakeSigner::new(Arc::clone(&keys), 3, 0).behave(Behavior::Hang),
        ];
        let (dispatcher, _) = dispatcher(&keys, signers);

        let start = Instant::now();
        let err = dispatcher
            .dispatch(&blinded(), &context(Duration::from_secs(1)))
            .await
            .unwrap_err();
        assert!(start.elapsed() >= Duration::from_secs(1));
        assert_eq!(
            err,
            CombinerError::InsufficientSigners(InsufficientSigners {
                threshold: 2,
                received: 1,
                failures: vec![(idx(2), SignerError::Timeout), (idx(3), SignerError::Timeout)],
            })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn mismatched_key_version_is_fatal() {
        let keys = Arc::new(KeyFixture::new(3, 2));
        let mut signers = honest(&keys, &[10, 20, 30]);
        signers[1] = FakeSigner::new(Arc::clone(&keys), 2, 20).behave(Behavior::KeyVersion(2));
        let (dispatcher, _) = dispatcher(&keys, signers);

        let err = dispatcher
            .dispatch(&blinded(), &context(Duration::from_secs(5)))
            .await
            .unwrap_err();
        assert_eq!(err, CombinerError::InconsistentShareVersions(vec![1, 2]));
    }

    #[tokio::test(start_paused = true)]
    async fn every_round_is_reported() {
        let keys = Arc::new(KeyFixture::new(3, 3));
        let mut signers = honest(&keys, &[10, 20, 30]);
        signers[1] = FakeSigner::new(Arc::clone(&keys), 2, 20)
            .total_quota(12)
            .warning("CELO_ODIS_WARN_01 BLOCKCHAIN Fail open");
        signers[2] = FakeSigner::new(Arc::clone(&keys), 3, 30).block_number(Some(90));
        let (dispatcher, _) = dispatcher(&keys, signers);
        let sink = Arc::new(InMemorySink::default());
        let (monitor, handle) = DiscrepancyMonitor::spawn(sink.clone(), Tolerances::default());
        let dispatcher = dispatcher.with_monitor(monitor);

        dispatcher
            .dispatch(&blinded(), &context(Duration::from_secs(5)))
            .await
            .unwrap();
        let summary = handle.shutdown().await;
        assert_eq!(summary.rounds, 1);
        for kind in [
            "block_number_spread",
            "total_quota_mismatch",
            "warnings_mismatch",
            "fail_open",
        ] {
            assert_eq!(summary.discrepancies.get(kind), Some(&1), "{kind}");
        }
        assert_eq!(summary.discrepancies.len(), 4);
        assert_eq!(
            sink.counter(crate::metrics::METRICS_ROUNDS, &[("outcome", "combined".to_string())]),
            1
        );
    }

    #[test]
    fn rejects_bad_signer_sets() {
        let keys = Arc::new(KeyFixture::new(3, 2));
        let clients: Vec<Arc<dyn SignerClient>> = honest(&keys, &[0, 0])
            .into_iter()
            .map(|s| Arc::new(s) as Arc<dyn SignerClient>)
            .collect();
        assert!(QuorumDispatcher::new(clients, keys.quorum(), keys.public_key()).is_err());

        let clients: Vec<Arc<dyn SignerClient>> = [1u16, 2, 2]
            .into_iter()
            .map(|i| Arc::new(FakeSigner::new(Arc::clone(&keys), i, 0)) as Arc<dyn SignerClient>)
            .collect();
        assert!(QuorumDispatcher::new(clients, keys.quorum(), keys.public_key()).is_err());
    }
}
