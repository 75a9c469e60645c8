//! Off-path consistency checks over the signer responses of every round.
//!
//! The dispatcher hands a [`RoundReport`] to the [`DiscrepancyMonitor`] and
//! moves on; inspection, logging and metrics happen on a separate task.
use crate::error::SignerErrorKind;
use crate::identifier::Account;
use crate::metrics::{
    MetricsSink, METRICS_COMBINE_ATTEMPTS, METRICS_DISCREPANCIES, METRICS_ROUNDS,
    METRICS_SIGNER_ERRORS, METRICS_SIGNER_LATENCY,
};
use crate::types::{PartialSignature, QuotaStatus, SignerIndex};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

/// How far apart signer responses may be before they are reported.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Tolerances {
    pub max_block_discrepancy: u64,
    pub max_query_count_discrepancy: u64,
    pub max_total_quota_discrepancy: u64,
}

impl Default for Tolerances {
    fn default() -> Self {
        Self {
            max_block_discrepancy: 3,
            max_query_count_discrepancy: 5,
            max_total_quota_discrepancy: 5,
        }
    }
}

/// What a signer reported besides its share.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResponseMetadata {
    pub block_number: Option<u64>,
    pub quota: Option<QuotaStatus>,
    pub signer_version: String,
    pub warnings: Vec<String>,
    pub session_id: Option<String>,
}

impl From<&PartialSignature> for ResponseMetadata {
    fn from(partial: &PartialSignature) -> Self {
        Self {
            block_number: partial.block_number,
            quota: partial.quota,
            signer_version: partial.signer_version.clone(),
            warnings: partial.warnings.clone(),
            session_id: partial.session_id.clone(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SignerObservation {
    pub signer: SignerIndex,
    pub url: String,
    pub outcome: Result<ResponseMetadata, SignerErrorKind>,
    pub latency: Duration,
}

/// Everything the dispatcher saw during one round.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RoundReport {
    pub session_id: Uuid,
    pub account: Account,
    pub observations: Vec<SignerObservation>,
    pub attempts: usize,
    pub combined: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Discrepancy {
    NoSuccessfulResponses,
    BlockNumberSpread { min: u64, max: u64 },
    TotalQuotaMismatch { min: u64, max: u64, severe: bool },
    QueryCountMismatch { min: u64, max: u64, severe: bool },
    VersionMismatch { versions: Vec<String> },
    WarningsMismatch,
    FailOpen { signer: SignerIndex, warning: String },
    MissingBlockNumber { signer: SignerIndex },
    MissingSessionId { count: usize },
    InconsistentFailures { kinds: Vec<SignerErrorKind> },
}

impl Discrepancy {
    pub fn label(&self) -> &'static str {
        match self {
            Discrepancy::NoSuccessfulResponses => "no_successful_responses",
            Discrepancy::BlockNumberSpread { .. } => "block_number_spread",
            Discrepancy::TotalQuotaMismatch { .. } => "total_quota_mismatch",
            Discrepancy::QueryCountMismatch { .. } => "query_count_mismatch",
            Discrepancy::VersionMismatch { .. } => "version_mismatch",
            Discrepancy::WarningsMismatch => "warnings_mismatch",
            Discrepancy::FailOpen { .. } => "fail_open",
            Discrepancy::MissingBlockNumber { .. } => "missing_block_number",
            Discrepancy::MissingSessionId { .. } => "missing_session_id",
            Discrepancy::InconsistentFailures { .. } => "inconsistent_failures",
        }
    }

    /// Logged as an error rather than a warning.
    pub fn is_severe(&self) -> bool {
        match self {
            Discrepancy::NoSuccessfulResponses | Discrepancy::BlockNumberSpread { .. } => true,
            Discrepancy::TotalQuotaMismatch { severe, .. }
            | Discrepancy::QueryCountMismatch { severe, .. } => *severe,
            _ => false,
        }
    }
}

fn spread(values: impl IntoIterator<Item = u64>) -> Option<(u64, u64)> {
    values.into_iter().fold(None, |acc, v| match acc {
        None => Some((v, v)),
        Some((min, max)) => Some((min.min(v), max.max(v))),
    })
}

fn is_fail_open(warning: &str) -> bool {
    let warning = warning.to_lowercase();
    warning.contains("fail open") || warning.contains("failing open")
}

/// Compares the responses of one round.
pub fn inspect(report: &RoundReport, tolerances: &Tolerances) -> Vec<Discrepancy> {
    let mut found = Vec::new();
    let successes: Vec<(SignerIndex, &ResponseMetadata)> = report
        .observations
        .iter()
        .filter_map(|o| o.outcome.as_ref().ok().map(|m| (o.signer, m)))
        .collect();

    if successes.is_empty() {
        found.push(Discrepancy::NoSuccessfulResponses);
    }

    for (signer, meta) in &successes {
        if meta.block_number.is_none() {
            found.push(Discrepancy::MissingBlockNumber { signer: *signer });
        }
    }
    if let Some((min, max)) = spread(successes.iter().filter_map(|(_, m)| m.block_number)) {
        if max - min >= tolerances.max_block_discrepancy {
            found.push(Discrepancy::BlockNumberSpread { min, max });
        }
    }

    let quotas: Vec<QuotaStatus> = successes.iter().filter_map(|(_, m)| m.quota).collect();
    if let Some((min, max)) = spread(quotas.iter().map(|q| q.total_quota)) {
        if min != max {
            found.push(Discrepancy::TotalQuotaMismatch {
                min,
                max,
                severe: max - min >= tolerances.max_total_quota_discrepancy,
            });
        }
    }
    if let Some((min, max)) = spread(quotas.iter().map(|q| q.performed_query_count)) {
        if min != max {
            found.push(Discrepancy::QueryCountMismatch {
                min,
                max,
                severe: max - min >= tolerances.max_query_count_discrepancy,
            });
        }
    }

    let versions: BTreeSet<&str> = successes
        .iter()
        .map(|(_, m)| m.signer_version.as_str())
        .collect();
    if versions.len() > 1 {
        found.push(Discrepancy::VersionMismatch {
            versions: versions.into_iter().map(str::to_string).collect(),
        });
    }

    let warning_sets: BTreeSet<BTreeSet<&str>> = successes
        .iter()
        .map(|(_, m)| m.warnings.iter().map(String::as_str).collect())
        .collect();
    if warning_sets.len() > 1 {
        found.push(Discrepancy::WarningsMismatch);
    }
    for (signer, meta) in &successes {
        if let Some(warning) = meta.warnings.iter().find(|w| is_fail_open(w)) {
            found.push(Discrepancy::FailOpen {
                signer: *signer,
                warning: warning.clone(),
            });
        }
    }

    let session_id = report.session_id.to_string();
    let missing = successes
        .iter()
        .filter(|(_, m)| m.session_id.as_deref() != Some(session_id.as_str()))
        .count();
    if missing > 0 {
        found.push(Discrepancy::MissingSessionId { count: missing });
    }

    let kinds: BTreeSet<SignerErrorKind> = report
        .observations
        .iter()
        .filter_map(|o| o.outcome.as_ref().err().copied())
        .filter(|k| *k != SignerErrorKind::Timeout)
        .collect();
    if kinds.len() > 1 {
        found.push(Discrepancy::InconsistentFailures {
            kinds: kinds.into_iter().collect(),
        });
    }

    found
}

/// Totals over the monitor's lifetime.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MonitorSummary {
    pub rounds: usize,
    pub discrepancies: BTreeMap<&'static str, usize>,
}

enum Command {
    Report(Box<RoundReport>),
    Shutdown,
}

/// Cheap handle for posting round reports. Clones share one monitor task.
#[derive(Clone, Debug)]
pub struct DiscrepancyMonitor {
    tx: mpsc::UnboundedSender<Command>,
}

/// Owner of the monitor task.
pub struct MonitorHandle {
    tx: mpsc::UnboundedSender<Command>,
    task: JoinHandle<MonitorSummary>,
}

impl DiscrepancyMonitor {
    /// Starts the monitor task on the current runtime.
    pub fn spawn(sink: Arc<dyn MetricsSink>, tolerances: Tolerances) -> (Self, MonitorHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run(rx, sink, tolerances));
        (Self { tx: tx.clone() }, MonitorHandle { tx, task })
    }

    /// Queues `report` for inspection. Never blocks and never fails.
    pub fn observe(&self, report: RoundReport) {
        if self.tx.send(Command::Report(Box::new(report))).is_err() {
            tracing::debug!("monitor stopped, dropping round report");
        }
    }
}

impl MonitorHandle {
    /// Processes every report queued so far, then stops the task.
    pub async fn shutdown(self) -> MonitorSummary {
        // the task may already be gone, the join below reports it
        let _ = self.tx.send(Command::Shutdown);
        match self.task.await {
            Ok(summary) => summary,
            Err(err) => {
                tracing::error!("monitor task failed: {err:?}");
                MonitorSummary::default()
            }
        }
    }
}

async fn run(
    mut rx: mpsc::UnboundedReceiver<Command>,
    sink: Arc<dyn MetricsSink>,
    tolerances: Tolerances,
) -> MonitorSummary {
    let mut summary = MonitorSummary::default();
    while let Some(command) = rx.recv().await {
        match command {
            Command::Report(report) => process(&report, sink.as_ref(), &tolerances, &mut summary),
            Command::Shutdown => break,
        }
    }
    tracing::debug!(rounds = summary.rounds, "monitor stopped");
    summary
}

fn process(
    report: &RoundReport,
    sink: &dyn MetricsSink,
    tolerances: &Tolerances,
    summary: &mut MonitorSummary,
) {
    summary.rounds += 1;
    let outcome = if report.combined { "combined" } else { "failed" };
    sink.increment(METRICS_ROUNDS, &[("outcome", outcome.to_string())]);
    sink.record(METRICS_COMBINE_ATTEMPTS, &[], report.attempts as f64);

    for observation in &report.observations {
        let signer = observation.signer.to_string();
        sink.record(
            METRICS_SIGNER_LATENCY,
            &[("signer", signer.clone())],
            observation.latency.as_secs_f64(),
        );
        if let Err(kind) = observation.outcome {
            sink.increment(
                METRICS_SIGNER_ERRORS,
                &[("signer", signer), ("kind", kind.as_str().to_string())],
            );
        }
    }

    for discrepancy in inspect(report, tolerances) {
        if discrepancy.is_severe() {
            tracing::error!(
                session_id = %report.session_id,
                account = %report.account,
                ?discrepancy,
                "signer responses disagree"
            );
        } else {
            tracing::warn!(
                session_id = %report.session_id,
                account = %report.account,
                ?discrepancy,
                "signer responses disagree"
            );
        }
        sink.increment(
            METRICS_DISCREPANCIES,
            &[("kind", discrepancy.label().to_string())],
        );
        *summary.discrepancies.entry(discrepancy.label()).or_default() += 1;
    }
}
