//! Completion bookkeeping on both sides of the protocol.
//!
//! The producer counts what it sent ([`PublicationLedger`]) and learns about
//! consumption only through status events ([`ConsumptionTracker`]). Each
//! consumer counts what it accepted per scope ([`ScopeLedger`]). The two sides
//! share no memory; they agree through the counts carried on the completion
//! markers.

use std::{
    collections::{BTreeMap, BTreeSet},
    path::PathBuf,
    time::Duration,
};

use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::{
    error::{MessagingError, MessagingResult},
    messages::{CompletionStatus, EvaluationStatus},
};

/// What the producer has published so far.
#[derive(Debug, Default)]
pub(crate) struct PublicationLedger {
    message_count: u64,
    ungrouped_count: u64,
    group_counts: BTreeMap<String, u64>,
    completed_groups: BTreeSet<String>,
    status_count: u64,
}

impl PublicationLedger {
    /// Checks that a statistics message for `group_id` may still be published.
    pub(crate) fn check_open(&self, group_id: Option<&str>) -> MessagingResult<()> {
        match group_id {
            Some(group) if self.completed_groups.contains(group) => Err(MessagingError::InvalidState(format!(
                "group {} was already marked complete",
                group
            ))),
            _ => Ok(()),
        }
    }

    pub(crate) fn record_statistics(&mut self, group_id: Option<&str>) {
        self.message_count += 1;
        match group_id {
            Some(group) => *self.group_counts.entry(group.to_string()).or_default() += 1,
            None => self.ungrouped_count += 1,
        }
    }

    pub(crate) fn record_status(&mut self) {
        self.status_count += 1;
    }

    /// Marks a group complete and returns its message count.
    pub(crate) fn complete_group(&mut self, group_id: &str) -> MessagingResult<u64> {
        let count = self.group_counts.get(group_id).copied().ok_or_else(|| {
            MessagingError::InvalidState(format!("no statistics were published for group {}", group_id))
        })?;
        if !self.completed_groups.insert(group_id.to_string()) {
            return Err(MessagingError::InvalidState(format!(
                "group {} was already marked complete",
                group_id
            )));
        }
        Ok(count)
    }

    pub(crate) fn incomplete_groups(&self) -> Vec<String> {
        self.group_counts
            .keys()
            .filter(|group| !self.completed_groups.contains(*group))
            .cloned()
            .collect()
    }

    pub(crate) fn message_count(&self) -> u64 {
        self.message_count
    }

    pub(crate) fn ungrouped_count(&self) -> u64 {
        self.ungrouped_count
    }

    pub(crate) fn group_counts(&self) -> &BTreeMap<String, u64> {
        &self.group_counts
    }

    pub(crate) fn status_count(&self) -> u64 {
        self.status_count
    }
}

/// Why an evaluation did not complete.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureReport {
    /// Consumer that reported the failure; `None` when the producer stopped.
    pub consumer_id: Option<String>,
    pub group_id: Option<String>,
    pub cause: String,
}

/// Aggregate state of an evaluation's round trip, as seen by the producer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Pending,
    Succeeded,
    Failed(FailureReport),
}

#[derive(Debug, Default)]
struct ConsumptionState {
    consumers: BTreeSet<String>,
    published_groups: Option<BTreeSet<String>>,
    succeeded: BTreeSet<String>,
    groups_consumed: BTreeMap<String, BTreeSet<String>>,
    resources: BTreeSet<PathBuf>,
}

impl ConsumptionState {
    fn is_complete(&self) -> bool {
        let Some(groups) = &self.published_groups else {
            return false;
        };

        self.consumers.iter().all(|consumer| {
            self.succeeded.contains(consumer)
                && self
                    .groups_consumed
                    .get(consumer)
                    .is_some_and(|consumed| consumed.is_superset(groups))
                || (self.succeeded.contains(consumer) && groups.is_empty())
        })
    }

    fn pending(&self) -> Vec<String> {
        let mut pending = Vec::new();
        if self.published_groups.is_none() {
            pending.push("publication".to_string());
        }

        for consumer in &self.consumers {
            if !self.succeeded.contains(consumer) {
                pending.push(format!("consumer {}", consumer));
            }
            if let Some(groups) = &self.published_groups {
                let consumed = self.groups_consumed.get(consumer);
                for group in groups {
                    if !consumed.is_some_and(|consumed| consumed.contains(group)) {
                        pending.push(format!("group {} at consumer {}", group, consumer));
                    }
                }
            }
        }
        pending
    }
}

/// Producer-side view of consumption, fed by status events.
///
/// Resolves to `Succeeded` once publication is complete and every negotiated
/// consumer reported success for the whole evaluation and for every published
/// group; resolves to `Failed` on the first reported failure.
pub(crate) struct ConsumptionTracker {
    evaluation_id: String,
    state: Mutex<ConsumptionState>,
    outcome: watch::Sender<Outcome>,
}

impl ConsumptionTracker {
    pub(crate) fn new(evaluation_id: &str) -> Self {
        let (outcome, _) = watch::channel(Outcome::Pending);
        Self {
            evaluation_id: evaluation_id.to_string(),
            state: Mutex::new(ConsumptionState::default()),
            outcome,
        }
    }

    pub(crate) fn register_consumers(&self, consumers: &BTreeSet<String>) {
        self.state.lock().consumers.extend(consumers.iter().cloned());
    }

    pub(crate) fn publication_complete(&self, groups: BTreeSet<String>) {
        let mut state = self.state.lock();
        state.published_groups = Some(groups);
        self.resolve(&state);
    }

    /// Applies a status event sent by a consumer.
    pub(crate) fn record(&self, status: &EvaluationStatus) {
        let Some(consumer) = status.consumer_id() else {
            return;
        };

        let mut state = self.state.lock();
        if !state.consumers.contains(consumer) {
            debug!(
                "ignoring {:?} from consumer {} which was not negotiated for evaluation {}",
                status.completion_status, consumer, self.evaluation_id
            );
            return;
        }

        state.resources.extend(status.resources_created.iter().cloned());

        match status.completion_status {
            CompletionStatus::GroupConsumptionComplete => {
                if let Some(group) = &status.group_id {
                    debug!("consumer {} completed group {} of {}", consumer, group, self.evaluation_id);
                    state
                        .groups_consumed
                        .entry(consumer.to_string())
                        .or_default()
                        .insert(group.clone());
                }
            }
            CompletionStatus::ConsumptionCompleteReportedSuccess => {
                info!("consumer {} completed evaluation {}", consumer, self.evaluation_id);
                state.succeeded.insert(consumer.to_string());
            }
            CompletionStatus::ConsumptionCompleteReportedFailure => {
                let report = FailureReport {
                    consumer_id: Some(consumer.to_string()),
                    group_id: status.group_id.clone(),
                    cause: status
                        .cause
                        .clone()
                        .unwrap_or_else(|| "no cause was reported".to_string()),
                };
                warn!(
                    "consumer {} failed evaluation {}: {}",
                    consumer, self.evaluation_id, report.cause
                );
                self.fail(report);
                return;
            }
            _ => return,
        }

        self.resolve(&state);
    }

    /// Resolves the outcome as failed unless it is already resolved.
    pub(crate) fn fail(&self, report: FailureReport) {
        self.outcome.send_if_modified(|outcome| {
            if *outcome == Outcome::Pending {
                *outcome = Outcome::Failed(report);
                true
            } else {
                false
            }
        });
    }

    fn resolve(&self, state: &ConsumptionState) {
        if state.is_complete() {
            self.outcome.send_if_modified(|outcome| {
                if *outcome == Outcome::Pending {
                    *outcome = Outcome::Succeeded;
                    true
                } else {
                    false
                }
            });
        }
    }

    pub(crate) fn outcome(&self) -> Outcome {
        self.outcome.borrow().clone()
    }

    pub(crate) fn resources(&self) -> BTreeSet<PathBuf> {
        self.state.lock().resources.clone()
    }

    /// Waits for a resolved outcome.
    ///
    /// # Errors
    /// `Timeout` when `timeout` elapses first; nothing is changed, so waiting again is allowed.
    pub(crate) async fn wait(&self, timeout: Option<Duration>) -> MessagingResult<Outcome> {
        let mut outcomes = self.outcome.subscribe();
        let resolved = async move {
            outcomes
                .wait_for(|outcome| *outcome != Outcome::Pending)
                .await
                .map(|outcome| outcome.clone())
        };

        let outcome = match timeout {
            Some(waited) => tokio::time::timeout(waited, resolved).await.map_err(|_| {
                MessagingError::Timeout {
                    evaluation_id: self.evaluation_id.clone(),
                    waited,
                    pending: self.state.lock().pending().join(", "),
                }
            })?,
            None => resolved.await,
        };

        outcome.map_err(|_| MessagingError::InvalidState("completion tracker was dropped".to_string()))
    }
}

/// Result of one consumer scope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ScopeOutcome {
    Succeeded(BTreeSet<PathBuf>),
    Failed(String),
}

/// Consumer-side counts for one scope: the ungrouped statistics of an
/// evaluation or one group.
#[derive(Debug, Default)]
pub(crate) struct ScopeLedger {
    expected: Option<u64>,
    dispatched: u64,
    accepted: u64,
    finalizing: bool,
    outcome: Option<ScopeOutcome>,
}

impl ScopeLedger {
    pub(crate) fn expect(&mut self, count: u64) {
        if let Some(previous) = self.expected.filter(|previous| *previous != count) {
            warn!("expected count changed from {} to {}", previous, count);
        }
        self.expected = Some(count);
    }

    pub(crate) fn dispatched(&mut self) {
        self.dispatched += 1;
    }

    pub(crate) fn accepted(&mut self) {
        self.accepted += 1;
    }

    /// True once, when every expected message was accepted.
    pub(crate) fn begin_finalize(&mut self) -> bool {
        let ready = self.outcome.is_none() && !self.finalizing && self.expected == Some(self.accepted);
        if ready {
            self.finalizing = true;
        }
        ready
    }

    pub(crate) fn resolve(&mut self, outcome: ScopeOutcome) {
        if self.outcome.is_none() {
            self.outcome = Some(outcome);
        }
    }

    pub(crate) fn outcome(&self) -> Option<&ScopeOutcome> {
        self.outcome.as_ref()
    }

    pub(crate) fn is_resolved(&self) -> bool {
        self.outcome.is_some()
    }

    pub(crate) fn counts(&self) -> (u64, u64) {
        (self.dispatched, self.accepted)
    }
}
