//! Producer side of one evaluation.
//!
//! An [`EvaluationMessager`] negotiates its consumers, publishes the
//! description and the statistics, declares publication complete and waits for
//! the consumers to report back on the status exchange.

use std::{
    collections::{BTreeMap, BTreeSet},
    path::PathBuf,
    sync::Arc,
    time::Duration,
};

use parking_lot::{Mutex, RwLock};
use rand::{Rng, seq::SliceRandom};
use tokio::{select, sync::watch, task::JoinHandle, time::Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{
    broker::{BrokerConnection, Exchange, ExchangePublisher, Inbound, connections::BrokerConnectionFactory},
    error::{MessagingError, MessagingResult},
    messages::{CompletionStatus, Envelope, EvaluationDescription, EvaluationStatus, Format, Payload, StatisticsMessage},
    tracker::{ConsumptionTracker, FailureReport, Outcome, PublicationLedger},
};

/// Tunables of an [`EvaluationMessager`].
#[derive(Debug, Clone)]
pub struct MessagerOptions {
    /// Evaluation id to use instead of a fresh UUID.
    pub evaluation_id: Option<String>,
    /// Client id stamped on status events instead of a fresh UUID.
    pub client_id: Option<String>,
    /// How long `start` waits for consumers covering every requested format.
    pub negotiation_timeout: Duration,
    /// Extra time given to further offers once every format is covered.
    pub negotiation_period: Duration,
    /// Interval at which `ConsumerRequired` is repeated while negotiating.
    pub consumer_required_interval: Duration,
    /// Interval at which consumers are told the evaluation is still alive.
    pub heartbeat_interval: Duration,
}

impl Default for MessagerOptions {
    fn default() -> Self {
        Self {
            evaluation_id: None,
            client_id: None,
            negotiation_timeout: Duration::from_secs(60),
            negotiation_period: Duration::from_millis(100),
            consumer_required_interval: Duration::from_secs(1),
            heartbeat_interval: Duration::from_secs(100),
        }
    }
}

/// Lifecycle of an [`EvaluationMessager`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessagerState {
    Created,
    Started,
    Publishing,
    PublicationComplete,
    AwaitSucceeded,
    AwaitFailed,
    Closed,
}

/// What a successful round trip produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletionReport {
    pub evaluation_id: String,
    pub consumers: BTreeSet<String>,
    pub resources: BTreeSet<PathBuf>,
    pub messages_published: u64,
    pub groups: BTreeMap<String, u64>,
}

struct Publishers {
    evaluation: Box<dyn ExchangePublisher>,
    /// Shared with the heartbeat
    status: Arc<dyn ExchangePublisher>,
    statistics: Box<dyn ExchangePublisher>,
}

impl Publishers {
    async fn close(&self) {
        for publisher in [&*self.evaluation, &*self.status, &*self.statistics] {
            if let Err(err) = publisher.close().await {
                warn!("closing the publisher for {} failed: {}", publisher.exchange().name(), err);
            }
        }
    }
}

type Offers = watch::Sender<BTreeMap<String, BTreeSet<Format>>>;

/// One evaluation run on the producer side.
pub struct EvaluationMessager {
    /// Routing key of every message of this evaluation
    evaluation_id: String,
    /// Identifies this producer on status events
    client_id: String,
    description: EvaluationDescription,
    options: MessagerOptions,
    /// Keeps the pooled connection alive while the channels are in use
    _connection: Arc<dyn BrokerConnection>,
    publishers: Publishers,
    state: Mutex<MessagerState>,
    /// Held across every publish so that counts and markers stay consistent
    ledger: tokio::sync::Mutex<PublicationLedger>,
    /// Negotiated consumer ids, stamped on every envelope
    recipients: RwLock<BTreeSet<String>>,
    tracker: Arc<ConsumptionTracker>,
    offers: Arc<Offers>,
    listener: Mutex<Option<JoinHandle<()>>>,
    heartbeat: Mutex<Option<JoinHandle<()>>>,
    cancel: CancellationToken,
}

impl EvaluationMessager {
    /// Opens the channels of a new evaluation and subscribes to its status events.
    ///
    /// Nothing is published until [`EvaluationMessager::start`].
    pub async fn open(
        description: EvaluationDescription,
        factory: &BrokerConnectionFactory,
        options: MessagerOptions,
    ) -> MessagingResult<Self> {
        if options.heartbeat_interval.is_zero() || options.consumer_required_interval.is_zero() {
            return Err(MessagingError::Configuration(
                "heartbeat and consumer-required intervals must be positive".to_string(),
            ));
        }

        let evaluation_id = options
            .evaluation_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let client_id = options
            .client_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let connection = factory.connection().await?;
        let publishers = Publishers {
            evaluation: connection.open_publisher(Exchange::Evaluation).await?,
            status: Arc::from(connection.open_publisher(Exchange::Status).await?),
            statistics: connection.open_publisher(Exchange::Statistics).await?,
        };
        let inbound = connection.subscribe(Exchange::Status, &evaluation_id).await?;

        let tracker = Arc::new(ConsumptionTracker::new(&evaluation_id));
        let (offers, _) = watch::channel(BTreeMap::new());
        let offers = Arc::new(offers);
        let cancel = CancellationToken::new();

        let listener = tokio::spawn(listen_for_status(
            evaluation_id.clone(),
            inbound,
            tracker.clone(),
            offers.clone(),
            cancel.clone(),
        ));

        debug!("opened evaluation {} as client {}", evaluation_id, client_id);

        Ok(Self {
            evaluation_id,
            client_id,
            description,
            options,
            _connection: connection,
            publishers,
            state: Mutex::new(MessagerState::Created),
            ledger: tokio::sync::Mutex::new(PublicationLedger::default()),
            recipients: RwLock::new(BTreeSet::new()),
            tracker,
            offers,
            listener: Mutex::new(Some(listener)),
            heartbeat: Mutex::new(None),
            cancel,
        })
    }

    pub fn evaluation_id(&self) -> &str {
        &self.evaluation_id
    }

    pub fn description(&self) -> &EvaluationDescription {
        &self.description
    }

    pub fn state(&self) -> MessagerState {
        *self.state.lock()
    }

    /// Consumers chosen during negotiation.
    pub fn consumers(&self) -> BTreeSet<String> {
        self.recipients.read().clone()
    }

    /// Artifact locations reported by consumers so far.
    pub fn resources_written(&self) -> BTreeSet<PathBuf> {
        self.tracker.resources()
    }

    /// Negotiates consumers and publishes the evaluation description.
    ///
    /// # Errors
    /// `InvalidState` unless freshly opened, `Negotiation` when no consumer offers
    /// a requested format in time, `Publish` when the broker rejects a send.
    pub async fn start(&self) -> MessagingResult<()> {
        let _ledger = self.ledger.lock().await;
        self.expect_state(&[MessagerState::Created], "start")?;

        self.publish_status(EvaluationStatus::new(CompletionStatus::EvaluationStarted, &self.client_id))
            .await?;

        let consumers = self.negotiate().await?;
        self.tracker.register_consumers(&consumers);
        *self.recipients.write() = consumers;

        let envelope = Envelope::new(&self.evaluation_id, Payload::Evaluation(self.description.clone()))
            .with_recipients(&self.recipients.read());
        self.publishers.evaluation.publish(&self.evaluation_id, &envelope).await?;

        *self.state.lock() = MessagerState::Started;
        let heartbeat = tokio::spawn(keep_alive(
            self.evaluation_id.clone(),
            self.client_id.clone(),
            self.recipients.read().clone(),
            self.publishers.status.clone(),
            self.tracker.clone(),
            self.options.heartbeat_interval,
            self.cancel.clone(),
        ));
        *self.heartbeat.lock() = Some(heartbeat);
        info!(
            "started evaluation {} with consumers {:?}",
            self.evaluation_id,
            self.recipients.read()
        );
        Ok(())
    }

    /// Publishes an ungrouped statistics message.
    pub async fn publish(&self, statistics: StatisticsMessage) -> MessagingResult<()> {
        self.publish_statistics(statistics, None).await
    }

    /// Publishes a statistics message belonging to `group_id`.
    pub async fn publish_grouped(&self, statistics: StatisticsMessage, group_id: &str) -> MessagingResult<()> {
        self.publish_statistics(statistics, Some(group_id)).await
    }

    async fn publish_statistics(&self, statistics: StatisticsMessage, group_id: Option<&str>) -> MessagingResult<()> {
        let mut ledger = self.ledger.lock().await;
        self.expect_state(&[MessagerState::Started, MessagerState::Publishing], "publish")?;
        ledger.check_open(group_id)?;

        let statistics = statistics.stamped(&self.evaluation_id, group_id);
        let envelope = Envelope::new(&self.evaluation_id, Payload::Statistics(statistics))
            .with_recipients(&self.recipients.read());
        self.publishers.statistics.publish(&self.evaluation_id, &envelope).await?;

        ledger.record_statistics(group_id);
        *self.state.lock() = MessagerState::Publishing;
        debug!(
            "published statistics {} of evaluation {} (group {:?})",
            ledger.message_count(),
            self.evaluation_id,
            group_id
        );
        Ok(())
    }

    /// Declares that no more statistics will follow for `group_id`.
    ///
    /// # Errors
    /// `InvalidState` when nothing was published for the group or it was already marked.
    pub async fn mark_group_publication_complete(&self, group_id: &str) -> MessagingResult<()> {
        let mut ledger = self.ledger.lock().await;
        self.expect_state(&[MessagerState::Started, MessagerState::Publishing], "mark a group complete")?;
        self.publish_group_marker(&mut ledger, group_id).await
    }

    async fn publish_group_marker(&self, ledger: &mut PublicationLedger, group_id: &str) -> MessagingResult<()> {
        let count = ledger.complete_group(group_id)?;
        self.publish_status(
            EvaluationStatus::new(CompletionStatus::GroupPublicationComplete, &self.client_id)
                .with_group(group_id)
                .with_message_count(count),
        )
        .await?;
        ledger.record_status();
        debug!("group {} of evaluation {} complete with {} messages", group_id, self.evaluation_id, count);
        Ok(())
    }

    /// Publishes the markers of groups not yet completed, then the top-level
    /// publication-complete event with the final counts.
    ///
    /// # Errors
    /// `CompletionMismatch` when the description declared a different message
    /// count; `PublicationCompleteReportedFailure` is published instead and the
    /// evaluation fails.
    pub async fn mark_publication_complete_reported_success(&self) -> MessagingResult<()> {
        let mut ledger = self.ledger.lock().await;
        self.expect_state(
            &[MessagerState::Started, MessagerState::Publishing],
            "mark publication complete",
        )?;

        for group_id in ledger.incomplete_groups() {
            self.publish_group_marker(&mut ledger, &group_id).await?;
        }

        let published = ledger.message_count();
        if let Some(declared) = self.description.expected_message_count().filter(|declared| *declared != published) {
            let cause = format!("declared {} statistics messages but published {}", declared, published);
            error!("evaluation {}: {}", self.evaluation_id, cause);
            self.publish_status(
                EvaluationStatus::new(CompletionStatus::PublicationCompleteReportedFailure, &self.client_id)
                    .with_message_count(published)
                    .with_cause(&cause),
            )
            .await?;
            self.tracker.fail(FailureReport {
                consumer_id: None,
                group_id: None,
                cause,
            });
            *self.state.lock() = MessagerState::AwaitFailed;
            return Err(MessagingError::CompletionMismatch {
                evaluation_id: self.evaluation_id.clone(),
                declared,
                published,
            });
        }

        self.publish_status(
            EvaluationStatus::new(CompletionStatus::PublicationCompleteReportedSuccess, &self.client_id)
                .with_message_count(published)
                .with_group_counts(ledger.group_counts().clone()),
        )
        .await?;
        ledger.record_status();

        self.tracker
            .publication_complete(ledger.group_counts().keys().cloned().collect());
        *self.state.lock() = MessagerState::PublicationComplete;
        info!(
            "publication of evaluation {} complete: {} messages, {} ungrouped, {} groups, {} status events",
            self.evaluation_id,
            published,
            ledger.ungrouped_count(),
            ledger.group_counts().len(),
            ledger.status_count()
        );
        Ok(())
    }

    /// Waits until every consumer reported success for the whole evaluation and
    /// every group, or until the first reported failure.
    ///
    /// Must not be called from a consumer callback.
    ///
    /// # Errors
    /// `Consumption` with the first cause a consumer reported, `EvaluationFailed`
    /// when the producer stopped the evaluation, `Timeout` when `timeout` elapsed
    /// first (nothing changes, so waiting again is allowed), `InvalidState` before
    /// publication is complete.
    pub async fn await_completion(&self, timeout: Option<Duration>) -> MessagingResult<CompletionReport> {
        match self.state() {
            MessagerState::PublicationComplete | MessagerState::AwaitSucceeded | MessagerState::AwaitFailed => {}
            other => {
                return Err(MessagingError::InvalidState(format!(
                    "cannot await evaluation {} in state {:?}",
                    self.evaluation_id, other
                )));
            }
        }

        match self.tracker.wait(timeout).await? {
            Outcome::Succeeded => {
                let first = {
                    let mut state = self.state.lock();
                    let first = *state == MessagerState::PublicationComplete;
                    *state = MessagerState::AwaitSucceeded;
                    first
                };
                if first {
                    self.publish_status(EvaluationStatus::new(
                        CompletionStatus::EvaluationCompleteReportedSuccess,
                        &self.client_id,
                    ))
                    .await?;
                    info!("evaluation {} completed", self.evaluation_id);
                }
                Ok(self.report().await)
            }
            Outcome::Failed(report) => {
                *self.state.lock() = MessagerState::AwaitFailed;
                Err(self.failure(report))
            }
            Outcome::Pending => Err(MessagingError::InvalidState(
                "completion resolved without an outcome".to_string(),
            )),
        }
    }

    /// Abandons the evaluation, telling consumers to discard it.
    pub async fn stop(&self, cause: &str) -> MessagingResult<()> {
        let _ledger = self.ledger.lock().await;
        self.expect_state(
            &[
                MessagerState::Created,
                MessagerState::Started,
                MessagerState::Publishing,
                MessagerState::PublicationComplete,
            ],
            "stop",
        )?;

        warn!("stopping evaluation {}: {}", self.evaluation_id, cause);
        self.publish_status(
            EvaluationStatus::new(CompletionStatus::EvaluationCompleteReportedFailure, &self.client_id)
                .with_cause(cause),
        )
        .await?;
        self.tracker.fail(FailureReport {
            consumer_id: None,
            group_id: None,
            cause: cause.to_string(),
        });
        *self.state.lock() = MessagerState::AwaitFailed;
        Ok(())
    }

    /// Releases the channels and the status subscription. Idempotent.
    pub async fn close(&self) -> MessagingResult<()> {
        {
            let mut state = self.state.lock();
            if *state == MessagerState::Closed {
                debug!("evaluation {} already closed", self.evaluation_id);
                return Ok(());
            }
            *state = MessagerState::Closed;
        }

        self.cancel.cancel();
        let tasks = [self.listener.lock().take(), self.heartbeat.lock().take()];
        for task in tasks.into_iter().flatten() {
            let _ = task.await;
        }
        self.publishers.close().await;

        debug!("closed evaluation {}", self.evaluation_id);
        Ok(())
    }

    async fn negotiate(&self) -> MessagingResult<BTreeSet<String>> {
        let required = self.description.formats().clone();
        if required.is_empty() {
            info!("evaluation {} requests no formats, no consumers needed", self.evaluation_id);
            return Ok(BTreeSet::new());
        }

        let mut offers = self.offers.subscribe();
        let deadline = Instant::now() + self.options.negotiation_timeout;
        let mut reminder = tokio::time::interval(self.options.consumer_required_interval);

        loop {
            let covered = covers(&offers.borrow_and_update(), &required);
            if covered {
                break;
            }

            select! {
                _ = reminder.tick() => {
                    debug!("evaluation {} requires consumers for {:?}", self.evaluation_id, required);
                    self.publish_status(
                        EvaluationStatus::new(CompletionStatus::ConsumerRequired, &self.client_id)
                            .with_formats_required(required.clone()),
                    )
                    .await?;
                }
                changed = offers.changed() => {
                    if changed.is_err() {
                        return Err(self.negotiation_failure("the status subscription ended"));
                    }
                }
                _ = tokio::time::sleep_until(deadline) => {
                    return Err(self.negotiation_failure(&format!(
                        "no consumers for {:?} within {:?}",
                        required, self.options.negotiation_timeout
                    )));
                }
            }
        }

        tokio::time::sleep(self.options.negotiation_period).await;
        let offered = self.offers.borrow().clone();
        Ok(choose_consumers(&offered, &required, &mut rand::thread_rng()))
    }

    fn negotiation_failure(&self, reason: &str) -> MessagingError {
        MessagingError::Negotiation {
            evaluation_id: self.evaluation_id.clone(),
            reason: reason.to_string(),
        }
    }

    async fn publish_status(&self, status: EvaluationStatus) -> MessagingResult<()> {
        let envelope =
            Envelope::new(&self.evaluation_id, Payload::Status(status)).with_recipients(&self.recipients.read());
        self.publishers.status.publish(&self.evaluation_id, &envelope).await
    }

    fn expect_state(&self, allowed: &[MessagerState], operation: &str) -> MessagingResult<()> {
        let state = self.state();
        if allowed.contains(&state) {
            Ok(())
        } else {
            Err(MessagingError::InvalidState(format!(
                "cannot {} evaluation {} in state {:?}",
                operation, self.evaluation_id, state
            )))
        }
    }

    fn failure(&self, report: FailureReport) -> MessagingError {
        match report.consumer_id {
            Some(consumer_id) => MessagingError::Consumption {
                evaluation_id: self.evaluation_id.clone(),
                consumer_id,
                group_id: report.group_id,
                cause: report.cause,
            },
            None => MessagingError::EvaluationFailed {
                evaluation_id: self.evaluation_id.clone(),
                cause: report.cause,
            },
        }
    }

    async fn report(&self) -> CompletionReport {
        let ledger = self.ledger.lock().await;
        CompletionReport {
            evaluation_id: self.evaluation_id.clone(),
            consumers: self.consumers(),
            resources: self.tracker.resources(),
            messages_published: ledger.message_count(),
            groups: ledger.group_counts().clone(),
        }
    }
}

impl Drop for EvaluationMessager {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn listen_for_status(
    evaluation_id: String,
    mut inbound: Inbound,
    tracker: Arc<ConsumptionTracker>,
    offers: Arc<Offers>,
    cancel: CancellationToken,
) {
    loop {
        let envelope = select! {
            _ = cancel.cancelled() => break,
            envelope = inbound.recv() => envelope,
        };

        let Some(envelope) = envelope else {
            warn!("status subscription of evaluation {} ended", evaluation_id);
            tracker.fail(FailureReport {
                consumer_id: None,
                group_id: None,
                cause: "the status subscription ended before completion".to_string(),
            });
            break;
        };

        let Payload::Status(status) = envelope.payload else {
            continue;
        };
        // statuses without a consumer are this producer's own
        let Some(consumer) = status.consumer.clone() else {
            continue;
        };

        if status.completion_status == CompletionStatus::ReadyToConsume {
            offers.send_if_modified(|offers| {
                let known = offers.get(&consumer.consumer_id) == Some(&consumer.formats);
                if !known {
                    debug!("consumer {} offers {:?}", consumer.consumer_id, consumer.formats);
                    offers.insert(consumer.consumer_id.clone(), consumer.formats.clone());
                }
                !known
            });
        } else {
            tracker.record(&status);
        }
    }

    inbound.close().await;
}

/// Publishes `EvaluationOngoing` until the evaluation resolves or closes.
async fn keep_alive(
    evaluation_id: String,
    client_id: String,
    recipients: BTreeSet<String>,
    publisher: Arc<dyn ExchangePublisher>,
    tracker: Arc<ConsumptionTracker>,
    every: Duration,
    cancel: CancellationToken,
) {
    let mut ticks = tokio::time::interval_at(Instant::now() + every, every);
    loop {
        select! {
            _ = cancel.cancelled() => break,
            _ = ticks.tick() => {}
        }
        if !matches!(tracker.outcome(), Outcome::Pending) {
            break;
        }

        let alive = EvaluationStatus::new(CompletionStatus::EvaluationOngoing, &client_id);
        let envelope = Envelope::new(&evaluation_id, Payload::Status(alive)).with_recipients(&recipients);
        if let Err(err) = publisher.publish(&evaluation_id, &envelope).await {
            warn!("evaluation {} heartbeat failed: {}", evaluation_id, err);
            break;
        }
        debug!("evaluation {} is alive", evaluation_id);
    }
}

fn covers(offers: &BTreeMap<String, BTreeSet<Format>>, required: &BTreeSet<Format>) -> bool {
    required
        .iter()
        .all(|format| offers.values().any(|formats| formats.contains(format)))
}

/// Picks one consumer per required format, preferring consumers already chosen
/// for an earlier format.
fn choose_consumers<R: Rng + ?Sized>(
    offers: &BTreeMap<String, BTreeSet<Format>>,
    required: &BTreeSet<Format>,
    rng: &mut R,
) -> BTreeSet<String> {
    let mut chosen = BTreeSet::new();

    for format in required {
        let candidates: Vec<&String> = offers
            .iter()
            .filter(|(_, formats)| formats.contains(format))
            .map(|(consumer, _)| consumer)
            .collect();

        if candidates.iter().any(|candidate| chosen.contains(*candidate)) {
            continue;
        }
        if let Some(consumer) = candidates.choose(rng) {
            chosen.insert((*consumer).clone());
        }
    }

    chosen
}
