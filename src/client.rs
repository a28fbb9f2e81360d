//! Subscriber side: receives evaluations and dispatches their statistics to
//! consumers obtained from a [`ConsumerFactory`].
//!
//! A single coordinator task reads the three exchanges and owns all session
//! state. Every scope (the ungrouped statistics of an evaluation, or one group)
//! gets a worker task with its own ordered queue; consumer callbacks run on the
//! blocking pool, bounded by a semaphore shared by all workers.

use std::{
    collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque, hash_map::Entry},
    num::NonZeroUsize,
    path::PathBuf,
    sync::Arc,
    time::Duration,
};

use parking_lot::Mutex;
use tokio::{
    select,
    sync::{Semaphore, mpsc},
    task::JoinHandle,
    time::{Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{
    broker::{Exchange, ExchangePublisher, Inbound, connections::BrokerConnectionFactory},
    consumer::{Consumer, ConsumerFactory},
    error::{MessagingError, MessagingResult},
    messages::{
        CompletionStatus, ConsumerDescription, Envelope, EvaluationDescription, EvaluationStatus, Payload,
        StatisticsMessage,
    },
    tracker::{ScopeLedger, ScopeOutcome},
};

/// Tunables of a [`MessagingClient`].
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Client id stamped on status events instead of a fresh UUID.
    pub client_id: Option<String>,
    /// Consumer callbacks running at the same time.
    pub worker_limit: usize,
    /// Statistics held per evaluation while its description has not arrived.
    pub pending_limit: usize,
    /// Finished evaluation ids remembered to discard late messages.
    pub closed_evaluation_memory: usize,
    /// An evaluation without any message (heartbeats included) for this long is
    /// failed and dropped.
    pub session_idle_timeout: Duration,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            client_id: None,
            worker_limit: std::thread::available_parallelism()
                .map(NonZeroUsize::get)
                .unwrap_or(4),
            pending_limit: 10_000,
            closed_evaluation_memory: 1024,
            session_idle_timeout: Duration::from_secs(600),
        }
    }
}

/// A running subscriber.
pub struct MessagingClient {
    consumer: ConsumerDescription,
    client_id: String,
    cancel: CancellationToken,
    coordinator: Mutex<Option<JoinHandle<()>>>,
}

impl MessagingClient {
    /// Subscribes to the evaluation, statistics and status exchanges and starts
    /// dispatching. The subscriptions are in place when this returns.
    ///
    /// # Errors
    /// `Configuration` for a zero worker limit; transport errors while subscribing.
    pub async fn start(
        factory: Arc<dyn ConsumerFactory>,
        connections: &BrokerConnectionFactory,
        options: ClientOptions,
    ) -> MessagingResult<Self> {
        if options.worker_limit == 0 {
            return Err(MessagingError::Configuration(
                "a messaging client needs at least one worker".to_string(),
            ));
        }
        if options.session_idle_timeout.is_zero() {
            return Err(MessagingError::Configuration(
                "the session idle timeout must be positive".to_string(),
            ));
        }

        let consumer = factory.consumer_description();
        let client_id = options
            .client_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let connection = connections.connection().await?;
        let status: Arc<dyn ExchangePublisher> = Arc::from(connection.open_publisher(Exchange::Status).await?);
        let inbounds = Inbounds {
            status: connection.subscribe(Exchange::Status, "#").await?,
            evaluation: connection.subscribe(Exchange::Evaluation, "#").await?,
            statistics: connection.subscribe(Exchange::Statistics, "#").await?,
        };

        let cancel = CancellationToken::new();
        let (events, worker_events) = mpsc::unbounded_channel();
        let coordinator = Coordinator {
            dispatch: Dispatch {
                consumer: consumer.clone(),
                client_id: client_id.clone(),
                factory,
                status,
                events,
                permits: Arc::new(Semaphore::new(options.worker_limit)),
            },
            sessions: HashMap::new(),
            closed: ClosedEvaluations::new(options.closed_evaluation_memory),
            pending_limit: options.pending_limit,
            idle_timeout: options.session_idle_timeout,
            cancel: cancel.clone(),
        };
        let coordinator = tokio::spawn(coordinator.run(inbounds, worker_events));

        info!(
            "consumer {} listening for evaluations in {:?}",
            consumer.consumer_id, consumer.formats
        );

        Ok(Self {
            consumer,
            client_id,
            cancel,
            coordinator: Mutex::new(Some(coordinator)),
        })
    }

    pub fn consumer_id(&self) -> &str {
        &self.consumer.consumer_id
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn is_running(&self) -> bool {
        !self.cancel.is_cancelled()
            && self
                .coordinator
                .lock()
                .as_ref()
                .is_some_and(|coordinator| !coordinator.is_finished())
    }

    /// Unsubscribes and releases the channels. Callbacks already running finish
    /// first; queued statistics are dropped. Idempotent.
    pub async fn stop(&self) {
        self.cancel.cancel();
        let coordinator = self.coordinator.lock().take();
        if let Some(coordinator) = coordinator {
            if let Err(err) = coordinator.await {
                error!("consumer {} coordinator failed: {}", self.consumer.consumer_id, err);
            }
            info!("consumer {} stopped", self.consumer.consumer_id);
        }
    }
}

impl Drop for MessagingClient {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

struct Inbounds {
    status: Inbound,
    evaluation: Inbound,
    statistics: Inbound,
}

impl Inbounds {
    async fn close(self) {
        self.status.close().await;
        self.evaluation.close().await;
        self.statistics.close().await;
    }
}

/// `None` is the ungrouped scope.
type ScopeKey = Option<String>;

enum Work {
    Accept(StatisticsMessage),
    Finalize,
}

enum WorkerEvent {
    Accepted {
        evaluation_id: String,
        group_id: ScopeKey,
    },
    Finalized {
        evaluation_id: String,
        group_id: ScopeKey,
        resources: BTreeSet<PathBuf>,
    },
    Failed {
        evaluation_id: String,
        group_id: ScopeKey,
        cause: String,
    },
}

struct Scope {
    ledger: ScopeLedger,
    queue: mpsc::UnboundedSender<Work>,
    worker: JoinHandle<()>,
}

struct Session {
    description: Option<Arc<EvaluationDescription>>,
    /// Statistics that arrived before the description
    pending: Vec<StatisticsMessage>,
    scopes: HashMap<ScopeKey, Scope>,
    group_expected: BTreeMap<String, u64>,
    ungrouped_expected: Option<u64>,
    publication_complete: bool,
    resources: BTreeSet<PathBuf>,
    failures: Vec<String>,
    cancel: CancellationToken,
    last_progress: Instant,
}

impl Session {
    fn new(cancel: CancellationToken) -> Self {
        Self {
            description: None,
            pending: Vec::new(),
            scopes: HashMap::new(),
            group_expected: BTreeMap::new(),
            ungrouped_expected: None,
            publication_complete: false,
            resources: BTreeSet::new(),
            failures: Vec::new(),
            cancel,
            last_progress: Instant::now(),
        }
    }

    fn expected(&self, key: &ScopeKey) -> Option<u64> {
        match key {
            Some(group) => self.group_expected.get(group).copied(),
            None => self.ungrouped_expected,
        }
    }

    /// Applies the known expected count to a scope and queues its finalization
    /// once every expected message was accepted.
    fn advance(&mut self, key: &ScopeKey) {
        let expected = self.expected(key);
        if let Some(scope) = self.scopes.get_mut(key) {
            if let Some(expected) = expected {
                scope.ledger.expect(expected);
            }
            if scope.ledger.begin_finalize() {
                let _ = scope.queue.send(Work::Finalize);
            }
        }
    }

    fn advance_all(&mut self) {
        let keys: Vec<ScopeKey> = self.scopes.keys().cloned().collect();
        for key in keys {
            self.advance(&key);
        }
    }

    fn is_settled(&self) -> bool {
        self.publication_complete
            && self.description.is_some()
            && self.scopes.values().all(|scope| scope.ledger.is_resolved())
            && self
                .group_expected
                .keys()
                .all(|group| self.scopes.contains_key(&Some(group.clone())))
    }
}

/// Everything a scope worker needs from its client.
struct Dispatch {
    consumer: ConsumerDescription,
    client_id: String,
    factory: Arc<dyn ConsumerFactory>,
    status: Arc<dyn ExchangePublisher>,
    events: mpsc::UnboundedSender<WorkerEvent>,
    permits: Arc<Semaphore>,
}

impl Dispatch {
    fn open_scope(
        &self,
        evaluation_id: &str,
        group_id: ScopeKey,
        description: Arc<EvaluationDescription>,
        cancel: CancellationToken,
    ) -> Scope {
        debug!(
            "consumer {} opens scope {:?} of evaluation {}",
            self.consumer.consumer_id, group_id, evaluation_id
        );
        let (queue, work) = mpsc::unbounded_channel();
        let worker = tokio::spawn(serve_scope(
            ScopeContext {
                evaluation_id: evaluation_id.to_string(),
                group_id,
                description,
                factory: self.factory.clone(),
                events: self.events.clone(),
                permits: self.permits.clone(),
                cancel,
            },
            work,
        ));

        Scope {
            ledger: ScopeLedger::default(),
            queue,
            worker,
        }
    }

    fn status_event(&self, status: CompletionStatus) -> EvaluationStatus {
        EvaluationStatus::new(status, &self.client_id).with_consumer(self.consumer.clone())
    }

    async fn report(&self, evaluation_id: &str, status: EvaluationStatus) {
        let completion_status = status.completion_status;
        let envelope = Envelope::new(evaluation_id, Payload::Status(status));
        if let Err(err) = self.status.publish(evaluation_id, &envelope).await {
            error!(
                "consumer {} could not report {:?} for evaluation {}: {}",
                self.consumer.consumer_id, completion_status, evaluation_id, err
            );
        }
    }
}

struct Coordinator {
    dispatch: Dispatch,
    sessions: HashMap<String, Session>,
    closed: ClosedEvaluations,
    pending_limit: usize,
    idle_timeout: Duration,
    cancel: CancellationToken,
}

impl Coordinator {
    async fn run(mut self, mut inbounds: Inbounds, mut worker_events: mpsc::UnboundedReceiver<WorkerEvent>) {
        let cancel = self.cancel.clone();
        let sweep_period = (self.idle_timeout / 4).max(Duration::from_millis(10));
        let mut sweep = tokio::time::interval_at(Instant::now() + sweep_period, sweep_period);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            select! {
                _ = cancel.cancelled() => break,
                envelope = inbounds.evaluation.recv() => match envelope {
                    Some(envelope) => self.on_description(envelope).await,
                    None => {
                        error!("evaluation subscription of consumer {} ended", self.dispatch.consumer.consumer_id);
                        break;
                    }
                },
                envelope = inbounds.statistics.recv() => match envelope {
                    Some(envelope) => self.on_statistics(envelope).await,
                    None => {
                        error!("statistics subscription of consumer {} ended", self.dispatch.consumer.consumer_id);
                        break;
                    }
                },
                envelope = inbounds.status.recv() => match envelope {
                    Some(envelope) => self.on_status(envelope).await,
                    None => {
                        error!("status subscription of consumer {} ended", self.dispatch.consumer.consumer_id);
                        break;
                    }
                },
                Some(event) = worker_events.recv() => self.on_worker_event(event).await,
                _ = sweep.tick() => self.expire_idle().await,
            }
        }

        self.shutdown().await;
        inbounds.close().await;
    }

    async fn on_description(&mut self, envelope: Envelope) {
        if !envelope.is_for(&self.dispatch.consumer.consumer_id) {
            return;
        }
        let Envelope {
            evaluation_id, payload, ..
        } = envelope;
        let Payload::Evaluation(description) = payload else {
            warn!("ignoring a non-description message on the evaluation exchange");
            return;
        };

        let consumer_id = self.dispatch.consumer.consumer_id.clone();
        let Some(session) = live_session(&mut self.sessions, &self.closed, &self.cancel, &evaluation_id) else {
            debug!("ignoring the description of finished evaluation {}", evaluation_id);
            return;
        };
        if session.description.is_some() {
            warn!("ignoring a repeated description of evaluation {}", evaluation_id);
            return;
        }

        info!(
            "consumer {} received evaluation {} ({} {})",
            consumer_id,
            evaluation_id,
            description.variable_name(),
            description.measurement_unit()
        );
        session.description = Some(Arc::new(description));

        let pending = std::mem::take(&mut session.pending);
        if !pending.is_empty() {
            debug!("releasing {} early statistics of evaluation {}", pending.len(), evaluation_id);
        }

        let Some(session) = self.sessions.get_mut(&evaluation_id) else {
            return;
        };
        open_scope_once(&self.dispatch, &evaluation_id, session, None);
        for statistics in pending {
            dispatch_statistics(&self.dispatch, &evaluation_id, session, statistics);
        }
        session.advance_all();

        self.settle(&evaluation_id).await;
    }

    async fn on_statistics(&mut self, envelope: Envelope) {
        if !envelope.is_for(&self.dispatch.consumer.consumer_id) {
            return;
        }
        let Envelope {
            evaluation_id, payload, ..
        } = envelope;
        let Payload::Statistics(statistics) = payload else {
            warn!("ignoring a non-statistics message on the statistics exchange");
            return;
        };

        let pending_limit = self.pending_limit;
        let Some(session) = live_session(&mut self.sessions, &self.closed, &self.cancel, &evaluation_id) else {
            debug!("discarding late statistics of finished evaluation {}", evaluation_id);
            return;
        };

        if session.description.is_none() {
            if session.pending.len() >= pending_limit {
                let cause = format!(
                    "more than {} statistics arrived before the evaluation description",
                    pending_limit
                );
                self.fail_session(&evaluation_id, &cause).await;
                return;
            }
            session.pending.push(statistics);
            return;
        }

        dispatch_statistics(&self.dispatch, &evaluation_id, session, statistics);
    }

    async fn on_status(&mut self, envelope: Envelope) {
        let addressed = envelope.is_for(&self.dispatch.consumer.consumer_id);
        let Envelope {
            evaluation_id, payload, ..
        } = envelope;
        let Payload::Status(status) = payload else {
            return;
        };
        // statuses of consumers, this one included
        if status.consumer.is_some() {
            return;
        }

        let completion_status = status.completion_status;
        match completion_status {
            CompletionStatus::ConsumerRequired => {
                if self.closed.contains(&evaluation_id) || !self.dispatch.consumer.supports_any(&status.formats_required) {
                    return;
                }
                debug!(
                    "consumer {} offers to consume evaluation {}",
                    self.dispatch.consumer.consumer_id, evaluation_id
                );
                let offer = self.dispatch.status_event(CompletionStatus::ReadyToConsume);
                self.dispatch.report(&evaluation_id, offer).await;
            }
            _ if !addressed => {}
            CompletionStatus::GroupPublicationComplete => {
                let (Some(group_id), Some(count)) = (status.group_id, status.message_count) else {
                    warn!("ignoring a group marker without group or count for evaluation {}", evaluation_id);
                    return;
                };
                let Some(session) = live_session(&mut self.sessions, &self.closed, &self.cancel, &evaluation_id) else {
                    return;
                };
                debug!("group {} of evaluation {} expects {} messages", group_id, evaluation_id, count);
                session.group_expected.insert(group_id.clone(), count);
                session.advance(&Some(group_id));
            }
            CompletionStatus::PublicationCompleteReportedSuccess => {
                let Some(session) = live_session(&mut self.sessions, &self.closed, &self.cancel, &evaluation_id) else {
                    return;
                };
                let total = status.message_count.unwrap_or(0);
                let grouped: u64 = status.group_message_counts.values().sum();
                session.ungrouped_expected = Some(total.saturating_sub(grouped));
                for (group_id, count) in status.group_message_counts {
                    session.group_expected.entry(group_id).or_insert(count);
                }
                session.publication_complete = true;
                debug!(
                    "publication of evaluation {} complete with {} messages",
                    evaluation_id, total
                );
                session.advance_all();
                self.settle(&evaluation_id).await;
            }
            CompletionStatus::EvaluationOngoing => {
                if let Some(session) = self.sessions.get_mut(&evaluation_id) {
                    session.last_progress = Instant::now();
                }
            }
            _ if completion_status.is_producer_failure() => {
                let cause = status.cause.unwrap_or_else(|| "no cause was reported".to_string());
                self.abandon(&evaluation_id, &cause);
            }
            other => debug!("evaluation {} reports {:?}", evaluation_id, other),
        }
    }

    async fn on_worker_event(&mut self, event: WorkerEvent) {
        match event {
            WorkerEvent::Accepted {
                evaluation_id,
                group_id,
            } => {
                if let Some(session) = self.sessions.get_mut(&evaluation_id) {
                    session.last_progress = Instant::now();
                    if let Some(scope) = session.scopes.get_mut(&group_id) {
                        scope.ledger.accepted();
                    }
                    session.advance(&group_id);
                }
            }
            WorkerEvent::Finalized {
                evaluation_id,
                group_id,
                resources,
            } => {
                let Some(session) = self.sessions.get_mut(&evaluation_id) else {
                    return;
                };
                let mut accepted = 0;
                if let Some(scope) = session.scopes.get_mut(&group_id) {
                    accepted = scope.ledger.counts().1;
                    scope.ledger.resolve(ScopeOutcome::Succeeded(resources.clone()));
                }
                session.resources.extend(resources.iter().cloned());
                debug!(
                    "scope {:?} of evaluation {} finalized after {} messages",
                    group_id, evaluation_id, accepted
                );

                if let Some(group_id) = &group_id {
                    let status = self
                        .dispatch
                        .status_event(CompletionStatus::GroupConsumptionComplete)
                        .with_group(group_id)
                        .with_message_count(accepted)
                        .with_resources(resources);
                    self.dispatch.report(&evaluation_id, status).await;
                }
                self.settle(&evaluation_id).await;
            }
            WorkerEvent::Failed {
                evaluation_id,
                group_id,
                cause,
            } => {
                let Some(session) = self.sessions.get_mut(&evaluation_id) else {
                    return;
                };
                if let Some(scope) = session.scopes.get_mut(&group_id) {
                    scope.ledger.resolve(ScopeOutcome::Failed(cause.clone()));
                }
                session.failures.push(match &group_id {
                    Some(group_id) => format!("group {}: {}", group_id, cause),
                    None => cause.clone(),
                });
                error!(
                    "consumer {} failed scope {:?} of evaluation {}: {}",
                    self.dispatch.consumer.consumer_id, group_id, evaluation_id, cause
                );

                let mut status = self
                    .dispatch
                    .status_event(CompletionStatus::ConsumptionCompleteReportedFailure)
                    .with_cause(&cause);
                if let Some(group_id) = &group_id {
                    status = status.with_group(group_id);
                }
                self.dispatch.report(&evaluation_id, status).await;
                self.settle(&evaluation_id).await;
            }
        }
    }

    /// Reports the overall outcome once every scope of a complete publication resolved.
    async fn settle(&mut self, evaluation_id: &str) {
        let settled = self.sessions.get(evaluation_id).is_some_and(Session::is_settled);
        if !settled {
            return;
        }
        let Some(session) = self.sessions.remove(evaluation_id) else {
            return;
        };
        self.closed.remember(evaluation_id);

        let status = if session.failures.is_empty() {
            info!(
                "consumer {} completed evaluation {} with {} resources",
                self.dispatch.consumer.consumer_id,
                evaluation_id,
                session.resources.len()
            );
            self.dispatch
                .status_event(CompletionStatus::ConsumptionCompleteReportedSuccess)
                .with_resources(session.resources)
        } else {
            let failed: Vec<&ScopeOutcome> = session
                .scopes
                .values()
                .filter_map(|scope| scope.ledger.outcome())
                .filter(|outcome| matches!(outcome, ScopeOutcome::Failed(_)))
                .collect();
            warn!(
                "consumer {} finished evaluation {} with {} failed scopes",
                self.dispatch.consumer.consumer_id,
                evaluation_id,
                failed.len()
            );
            self.dispatch
                .status_event(CompletionStatus::ConsumptionCompleteReportedFailure)
                .with_cause(&session.failures.join("; "))
                .with_resources(session.resources)
        };

        self.dispatch.report(evaluation_id, status).await;
    }

    /// Drops an evaluation the producer gave up on, without finalizing.
    fn abandon(&mut self, evaluation_id: &str, cause: &str) {
        self.closed.remember(evaluation_id);
        if let Some(session) = self.sessions.remove(evaluation_id) {
            session.cancel.cancel();
            warn!(
                "consumer {} abandons evaluation {}: {}",
                self.dispatch.consumer.consumer_id, evaluation_id, cause
            );
        }
    }

    /// Fails evaluations that made no progress within the idle timeout, such as
    /// those of a producer that died without reporting.
    async fn expire_idle(&mut self) {
        let idle: Vec<String> = self
            .sessions
            .iter()
            .filter(|(_, session)| session.last_progress.elapsed() >= self.idle_timeout)
            .map(|(evaluation_id, _)| evaluation_id.clone())
            .collect();

        for evaluation_id in idle {
            let cause = format!("no progress on the evaluation within {:?}", self.idle_timeout);
            self.fail_session(&evaluation_id, &cause).await;
        }
    }

    async fn fail_session(&mut self, evaluation_id: &str, cause: &str) {
        error!("evaluation {}: {}", evaluation_id, cause);
        self.abandon(evaluation_id, cause);
        let status = self
            .dispatch
            .status_event(CompletionStatus::ConsumptionCompleteReportedFailure)
            .with_cause(cause);
        self.dispatch.report(evaluation_id, status).await;
    }

    async fn shutdown(&mut self) {
        let workers: Vec<JoinHandle<()>> = self
            .sessions
            .drain()
            .flat_map(|(_, session)| {
                session.cancel.cancel();
                session.scopes.into_values().map(|scope| scope.worker)
            })
            .collect();

        for worker in workers {
            let _ = worker.await;
        }

        if let Err(err) = self.dispatch.status.close().await {
            debug!("closing the status publisher failed: {}", err);
        }
    }
}

/// Session of a live evaluation, created on first sight; `None` once it finished.
fn live_session<'a>(
    sessions: &'a mut HashMap<String, Session>,
    closed: &ClosedEvaluations,
    cancel: &CancellationToken,
    evaluation_id: &str,
) -> Option<&'a mut Session> {
    if closed.contains(evaluation_id) {
        return None;
    }
    let session = sessions
        .entry(evaluation_id.to_string())
        .or_insert_with(|| Session::new(cancel.child_token()));
    session.last_progress = Instant::now();
    Some(session)
}

fn open_scope_once<'a>(dispatch: &Dispatch, evaluation_id: &str, session: &'a mut Session, key: ScopeKey) -> Option<&'a mut Scope> {
    let description = session.description.clone()?;
    let cancel = session.cancel.child_token();
    Some(match session.scopes.entry(key) {
        Entry::Occupied(scope) => scope.into_mut(),
        Entry::Vacant(vacant) => {
            let key = vacant.key().clone();
            vacant.insert(dispatch.open_scope(evaluation_id, key, description, cancel))
        }
    })
}

fn dispatch_statistics(dispatch: &Dispatch, evaluation_id: &str, session: &mut Session, statistics: StatisticsMessage) {
    let key: ScopeKey = statistics.group_id().map(str::to_string);
    let Some(scope) = open_scope_once(dispatch, evaluation_id, session, key.clone()) else {
        session.pending.push(statistics);
        return;
    };

    if scope.ledger.is_resolved() {
        debug!("discarding statistics for resolved scope {:?} of {}", key, evaluation_id);
        return;
    }
    scope.ledger.dispatched();
    if scope.queue.send(Work::Accept(statistics)).is_err() {
        warn!("worker of scope {:?} of evaluation {} is gone", key, evaluation_id);
    }
    session.advance(&key);
}

struct ScopeContext {
    evaluation_id: String,
    group_id: ScopeKey,
    description: Arc<EvaluationDescription>,
    factory: Arc<dyn ConsumerFactory>,
    events: mpsc::UnboundedSender<WorkerEvent>,
    permits: Arc<Semaphore>,
    cancel: CancellationToken,
}

impl ScopeContext {
    fn send(&self, event: WorkerEvent) {
        let _ = self.events.send(event);
    }

    fn failed(&self, cause: String) {
        self.send(WorkerEvent::Failed {
            evaluation_id: self.evaluation_id.clone(),
            group_id: self.group_id.clone(),
            cause,
        });
    }
}

async fn serve_scope(context: ScopeContext, mut work: mpsc::UnboundedReceiver<Work>) {
    let factory = context.factory.clone();
    let description = context.description.clone();
    let group_id = context.group_id.clone();
    let created = run_blocking(&context.permits, move || match &group_id {
        Some(group_id) => factory.get_grouped_consumer(&description, group_id),
        None => factory.get_consumer(&description),
    })
    .await;

    let mut consumer: Box<dyn Consumer> = match created {
        Ok(Ok(consumer)) => consumer,
        Ok(Err(err)) => return context.failed(format!("could not create a consumer: {}", err)),
        Err(cause) => return context.failed(cause),
    };

    loop {
        let item = select! {
            _ = context.cancel.cancelled() => None,
            item = work.recv() => item,
        };
        let Some(item) = item else {
            debug!(
                "scope {:?} of evaluation {} stopped before finalizing",
                context.group_id, context.evaluation_id
            );
            return;
        };

        match item {
            Work::Accept(statistics) => {
                let outcome = run_blocking(&context.permits, move || {
                    let result = consumer.accept(&statistics);
                    (consumer, result)
                })
                .await;

                match outcome {
                    Ok((returned, Ok(()))) => {
                        consumer = returned;
                        context.send(WorkerEvent::Accepted {
                            evaluation_id: context.evaluation_id.clone(),
                            group_id: context.group_id.clone(),
                        });
                    }
                    Ok((_, Err(err))) => return context.failed(err.to_string()),
                    Err(cause) => return context.failed(cause),
                }
            }
            Work::Finalize => {
                let outcome = run_blocking(&context.permits, move || consumer.finalize()).await;
                match outcome {
                    Ok(Ok(resources)) => context.send(WorkerEvent::Finalized {
                        evaluation_id: context.evaluation_id.clone(),
                        group_id: context.group_id.clone(),
                        resources,
                    }),
                    Ok(Err(err)) => context.failed(format!("finalization failed: {}", err)),
                    Err(cause) => context.failed(cause),
                }
                return;
            }
        }
    }
}

/// Runs a consumer callback on the blocking pool once a permit is free.
async fn run_blocking<T, F>(permits: &Semaphore, task: F) -> Result<T, String>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    let _permit = permits
        .acquire()
        .await
        .map_err(|_| "the dispatch pool is closed".to_string())?;

    tokio::task::spawn_blocking(task).await.map_err(|err| {
        if err.is_panic() {
            "the consumer panicked".to_string()
        } else {
            format!("the consumer callback was cancelled: {}", err)
        }
    })
}

/// Bounded memory of finished evaluation ids.
struct ClosedEvaluations {
    capacity: usize,
    order: VecDeque<String>,
    ids: HashSet<String>,
}

impl ClosedEvaluations {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            order: VecDeque::new(),
            ids: HashSet::new(),
        }
    }

    fn remember(&mut self, evaluation_id: &str) {
        if self.ids.insert(evaluation_id.to_string()) {
            self.order.push_back(evaluation_id.to_string());
        }
        while self.order.len() > self.capacity {
            if let Some(forgotten) = self.order.pop_front() {
                self.ids.remove(&forgotten);
            }
        }
    }

    fn contains(&self, evaluation_id: &str) -> bool {
        self.ids.contains(evaluation_id)
    }
}
