//--------------------------------------------------------------------------------------------------
// Round trips between an EvaluationMessager and MessagingClients through an embedded broker
// started on an ephemeral loopback port for each test.
//--------------------------------------------------------------------------------------------------

use std::{
    collections::{BTreeSet, HashMap},
    path::PathBuf,
    sync::Arc,
    time::Duration,
};

use evaluation_messaging::{
    BrokerConnectionFactory, ClientOptions, CompletionStatus, ConnectionProperties, Consumer, ConsumerDescription,
    ConsumerError, ConsumerFactory, ConsumerResult, EvaluationDescription, EvaluationMessager, EvaluationStatus,
    Format, MessagerOptions, MessagerState, MessagingClient, MessagingError, StatisticsMessage,
    broker::{Exchange, Inbound},
    messages::{Envelope, Payload},
};
use parking_lot::Mutex;
use tokio::time::{self, Instant};
use url::Url;

const WAIT: Option<Duration> = Some(Duration::from_secs(30));

type ScopeKey = (String, Option<String>);

#[derive(Default)]
struct Recorder {
    accepted: Mutex<HashMap<ScopeKey, usize>>,
    finalized: Mutex<HashMap<ScopeKey, usize>>,
}

impl Recorder {
    fn accepted(&self, variable: &str, group: Option<&str>) -> usize {
        let key = (variable.to_string(), group.map(str::to_string));
        self.accepted.lock().get(&key).copied().unwrap_or(0)
    }

    fn finalized(&self, variable: &str, group: Option<&str>) -> usize {
        let key = (variable.to_string(), group.map(str::to_string));
        self.finalized.lock().get(&key).copied().unwrap_or(0)
    }
}

/// Consumers keyed by the variable name of the description, so that tests can
/// tell concurrent evaluations apart.
struct RecordingFactory {
    description: ConsumerDescription,
    recorder: Arc<Recorder>,
    failing_group: Option<String>,
}

impl RecordingFactory {
    fn new(consumer_id: &str, recorder: Arc<Recorder>) -> Self {
        Self {
            description: ConsumerDescription::new(consumer_id, [Format::Csv, Format::Png]),
            recorder,
            failing_group: None,
        }
    }

    fn failing_in(mut self, group: &str) -> Self {
        self.failing_group = Some(group.to_string());
        self
    }

    fn consumer(&self, description: &EvaluationDescription, group: Option<&str>) -> Box<dyn Consumer> {
        Box::new(RecordingConsumer {
            key: (description.variable_name().to_string(), group.map(str::to_string)),
            recorder: self.recorder.clone(),
            fails: group.is_some() && group == self.failing_group.as_deref(),
        })
    }
}

impl ConsumerFactory for RecordingFactory {
    fn get_consumer(&self, description: &EvaluationDescription) -> ConsumerResult<Box<dyn Consumer>> {
        Ok(self.consumer(description, None))
    }

    fn get_grouped_consumer(
        &self,
        description: &EvaluationDescription,
        group_id: &str,
    ) -> ConsumerResult<Box<dyn Consumer>> {
        Ok(self.consumer(description, Some(group_id)))
    }

    fn consumer_description(&self) -> ConsumerDescription {
        self.description.clone()
    }
}

struct RecordingConsumer {
    key: ScopeKey,
    recorder: Arc<Recorder>,
    fails: bool,
}

impl Consumer for RecordingConsumer {
    fn accept(&mut self, _statistics: &StatisticsMessage) -> ConsumerResult<()> {
        if self.fails {
            return Err(ConsumerError::failed("boom"));
        }
        *self.recorder.accepted.lock().entry(self.key.clone()).or_default() += 1;
        Ok(())
    }

    fn finalize(&mut self) -> ConsumerResult<BTreeSet<PathBuf>> {
        *self.recorder.finalized.lock().entry(self.key.clone()).or_default() += 1;
        let scope = self.key.1.clone().unwrap_or_else(|| "ungrouped".to_string());
        Ok(BTreeSet::from([PathBuf::from(format!("/virtual/{}/{}", self.key.0, scope))]))
    }
}

async fn embedded_factory() -> BrokerConnectionFactory {
    let properties = ConnectionProperties::new(Url::parse("amqp://localhost:0").unwrap())
        .with_start_broker(true)
        .with_connection_count(2)
        .with_connection_retries(1);

    BrokerConnectionFactory::from_properties(properties, true).await.unwrap()
}

async fn start_client(connections: &BrokerConnectionFactory, factory: RecordingFactory) -> MessagingClient {
    start_client_with(connections, factory, ClientOptions::default()).await
}

async fn start_client_with(
    connections: &BrokerConnectionFactory,
    factory: RecordingFactory,
    options: ClientOptions,
) -> MessagingClient {
    MessagingClient::start(Arc::new(factory), connections, options).await.unwrap()
}

fn description(variable: &str) -> EvaluationDescription {
    EvaluationDescription::new("CMS", variable)
        .with_sources(["observed.csv", "forecast.xml"])
        .with_formats([Format::Csv])
}

fn statistics(n: u8) -> StatisticsMessage {
    StatisticsMessage::new("wres.Statistics", vec![n; 16])
}

fn options() -> MessagerOptions {
    MessagerOptions {
        consumer_required_interval: Duration::from_millis(200),
        negotiation_timeout: Duration::from_secs(10),
        ..MessagerOptions::default()
    }
}

async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(10);
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        time::sleep(Duration::from_millis(50)).await;
    }
    check()
}

#[test_log::test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn delivers_ungrouped_and_grouped_statistics_end_to_end() {
    let connections = embedded_factory().await;
    let recorder = Arc::new(Recorder::default());
    let client = start_client(&connections, RecordingFactory::new("writer-1", recorder.clone())).await;

    let messager = EvaluationMessager::open(description("flow"), &connections, options())
        .await
        .unwrap();
    messager.start().await.unwrap();
    assert_eq!(messager.state(), MessagerState::Started);
    assert_eq!(messager.consumers(), BTreeSet::from(["writer-1".to_string()]));

    for n in 0..5 {
        messager.publish(statistics(n)).await.unwrap();
    }
    for (group, count) in [("a", 3), ("b", 2), ("c", 4)] {
        for n in 0..count {
            messager.publish_grouped(statistics(n), group).await.unwrap();
        }
    }
    messager.mark_group_publication_complete("b").await.unwrap();
    messager.mark_publication_complete_reported_success().await.unwrap();
    assert_eq!(messager.state(), MessagerState::PublicationComplete);

    let report = messager.await_completion(WAIT).await.unwrap();

    assert_eq!(messager.state(), MessagerState::AwaitSucceeded);
    assert_eq!(report.messages_published, 14);
    assert_eq!(report.groups.len(), 3);
    assert!(report.resources.contains(&PathBuf::from("/virtual/flow/ungrouped")));
    assert!(report.resources.contains(&PathBuf::from("/virtual/flow/b")));
    assert_eq!(messager.resources_written(), report.resources);

    assert_eq!(recorder.accepted("flow", None), 5);
    assert_eq!(recorder.finalized("flow", None), 1);
    for (group, count) in [("a", 3), ("b", 2), ("c", 4)] {
        assert_eq!(recorder.accepted("flow", Some(group)), count);
        assert_eq!(recorder.finalized("flow", Some(group)), 1);
    }

    messager.close().await.unwrap();
    client.stop().await;
    connections.close().await;
}

#[test_log::test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn consumer_failure_surfaces_from_await_without_affecting_other_groups() {
    let connections = embedded_factory().await;
    let recorder = Arc::new(Recorder::default());
    let client = start_client(
        &connections,
        RecordingFactory::new("writer-1", recorder.clone()).failing_in("bad"),
    )
    .await;

    let messager = EvaluationMessager::open(description("stage"), &connections, options())
        .await
        .unwrap();
    messager.start().await.unwrap();
    for n in 0..3 {
        messager.publish_grouped(statistics(n), "good").await.unwrap();
    }
    for n in 0..2 {
        messager.publish_grouped(statistics(n), "bad").await.unwrap();
    }
    messager.mark_publication_complete_reported_success().await.unwrap();

    match messager.await_completion(WAIT).await {
        Err(MessagingError::Consumption {
            consumer_id,
            group_id,
            cause,
            ..
        }) => {
            assert_eq!(consumer_id, "writer-1");
            assert_eq!(group_id.as_deref(), Some("bad"));
            assert!(cause.contains("boom"), "unexpected cause {}", cause);
        }
        other => panic!("unexpected outcome {:?}", other),
    }
    assert_eq!(messager.state(), MessagerState::AwaitFailed);

    assert!(eventually(|| recorder.finalized("stage", Some("good")) == 1).await);
    assert_eq!(recorder.accepted("stage", Some("good")), 3);
    assert_eq!(recorder.finalized("stage", Some("bad")), 0);

    messager.close().await.unwrap();
    client.stop().await;
    connections.close().await;
}

#[test_log::test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn concurrent_evaluations_are_isolated() {
    let connections = embedded_factory().await;
    let recorder = Arc::new(Recorder::default());
    let client = start_client(&connections, RecordingFactory::new("writer-1", recorder.clone())).await;

    let first = EvaluationMessager::open(description("flow"), &connections, options())
        .await
        .unwrap();
    let second = EvaluationMessager::open(description("stage"), &connections, options())
        .await
        .unwrap();
    let (started_first, started_second) = tokio::join!(first.start(), second.start());
    started_first.unwrap();
    started_second.unwrap();

    for n in 0..6 {
        first.publish_grouped(statistics(n), "shared").await.unwrap();
        if n % 2 == 0 {
            second.publish_grouped(statistics(n), "shared").await.unwrap();
        }
    }
    second.publish(statistics(9)).await.unwrap();
    first.mark_publication_complete_reported_success().await.unwrap();
    second.mark_publication_complete_reported_success().await.unwrap();

    let (first_report, second_report) = tokio::join!(first.await_completion(WAIT), second.await_completion(WAIT));
    assert_eq!(first_report.unwrap().messages_published, 6);
    assert_eq!(second_report.unwrap().messages_published, 4);

    assert_eq!(recorder.accepted("flow", Some("shared")), 6);
    assert_eq!(recorder.accepted("stage", Some("shared")), 3);
    assert_eq!(recorder.accepted("flow", None), 0);
    assert_eq!(recorder.accepted("stage", None), 1);
    assert_eq!(recorder.finalized("flow", Some("shared")), 1);
    assert_eq!(recorder.finalized("stage", Some("shared")), 1);

    first.close().await.unwrap();
    second.close().await.unwrap();
    client.stop().await;
    connections.close().await;
}

async fn next_status(inbound: &mut Inbound, wanted: CompletionStatus) -> EvaluationStatus {
    let deadline = Duration::from_secs(30);
    time::timeout(deadline, async {
        loop {
            let envelope = inbound.recv().await.unwrap();
            if let Payload::Status(status) = envelope.payload {
                if status.completion_status == wanted {
                    return status;
                }
            }
        }
    })
    .await
    .unwrap()
}

#[test_log::test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn statistics_published_before_the_description_are_held_back() {
    let connections = embedded_factory().await;
    let recorder = Arc::new(Recorder::default());
    let client = start_client(&connections, RecordingFactory::new("writer-1", recorder.clone())).await;

    let connection = connections.connection().await.unwrap();
    let evaluation_publisher = connection.open_publisher(Exchange::Evaluation).await.unwrap();
    let statistics_publisher = connection.open_publisher(Exchange::Statistics).await.unwrap();
    let status_publisher = connection.open_publisher(Exchange::Status).await.unwrap();
    let mut statuses = connection.subscribe(Exchange::Status, "early").await.unwrap();
    let recipients = BTreeSet::from(["writer-1".to_string()]);

    for n in 0..4 {
        let envelope = Envelope::new("early", Payload::Statistics(statistics(n))).with_recipients(&recipients);
        statistics_publisher.publish("early", &envelope).await.unwrap();
    }
    time::sleep(Duration::from_millis(200)).await;
    assert_eq!(recorder.accepted("reordered", None), 0);

    let envelope =
        Envelope::new("early", Payload::Evaluation(description("reordered"))).with_recipients(&recipients);
    evaluation_publisher.publish("early", &envelope).await.unwrap();

    let complete = EvaluationStatus::new(CompletionStatus::PublicationCompleteReportedSuccess, "raw-producer")
        .with_message_count(4);
    let envelope = Envelope::new("early", Payload::Status(complete)).with_recipients(&recipients);
    status_publisher.publish("early", &envelope).await.unwrap();

    let done = next_status(&mut statuses, CompletionStatus::ConsumptionCompleteReportedSuccess).await;
    assert_eq!(done.consumer_id(), Some("writer-1"));
    assert_eq!(recorder.accepted("reordered", None), 4);
    assert_eq!(recorder.finalized("reordered", None), 1);

    statuses.close().await;
    client.stop().await;
    connections.close().await;
}

/// Offers to consume every evaluation and never reports back.
async fn silent_consumer(connections: &BrokerConnectionFactory) -> tokio::task::JoinHandle<()> {
    let connection = connections.connection().await.unwrap();
    let publisher = connection.open_publisher(Exchange::Status).await.unwrap();
    let mut statuses = connection.subscribe(Exchange::Status, "#").await.unwrap();
    let offer = ConsumerDescription::new("silent", [Format::Csv]);

    tokio::spawn(async move {
        while let Some(envelope) = statuses.recv().await {
            let Payload::Status(status) = &envelope.payload else { continue };
            if status.completion_status == CompletionStatus::ConsumerRequired {
                let ready =
                    EvaluationStatus::new(CompletionStatus::ReadyToConsume, "silent").with_consumer(offer.clone());
                let reply = Envelope::new(&envelope.evaluation_id, Payload::Status(ready));
                let _ = publisher.publish(&envelope.evaluation_id, &reply).await;
            }
        }
    })
}

#[test_log::test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn await_times_out_when_consumption_never_completes() {
    let connections = embedded_factory().await;
    let silent = silent_consumer(&connections).await;

    let messager = EvaluationMessager::open(description("flow"), &connections, options())
        .await
        .unwrap();
    messager.start().await.unwrap();
    messager.publish_grouped(statistics(1), "never").await.unwrap();
    messager.mark_publication_complete_reported_success().await.unwrap();

    let started = Instant::now();
    let result = messager.await_completion(Some(Duration::from_millis(800))).await;
    let waited = started.elapsed();

    assert!(matches!(result, Err(MessagingError::Timeout { .. })), "{:?}", result);
    assert!(waited >= Duration::from_millis(800), "returned after {:?}", waited);
    assert!(waited < Duration::from_secs(5), "returned after {:?}", waited);
    assert_eq!(messager.state(), MessagerState::PublicationComplete);

    // inconclusive, waiting again is allowed
    let again = messager.await_completion(Some(Duration::from_millis(100))).await;
    assert!(matches!(again, Err(MessagingError::Timeout { .. })));

    silent.abort();
    messager.close().await.unwrap();
    connections.close().await;
}

#[test_log::test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn lifecycle_misuse_is_rejected() {
    let connections = embedded_factory().await;
    let recorder = Arc::new(Recorder::default());
    let client = start_client(&connections, RecordingFactory::new("writer-1", recorder)).await;

    let messager = EvaluationMessager::open(description("flow"), &connections, options())
        .await
        .unwrap();
    assert!(matches!(
        messager.publish(statistics(0)).await,
        Err(MessagingError::InvalidState(_))
    ));
    assert!(matches!(
        messager.await_completion(WAIT).await,
        Err(MessagingError::InvalidState(_))
    ));

    messager.start().await.unwrap();
    assert!(matches!(messager.start().await, Err(MessagingError::InvalidState(_))));

    messager.publish_grouped(statistics(0), "a").await.unwrap();
    messager.mark_group_publication_complete("a").await.unwrap();
    assert!(matches!(
        messager.publish_grouped(statistics(1), "a").await,
        Err(MessagingError::InvalidState(_))
    ));

    messager.mark_publication_complete_reported_success().await.unwrap();
    assert!(matches!(
        messager.publish(statistics(2)).await,
        Err(MessagingError::InvalidState(_))
    ));
    messager.await_completion(WAIT).await.unwrap();

    messager.close().await.unwrap();
    messager.close().await.unwrap();
    assert_eq!(messager.state(), MessagerState::Closed);

    client.stop().await;
    client.stop().await;
    connections.close().await;
    connections.close().await;
}

#[test_log::test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn declared_count_mismatch_fails_the_evaluation() {
    let connections = embedded_factory().await;
    let recorder = Arc::new(Recorder::default());
    let client = start_client(&connections, RecordingFactory::new("writer-1", recorder.clone())).await;

    let messager = EvaluationMessager::open(
        description("flow").with_expected_message_count(3),
        &connections,
        options(),
    )
    .await
    .unwrap();
    messager.start().await.unwrap();
    messager.publish(statistics(0)).await.unwrap();
    messager.publish(statistics(1)).await.unwrap();

    match messager.mark_publication_complete_reported_success().await {
        Err(MessagingError::CompletionMismatch {
            declared, published, ..
        }) => {
            assert_eq!(declared, 3);
            assert_eq!(published, 2);
        }
        other => panic!("unexpected outcome {:?}", other),
    }
    assert!(matches!(
        messager.await_completion(WAIT).await,
        Err(MessagingError::EvaluationFailed { .. })
    ));

    // the writer abandons the evaluation instead of finalizing
    time::sleep(Duration::from_millis(300)).await;
    assert_eq!(recorder.finalized("flow", None), 0);

    messager.close().await.unwrap();
    client.stop().await;
    connections.close().await;
}

#[test_log::test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn stopping_an_evaluation_fails_the_await() {
    let connections = embedded_factory().await;
    let recorder = Arc::new(Recorder::default());
    let client = start_client(&connections, RecordingFactory::new("writer-1", recorder)).await;

    let messager = EvaluationMessager::open(description("flow"), &connections, options())
        .await
        .unwrap();
    messager.start().await.unwrap();
    messager.publish(statistics(0)).await.unwrap();
    messager.stop("statistics computation failed").await.unwrap();

    match messager.await_completion(WAIT).await {
        Err(MessagingError::EvaluationFailed { cause, .. }) => assert_eq!(cause, "statistics computation failed"),
        other => panic!("unexpected outcome {:?}", other),
    }

    messager.close().await.unwrap();
    client.stop().await;
    connections.close().await;
}

#[test_log::test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn evaluation_without_formats_needs_no_consumers() {
    let connections = embedded_factory().await;

    let messager = EvaluationMessager::open(
        EvaluationDescription::new("CMS", "flow"),
        &connections,
        MessagerOptions {
            evaluation_id: Some("no-formats".to_string()),
            ..options()
        },
    )
    .await
    .unwrap();
    assert_eq!(messager.evaluation_id(), "no-formats");

    messager.start().await.unwrap();
    messager.publish(statistics(0)).await.unwrap();
    messager.mark_publication_complete_reported_success().await.unwrap();

    let report = messager.await_completion(WAIT).await.unwrap();
    assert!(report.consumers.is_empty());
    assert_eq!(report.messages_published, 1);

    messager.close().await.unwrap();
    connections.close().await;
}

#[test_log::test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn negotiation_fails_without_a_capable_consumer() {
    let connections = embedded_factory().await;
    let recorder = Arc::new(Recorder::default());
    let client = start_client(&connections, RecordingFactory::new("writer-1", recorder)).await;

    let messager = EvaluationMessager::open(
        EvaluationDescription::new("CMS", "flow").with_formats([Format::NetCdf]),
        &connections,
        MessagerOptions {
            negotiation_timeout: Duration::from_millis(500),
            ..options()
        },
    )
    .await
    .unwrap();

    assert!(matches!(
        messager.start().await,
        Err(MessagingError::Negotiation { .. })
    ));
    assert_eq!(messager.state(), MessagerState::Created);

    messager.close().await.unwrap();
    client.stop().await;
    connections.close().await;
}

#[test_log::test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn overflowing_the_early_statistics_buffer_fails_the_evaluation() {
    let connections = embedded_factory().await;
    let recorder = Arc::new(Recorder::default());
    let options = ClientOptions {
        pending_limit: 2,
        ..ClientOptions::default()
    };
    let client = start_client_with(&connections, RecordingFactory::new("writer-1", recorder.clone()), options).await;

    let connection = connections.connection().await.unwrap();
    let evaluation_publisher = connection.open_publisher(Exchange::Evaluation).await.unwrap();
    let statistics_publisher = connection.open_publisher(Exchange::Statistics).await.unwrap();
    let status_publisher = connection.open_publisher(Exchange::Status).await.unwrap();
    let mut statuses = connection.subscribe(Exchange::Status, "flooded").await.unwrap();
    let recipients = BTreeSet::from(["writer-1".to_string()]);

    for n in 0..3 {
        let envelope = Envelope::new("flooded", Payload::Statistics(statistics(n))).with_recipients(&recipients);
        statistics_publisher.publish("flooded", &envelope).await.unwrap();
    }

    let failed = next_status(&mut statuses, CompletionStatus::ConsumptionCompleteReportedFailure).await;
    assert_eq!(failed.consumer_id(), Some("writer-1"));
    assert!(
        failed
            .cause
            .as_deref()
            .is_some_and(|cause| cause.contains("before the evaluation description"))
    );

    let envelope =
        Envelope::new("flooded", Payload::Evaluation(description("flooded"))).with_recipients(&recipients);
    evaluation_publisher.publish("flooded", &envelope).await.unwrap();
    let complete = EvaluationStatus::new(CompletionStatus::PublicationCompleteReportedSuccess, "raw-producer")
        .with_message_count(3);
    let envelope = Envelope::new("flooded", Payload::Status(complete)).with_recipients(&recipients);
    status_publisher.publish("flooded", &envelope).await.unwrap();

    time::sleep(Duration::from_millis(300)).await;
    assert_eq!(recorder.accepted("flooded", None), 0);
    assert_eq!(recorder.finalized("flooded", None), 0);
    assert!(client.is_running());

    statuses.close().await;
    client.stop().await;
    connections.close().await;
}

#[test_log::test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn evaluation_of_a_vanished_producer_is_failed_and_forgotten() {
    let connections = embedded_factory().await;
    let recorder = Arc::new(Recorder::default());
    let options = ClientOptions {
        session_idle_timeout: Duration::from_millis(300),
        ..ClientOptions::default()
    };
    let client = start_client_with(&connections, RecordingFactory::new("writer-1", recorder.clone()), options).await;

    let connection = connections.connection().await.unwrap();
    let evaluation_publisher = connection.open_publisher(Exchange::Evaluation).await.unwrap();
    let statistics_publisher = connection.open_publisher(Exchange::Statistics).await.unwrap();
    let mut statuses = connection.subscribe(Exchange::Status, "orphan").await.unwrap();
    let recipients = BTreeSet::from(["writer-1".to_string()]);

    let envelope = Envelope::new("orphan", Payload::Statistics(statistics(1))).with_recipients(&recipients);
    statistics_publisher.publish("orphan", &envelope).await.unwrap();

    let started = Instant::now();
    let failed = next_status(&mut statuses, CompletionStatus::ConsumptionCompleteReportedFailure).await;
    assert!(started.elapsed() >= Duration::from_millis(250));
    assert_eq!(failed.consumer_id(), Some("writer-1"));
    assert!(failed.cause.as_deref().is_some_and(|cause| cause.contains("no progress")));

    // a late description no longer revives the evaluation
    let envelope = Envelope::new("orphan", Payload::Evaluation(description("orphan"))).with_recipients(&recipients);
    evaluation_publisher.publish("orphan", &envelope).await.unwrap();
    time::sleep(Duration::from_millis(300)).await;
    assert_eq!(recorder.accepted("orphan", None), 0);
    assert_eq!(recorder.finalized("orphan", None), 0);

    statuses.close().await;
    client.stop().await;
    connections.close().await;
}

#[test_log::test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn heartbeats_keep_a_slow_evaluation_alive() {
    let connections = embedded_factory().await;
    let recorder = Arc::new(Recorder::default());
    let client_options = ClientOptions {
        session_idle_timeout: Duration::from_millis(500),
        ..ClientOptions::default()
    };
    let client = start_client_with(&connections, RecordingFactory::new("writer-1", recorder.clone()), client_options).await;

    let messager = EvaluationMessager::open(
        description("slow"),
        &connections,
        MessagerOptions {
            heartbeat_interval: Duration::from_millis(100),
            ..options()
        },
    )
    .await
    .unwrap();
    let connection = connections.connection().await.unwrap();
    let mut statuses = connection.subscribe(Exchange::Status, messager.evaluation_id()).await.unwrap();
    messager.start().await.unwrap();

    let alive = next_status(&mut statuses, CompletionStatus::EvaluationOngoing).await;
    assert_eq!(alive.consumer_id(), None);
    time::sleep(Duration::from_millis(1500)).await;

    for n in 0..2 {
        messager.publish(statistics(n)).await.unwrap();
    }
    messager.mark_publication_complete_reported_success().await.unwrap();
    let report = messager.await_completion(WAIT).await.unwrap();

    assert_eq!(report.messages_published, 2);
    assert_eq!(recorder.accepted("slow", None), 2);
    assert_eq!(recorder.finalized("slow", None), 1);

    statuses.close().await;
    messager.close().await.unwrap();
    client.stop().await;
    connections.close().await;
}

#[test_log::test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn zero_liveness_intervals_are_rejected() {
    let connections = embedded_factory().await;
    let recorder = Arc::new(Recorder::default());

    let client = MessagingClient::start(
        Arc::new(RecordingFactory::new("writer-1", recorder)),
        &connections,
        ClientOptions {
            session_idle_timeout: Duration::ZERO,
            ..ClientOptions::default()
        },
    )
    .await;
    assert!(matches!(client, Err(MessagingError::Configuration(_))));

    let messager = EvaluationMessager::open(
        description("eager"),
        &connections,
        MessagerOptions {
            heartbeat_interval: Duration::ZERO,
            ..options()
        },
    )
    .await;
    assert!(matches!(messager, Err(MessagingError::Configuration(_))));

    connections.close().await;
}
