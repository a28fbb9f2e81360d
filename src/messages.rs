use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
    path::PathBuf,
    str::FromStr,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{MessagingError, MessagingResult};

/// Output formats a consumer can write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Format {
    Csv,
    Csv2,
    Png,
    Svg,
    NetCdf,
    Protobuf,
    Pairs,
}

impl Format {
    pub fn as_str(&self) -> &'static str {
        match self {
            Format::Csv => "csv",
            Format::Csv2 => "csv2",
            Format::Png => "png",
            Format::Svg => "svg",
            Format::NetCdf => "net_cdf",
            Format::Protobuf => "protobuf",
            Format::Pairs => "pairs",
        }
    }
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Format {
    type Err = MessagingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "csv" => Ok(Format::Csv),
            "csv2" => Ok(Format::Csv2),
            "png" => Ok(Format::Png),
            "svg" => Ok(Format::Svg),
            "netcdf" | "net_cdf" => Ok(Format::NetCdf),
            "protobuf" => Ok(Format::Protobuf),
            "pairs" => Ok(Format::Pairs),
            other => Err(MessagingError::Configuration(format!("unknown output format '{}'", other))),
        }
    }
}

/// Immutable description of one evaluation, published once before any statistics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationDescription {
    measurement_unit: String,
    variable_name: String,
    sources: Vec<String>,
    formats: BTreeSet<Format>,
    expected_message_count: Option<u64>,
    schema: Option<String>,
    #[serde(with = "base64_bytes")]
    payload: Vec<u8>,
}

impl EvaluationDescription {
    pub fn new(measurement_unit: &str, variable_name: &str) -> Self {
        Self {
            measurement_unit: measurement_unit.to_string(),
            variable_name: variable_name.to_string(),
            sources: Vec::new(),
            formats: BTreeSet::new(),
            expected_message_count: None,
            schema: None,
            payload: Vec::new(),
        }
    }

    pub fn with_sources<I, S>(mut self, sources: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.sources = sources.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_formats<I>(mut self, formats: I) -> Self
    where
        I: IntoIterator<Item = Format>,
    {
        self.formats = formats.into_iter().collect();
        self
    }

    /// Declares how many statistics messages the producer will publish.
    pub fn with_expected_message_count(mut self, count: u64) -> Self {
        self.expected_message_count = Some(count);
        self
    }

    /// Attaches the caller's serialized description with its schema name.
    pub fn with_payload(mut self, schema: &str, payload: Vec<u8>) -> Self {
        self.schema = Some(schema.to_string());
        self.payload = payload;
        self
    }

    pub fn measurement_unit(&self) -> &str {
        &self.measurement_unit
    }

    pub fn variable_name(&self) -> &str {
        &self.variable_name
    }

    pub fn sources(&self) -> &[String] {
        &self.sources
    }

    pub fn formats(&self) -> &BTreeSet<Format> {
        &self.formats
    }

    pub fn expected_message_count(&self) -> Option<u64> {
        self.expected_message_count
    }

    pub fn schema(&self) -> Option<&str> {
        self.schema.as_deref()
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }
}

/// One pool's worth of statistics. The payload is opaque to the messaging layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatisticsMessage {
    evaluation_id: Option<String>,
    group_id: Option<String>,
    schema: String,
    #[serde(with = "base64_bytes")]
    payload: Vec<u8>,
}

impl StatisticsMessage {
    pub fn new(schema: &str, payload: Vec<u8>) -> Self {
        Self {
            evaluation_id: None,
            group_id: None,
            schema: schema.to_string(),
            payload,
        }
    }

    /// Evaluation this message belongs to; assigned when it is published.
    pub fn evaluation_id(&self) -> Option<&str> {
        self.evaluation_id.as_deref()
    }

    pub fn group_id(&self) -> Option<&str> {
        self.group_id.as_deref()
    }

    pub fn schema(&self) -> &str {
        &self.schema
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub(crate) fn stamped(self, evaluation_id: &str, group_id: Option<&str>) -> Self {
        Self {
            evaluation_id: Some(evaluation_id.to_string()),
            group_id: group_id.map(str::to_string),
            ..self
        }
    }
}

/// Lifecycle transitions exchanged on the status channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CompletionStatus {
    EvaluationStarted,
    /// Heartbeat of a producer that is still working on the evaluation.
    EvaluationOngoing,
    ConsumerRequired,
    ReadyToConsume,
    GroupPublicationComplete,
    PublicationCompleteReportedSuccess,
    PublicationCompleteReportedFailure,
    GroupConsumptionComplete,
    ConsumptionCompleteReportedSuccess,
    ConsumptionCompleteReportedFailure,
    EvaluationCompleteReportedSuccess,
    EvaluationCompleteReportedFailure,
}

impl CompletionStatus {
    /// Statuses with which the producer abandons an evaluation.
    pub fn is_producer_failure(&self) -> bool {
        matches!(
            self,
            CompletionStatus::PublicationCompleteReportedFailure
                | CompletionStatus::EvaluationCompleteReportedFailure
        )
    }
}

/// Identity and capabilities of a consumer process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsumerDescription {
    pub consumer_id: String,
    pub formats: BTreeSet<Format>,
}

impl ConsumerDescription {
    pub fn new<I>(consumer_id: &str, formats: I) -> Self
    where
        I: IntoIterator<Item = Format>,
    {
        Self {
            consumer_id: consumer_id.to_string(),
            formats: formats.into_iter().collect(),
        }
    }

    pub fn supports_any(&self, formats: &BTreeSet<Format>) -> bool {
        !self.formats.is_disjoint(formats)
    }
}

/// Coordination event, never delivered to a statistics consumer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationStatus {
    pub completion_status: CompletionStatus,
    pub client_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub consumer: Option<ConsumerDescription>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_count: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_count: Option<u64>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub group_message_counts: BTreeMap<String, u64>,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub formats_required: BTreeSet<Format>,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub resources_created: BTreeSet<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<String>,
    pub time: DateTime<Utc>,
}

impl EvaluationStatus {
    pub fn new(completion_status: CompletionStatus, client_id: &str) -> Self {
        Self {
            completion_status,
            client_id: client_id.to_string(),
            consumer: None,
            group_id: None,
            message_count: None,
            group_count: None,
            group_message_counts: BTreeMap::new(),
            formats_required: BTreeSet::new(),
            resources_created: BTreeSet::new(),
            cause: None,
            time: Utc::now(),
        }
    }

    pub fn with_consumer(mut self, consumer: ConsumerDescription) -> Self {
        self.consumer = Some(consumer);
        self
    }

    pub fn with_group(mut self, group_id: &str) -> Self {
        self.group_id = Some(group_id.to_string());
        self
    }

    pub fn with_message_count(mut self, count: u64) -> Self {
        self.message_count = Some(count);
        self
    }

    /// Sets the per-group message counts and the group count they imply.
    pub fn with_group_counts(mut self, counts: BTreeMap<String, u64>) -> Self {
        self.group_count = Some(counts.len() as u64);
        self.group_message_counts = counts;
        self
    }

    pub fn with_formats_required(mut self, formats: BTreeSet<Format>) -> Self {
        self.formats_required = formats;
        self
    }

    pub fn with_cause(mut self, cause: &str) -> Self {
        self.cause = Some(cause.to_string());
        self
    }

    pub fn with_resources(mut self, resources: BTreeSet<PathBuf>) -> Self {
        self.resources_created = resources;
        self
    }

    pub fn consumer_id(&self) -> Option<&str> {
        self.consumer.as_ref().map(|consumer| consumer.consumer_id.as_str())
    }
}

/// Body of an [`Envelope`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "body", rename_all = "snake_case")]
pub enum Payload {
    Evaluation(EvaluationDescription),
    Statistics(StatisticsMessage),
    Status(EvaluationStatus),
}

/// Unit of transfer on every exchange.
///
/// `recipients` holds the negotiated consumer ids; a client ignores envelopes
/// not addressed to it. `consumer_id` is set only on envelopes a consumer sent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub message_id: String,
    pub evaluation_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub consumer_id: Option<String>,
    #[serde(default)]
    pub recipients: BTreeSet<String>,
    pub payload: Payload,
}

impl Envelope {
    pub fn new(evaluation_id: &str, payload: Payload) -> Self {
        let group_id = match &payload {
            Payload::Statistics(statistics) => statistics.group_id.clone(),
            Payload::Status(status) => status.group_id.clone(),
            Payload::Evaluation(_) => None,
        };
        let consumer_id = match &payload {
            Payload::Status(status) => status.consumer_id().map(str::to_string),
            _ => None,
        };

        Self {
            message_id: Uuid::new_v4().to_string(),
            evaluation_id: evaluation_id.to_string(),
            group_id,
            consumer_id,
            recipients: BTreeSet::new(),
            payload,
        }
    }

    pub fn with_recipients(mut self, recipients: &BTreeSet<String>) -> Self {
        self.recipients = recipients.clone();
        self
    }

    pub fn is_for(&self, consumer_id: &str) -> bool {
        self.recipients.contains(consumer_id)
    }

    pub fn encode(&self) -> MessagingResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> MessagingResult<Self> {
        serde_json::from_slice(bytes)
            .map_err(|err| MessagingError::Protocol(format!("undecodable envelope: {}", err)))
    }
}

/// Serde adapter carrying opaque bytes as base64 text.
pub(crate) mod base64_bytes {
    use base64::{Engine, engine::general_purpose::STANDARD};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}
