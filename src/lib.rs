// Messaging between an evaluation (the producer) and the writers consuming its statistics
pub mod broker;
pub mod client;
pub mod config;
pub mod consumer;
pub mod error;
pub mod logging;
pub mod messages;
pub mod publisher;
pub mod tracker;

// Re-export key types for easier usage
pub use broker::connections::{BrokerConnectionFactory, BrokerDetection, detect_broker, is_embedded_broker_required};
pub use broker::embedded::EmbeddedBroker;
pub use client::{ClientOptions, MessagingClient};
pub use config::{BrokerProperties, ConnectionProperties, load_properties, resolve_properties};
pub use consumer::{Consumer, ConsumerError, ConsumerFactory, ConsumerResult};
pub use error::{MessagingError, MessagingResult};
pub use messages::{
    CompletionStatus, ConsumerDescription, EvaluationDescription, EvaluationStatus, Format, StatisticsMessage,
};
pub use publisher::{CompletionReport, EvaluationMessager, MessagerOptions, MessagerState};
pub use tracker::{FailureReport, Outcome};
