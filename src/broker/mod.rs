//! Broker plumbing: exchanges, the transport seam and its two implementations.
//!
//! | Item                  | Role                                                     |
//! |-----------------------|----------------------------------------------------------|
//! | [`Exchange`]          | the three topic exchanges of the protocol                |
//! | [`BrokerConnection`]  | one pooled connection; opens publishers and inbounds     |
//! | [`ExchangePublisher`] | publishes envelopes to one exchange                      |
//! | [`Inbound`]           | decoded envelopes from one bound subscription            |
//! | `amqp`                | transport over RabbitMQ                                  |
//! | `local`               | transport to the [`embedded::EmbeddedBroker`]            |

pub mod amqp;
pub mod connections;
pub mod embedded;
pub(crate) mod local;
pub(crate) mod wire;

use async_trait::async_trait;
use tokio::{sync::mpsc, task::JoinHandle};
use tokio_util::sync::CancellationToken;

use crate::{error::MessagingResult, messages::Envelope};

/// Envelopes buffered per subscription before its transport stops reading for it.
pub(crate) const INBOUND_CAPACITY: usize = 1024;

/// Topic exchanges used by the protocol. The routing key is always the evaluation id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Exchange {
    Evaluation,
    Status,
    Statistics,
}

impl Exchange {
    pub const ALL: [Exchange; 3] = [Exchange::Evaluation, Exchange::Status, Exchange::Statistics];

    pub fn name(&self) -> &'static str {
        match self {
            Exchange::Evaluation => "evaluation",
            Exchange::Status => "evaluation.status",
            Exchange::Statistics => "evaluation.statistics",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|exchange| exchange.name() == name)
    }
}

/// Matches an AMQP topic routing key against a binding pattern.
///
/// Words are separated by `.`; `*` matches exactly one word and `#` zero or more.
pub fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = routing_key.split('.').collect();
    matches_words(&pattern, &key)
}

fn matches_words(pattern: &[&str], key: &[&str]) -> bool {
    match pattern.split_first() {
        None => key.is_empty(),
        Some((&"#", rest)) => (0..=key.len()).any(|skip| matches_words(rest, &key[skip..])),
        Some((&word, rest)) => match key.split_first() {
            Some((&head, tail)) => (word == "*" || word == head) && matches_words(rest, tail),
            None => false,
        },
    }
}

/// One connection to the broker endpoint.
///
/// Every publisher and inbound opened from it owns its own channel.
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    async fn open_publisher(&self, exchange: Exchange) -> MessagingResult<Box<dyn ExchangePublisher>>;

    /// Subscribes to `exchange` with a topic `binding`. The binding is in place on
    /// the broker when this returns.
    async fn subscribe(&self, exchange: Exchange, binding: &str) -> MessagingResult<Inbound>;

    fn is_open(&self) -> bool;

    async fn close(&self) -> MessagingResult<()>;
}

#[async_trait]
pub trait ExchangePublisher: Send + Sync {
    fn exchange(&self) -> Exchange;

    /// Writes one envelope into the transport's send buffer, suspending while it is full.
    ///
    /// # Errors
    /// `Publish` when the channel or connection is broken. Never retried.
    async fn publish(&self, routing_key: &str, envelope: &Envelope) -> MessagingResult<()>;

    async fn close(&self) -> MessagingResult<()>;
}

/// Stream of decoded envelopes from one subscription.
///
/// A forwarding task owned by the transport feeds a receiver bounded by
/// [`INBOUND_CAPACITY`]; closing (or dropping) the inbound cancels it and
/// removes the binding.
pub struct Inbound {
    exchange: Exchange,
    receiver: mpsc::Receiver<Envelope>,
    cancel: CancellationToken,
    forwarder: Option<JoinHandle<()>>,
}

impl Inbound {
    pub(crate) fn new(
        exchange: Exchange,
        receiver: mpsc::Receiver<Envelope>,
        cancel: CancellationToken,
        forwarder: JoinHandle<()>,
    ) -> Self {
        Self {
            exchange,
            receiver,
            cancel,
            forwarder: Some(forwarder),
        }
    }

    pub fn exchange(&self) -> Exchange {
        self.exchange
    }

    /// Next envelope, or `None` once the subscription has ended.
    pub async fn recv(&mut self) -> Option<Envelope> {
        self.receiver.recv().await
    }

    pub async fn close(mut self) {
        self.cancel.cancel();
        if let Some(forwarder) = self.forwarder.take() {
            let _ = forwarder.await;
        }
    }
}

impl Drop for Inbound {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_and_wildcard_topics() {
        assert!(topic_matches("e1", "e1"));
        assert!(!topic_matches("e1", "e2"));
        assert!(topic_matches("*", "e1"));
        assert!(!topic_matches("*", "e1.g1"));
        assert!(topic_matches("e1.*", "e1.g1"));
        assert!(!topic_matches("e1.*", "e1"));
    }

    #[test]
    fn hash_matches_zero_or_more_words() {
        assert!(topic_matches("#", "e1"));
        assert!(topic_matches("#", "e1.g1.x"));
        assert!(topic_matches("e1.#", "e1"));
        assert!(topic_matches("e1.#.x", "e1.g1.g2.x"));
        assert!(!topic_matches("e1.#.x", "e1.g1.y"));
    }

    #[test]
    fn exchange_names_round_trip() {
        for exchange in Exchange::ALL {
            assert_eq!(Exchange::from_name(exchange.name()), Some(exchange));
        }
        assert_eq!(Exchange::from_name("orders"), None);
    }
}
