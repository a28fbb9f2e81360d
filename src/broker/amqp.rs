use std::sync::Arc;

use async_trait::async_trait;
use rabbitmq::{ConnectionSettings, Message, Publisher, PublisherContext, RabbitConnection, TlsMaterial};
use tokio::{select, sync::mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{BrokerConnection, Exchange, ExchangePublisher, INBOUND_CAPACITY, Inbound};
use crate::{
    config::ConnectionProperties,
    error::{MessagingError, MessagingResult},
    messages::Envelope,
};

/// Connection to an external RabbitMQ broker.
pub struct AmqpConnection {
    inner: Arc<RabbitConnection>,
    cancel: CancellationToken,
}

impl AmqpConnection {
    /// Opens a connection to the broker named by the binding URL.
    ///
    /// # Errors
    /// `Configuration` when the URL or the client certificate material is unusable,
    /// `Connection` when the broker cannot be reached.
    pub async fn open(properties: &ConnectionProperties, client: &str) -> MessagingResult<Self> {
        let mut settings = ConnectionSettings::new(properties.binding_url().as_str(), client);
        if let Some(certificate) = properties.client_certificate() {
            settings = settings.with_tls(TlsMaterial {
                client_certificate: certificate.certificate.clone(),
                client_key: certificate.key.clone(),
                ca_certificate: certificate.trust_store.clone(),
                domain: properties.host()?,
            });
        }

        let inner = RabbitConnection::open(&settings).await?;

        Ok(Self {
            inner: Arc::new(inner),
            cancel: CancellationToken::new(),
        })
    }
}

#[async_trait]
impl BrokerConnection for AmqpConnection {
    async fn open_publisher(&self, exchange: Exchange) -> MessagingResult<Box<dyn ExchangePublisher>> {
        let publisher = self.inner.topic_publisher(exchange.name()).await?;

        Ok(Box::new(AmqpPublisher {
            exchange,
            publisher: tokio::sync::Mutex::new(Some(publisher)),
        }))
    }

    async fn subscribe(&self, exchange: Exchange, binding: &str) -> MessagingResult<Inbound> {
        let mut subscription = self
            .inner
            .topic_subscription(exchange.name(), &[binding.to_string()], INBOUND_CAPACITY as u16)
            .await?;

        let (envelopes, receiver) = mpsc::channel(INBOUND_CAPACITY);
        let cancel = self.cancel.child_token();
        let forwarder_cancel = cancel.clone();
        let forwarder = tokio::spawn(async move {
            loop {
                let message = select! {
                    _ = forwarder_cancel.cancelled() => break,
                    message = subscription.receive() => message,
                };
                let Some(message) = message else { break };

                // acked once handed over, so the prefetch window bounds what is in flight
                match message.content.as_deref().map(Envelope::decode) {
                    Some(Ok(envelope)) => {
                        let handed_over = select! {
                            _ = forwarder_cancel.cancelled() => false,
                            sent = envelopes.send(envelope) => sent.is_ok(),
                        };
                        if !handed_over {
                            break;
                        }
                    }
                    Some(Err(err)) => warn!("discarding a message from {}: {}", exchange.name(), err),
                    None => warn!("discarding an empty message from {}", exchange.name()),
                }

                if let Err(err) = subscription.ack(&message).await {
                    warn!("could not acknowledge a message from {}: {}", exchange.name(), err);
                }
            }

            if let Err(err) = subscription.close().await {
                debug!("closing the subscription to {} failed: {}", exchange.name(), err);
            }
        });

        Ok(Inbound::new(exchange, receiver, cancel, forwarder))
    }

    fn is_open(&self) -> bool {
        self.inner.is_open()
    }

    async fn close(&self) -> MessagingResult<()> {
        self.cancel.cancel();
        self.inner.close().await?;
        Ok(())
    }
}

struct AmqpPublisher {
    exchange: Exchange,
    publisher: tokio::sync::Mutex<Option<Publisher>>,
}

#[async_trait]
impl ExchangePublisher for AmqpPublisher {
    fn exchange(&self) -> Exchange {
        self.exchange
    }

    async fn publish(&self, routing_key: &str, envelope: &Envelope) -> MessagingResult<()> {
        let body = envelope.encode()?;
        let publisher = self.publisher.lock().await;
        let publisher = publisher.as_ref().ok_or_else(|| MessagingError::Publish {
            exchange: self.exchange.name().to_string(),
            reason: "publisher is closed".to_string(),
        })?;

        publisher
            .publish(
                Message::new(body, Some(routing_key.to_string())),
                PublisherContext::new(&envelope.evaluation_id, Some(envelope.message_id.clone())),
            )
            .await
            .map_err(|err| MessagingError::Publish {
                exchange: self.exchange.name().to_string(),
                reason: err.to_string(),
            })
    }

    async fn close(&self) -> MessagingResult<()> {
        let publisher = self.publisher.lock().await.take();
        if let Some(publisher) = publisher {
            publisher.close().await?;
        }
        Ok(())
    }
}
