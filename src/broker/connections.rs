use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};

use backon::{ExponentialBuilder, Retryable};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{BrokerConnection, amqp::AmqpConnection, embedded::EmbeddedBroker, local::LocalConnection, wire};
use crate::{
    config::{self, BrokerProperties, ConnectionProperties, EMBEDDED_SCHEME},
    error::{MessagingError, MessagingResult},
};

/// What answered on the configured broker address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerDetection {
    /// Nothing accepts connections on the address.
    Unreachable,
    /// An embedded broker completed the handshake.
    Embedded,
    /// An AMQP broker sent `Connection.Start`.
    Amqp,
    /// Something listens but identifies as neither.
    Unrecognised,
}

/// Probes the configured address.
pub async fn detect_broker(properties: &ConnectionProperties) -> MessagingResult<BrokerDetection> {
    let host = properties.host()?;
    let host = host.as_str();
    let port = properties.port();
    let wait = properties.probe_timeout();

    if port == 0 {
        return Ok(BrokerDetection::Unreachable);
    }

    match tokio::time::timeout(wait, TcpStream::connect((host, port))).await {
        Ok(Ok(_)) => {}
        Ok(Err(err)) => {
            debug!("nothing listening on {}:{}: {}", host, port, err);
            return Ok(BrokerDetection::Unreachable);
        }
        Err(_) => {
            debug!("connecting to {}:{} timed out", host, port);
            return Ok(BrokerDetection::Unreachable);
        }
    }

    if wire::probe(host, port, wait).await {
        return Ok(BrokerDetection::Embedded);
    }
    if rabbitmq::probe_broker(host, port, wait).await {
        return Ok(BrokerDetection::Amqp);
    }

    Ok(BrokerDetection::Unrecognised)
}

/// Whether an embedded broker must be started for these properties.
///
/// An explicit override decides on its own. Otherwise an external (non-loopback)
/// address never gets an embedded broker, and a loopback address gets one unless
/// a broker identifies itself there.
pub async fn is_embedded_broker_required(properties: &ConnectionProperties) -> MessagingResult<bool> {
    if let Some(start) = properties.start_broker() {
        debug!("embedded broker explicitly {}", if start { "requested" } else { "disabled" });
        return Ok(start);
    }

    if !properties.is_loopback() {
        return Ok(false);
    }

    let detection = detect_broker(properties).await?;
    Ok(requires_embedding(detection))
}

fn requires_embedding(detection: BrokerDetection) -> bool {
    matches!(detection, BrokerDetection::Unreachable | BrokerDetection::Unrecognised)
}

/// Fixed-size pool of connections to one broker endpoint.
///
/// Slots are connected lazily on first checkout and re-established when found
/// closed. Checkout is round-robin; every caller opens its own publisher or
/// subscription on the connection it receives. When built from a resource the
/// factory also owns the embedded broker, if one was started.
pub struct BrokerConnectionFactory {
    properties: BrokerProperties,
    client_name: String,
    slots: Vec<tokio::sync::Mutex<Option<Arc<dyn BrokerConnection>>>>,
    next: AtomicUsize,
    broker: Option<EmbeddedBroker>,
    closed: AtomicBool,
}

impl BrokerConnectionFactory {
    /// Pool of `connection_count` lazily established connections.
    ///
    /// # Errors
    /// `Configuration` when `connection_count` is zero.
    pub fn of(properties: BrokerProperties, connection_count: usize) -> MessagingResult<Self> {
        if connection_count == 0 {
            return Err(MessagingError::Configuration(
                "a connection factory needs at least one connection".to_string(),
            ));
        }

        Ok(Self {
            properties,
            client_name: format!("evaluation-messaging-{}", Uuid::new_v4()),
            slots: (0..connection_count).map(|_| tokio::sync::Mutex::new(None)).collect(),
            next: AtomicUsize::new(0),
            broker: None,
            closed: AtomicBool::new(false),
        })
    }

    /// Resolves the named properties resource, applies environment overrides,
    /// starts an embedded broker when required and checks that a connection can
    /// be made.
    ///
    /// # Errors
    /// `Configuration` for an unusable resource, `Startup` when the embedded broker
    /// cannot start or the broker never accepts a connection.
    pub async fn from_resource(name: &str, dynamic_binding_allowed: bool) -> MessagingResult<Self> {
        let properties = config::load_properties(name)?;
        Self::from_properties(properties, dynamic_binding_allowed).await
    }

    /// As [`BrokerConnectionFactory::from_resource`] with already resolved properties.
    pub async fn from_properties(
        mut properties: ConnectionProperties,
        dynamic_binding_allowed: bool,
    ) -> MessagingResult<Self> {
        let required = match properties.start_broker() {
            Some(start) => start,
            None if !properties.is_loopback() => false,
            None => {
                let detection = detect_broker(&properties).await?;
                if detection == BrokerDetection::Embedded && !properties.is_embedded() {
                    info!("an embedded broker already serves {}", properties.binding_url());
                    let mut url = properties.binding_url().clone();
                    url.set_scheme(EMBEDDED_SCHEME).map_err(|_| {
                        MessagingError::Configuration(format!("cannot rewrite binding URL {}", url))
                    })?;
                    properties.set_binding_url(url);
                }
                requires_embedding(detection)
            }
        };

        let connection_count = properties.connection_count();
        let properties = BrokerProperties::new(properties);

        let broker = if required {
            Some(EmbeddedBroker::start(&properties, dynamic_binding_allowed).await?)
        } else {
            None
        };

        let mut factory = Self::of(properties, connection_count)?;
        factory.broker = broker;

        if let Err(err) = factory.test_connection().await {
            factory.close().await;
            return Err(MessagingError::Startup(format!(
                "could not connect to the broker at {}: {}",
                factory.properties.binding_url(),
                err
            )));
        }

        Ok(factory)
    }

    pub fn properties(&self) -> &BrokerProperties {
        &self.properties
    }

    /// The embedded broker this factory started, if any.
    pub fn embedded_broker(&self) -> Option<&EmbeddedBroker> {
        self.broker.as_ref()
    }

    pub fn connection_count(&self) -> usize {
        self.slots.len()
    }

    /// Checks out the next connection of the pool, connecting it if needed.
    pub async fn connection(&self) -> MessagingResult<Arc<dyn BrokerConnection>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(MessagingError::InvalidState("connection factory is closed".to_string()));
        }

        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.slots.len();
        let mut slot = self.slots[index].lock().await;

        if let Some(connection) = slot.as_ref() {
            if connection.is_open() {
                return Ok(connection.clone());
            }
            warn!("pooled connection {} was closed, reconnecting", index);
        }

        let connection = self.open_connection().await?;
        *slot = Some(connection.clone());
        debug!("pooled connection {} established", index);
        Ok(connection)
    }

    /// Opens a connection outside the pool.
    pub async fn open_connection(&self) -> MessagingResult<Arc<dyn BrokerConnection>> {
        let properties = self.properties.snapshot();
        let host = properties.host()?;

        let connection: Arc<dyn BrokerConnection> = match properties.binding_url().scheme() {
            EMBEDDED_SCHEME => Arc::new(
                LocalConnection::open(&host, properties.port(), &self.client_name, properties.probe_timeout())
                    .await?,
            ),
            _ => Arc::new(AmqpConnection::open(&properties, &self.client_name).await?),
        };

        Ok(connection)
    }

    /// Opens and closes one connection, retrying with exponential backoff.
    ///
    /// Configuration errors are not retried.
    pub async fn test_connection(&self) -> MessagingResult<()> {
        let retries = self.properties.snapshot().connection_retries();
        let backoff = ExponentialBuilder::default()
            .with_min_delay(Duration::from_secs(1))
            .with_factor(2.0)
            .with_max_times(retries);

        (|| async {
            let connection = self.open_connection().await?;
            connection.close().await
        })
        .retry(backoff)
        .when(|err| !matches!(err, MessagingError::Configuration(_)))
        .notify(|err: &MessagingError, after: Duration| {
            warn!("broker connection test failed ({}), retrying in {:?}", err, after);
        })
        .await?;

        info!("connected to the broker at {}", self.properties.binding_url());
        Ok(())
    }

    /// Closes every established connection and the owned embedded broker. Idempotent.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        for slot in &self.slots {
            let connection = slot.lock().await.take();
            if let Some(connection) = connection {
                if let Err(err) = connection.close().await {
                    warn!("closing a pooled connection failed: {}", err);
                }
            }
        }

        if let Some(broker) = &self.broker {
            broker.close().await;
        }
    }
}
