use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::{
    select,
    sync::{
        mpsc::{self, error::TrySendError},
        oneshot,
    },
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use super::{
    BrokerConnection, Exchange, ExchangePublisher, INBOUND_CAPACITY, Inbound,
    wire::{self, Frame},
};
use crate::{
    error::{MessagingError, MessagingResult},
    messages::Envelope,
};

/// Frames buffered for the socket writer before `publish` suspends.
const OUTBOUND_CAPACITY: usize = 1024;

const SUBSCRIBE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Default)]
struct Routes {
    active: HashMap<u64, mpsc::Sender<Vec<u8>>>,
    pending: HashMap<u64, oneshot::Sender<()>>,
}

impl Routes {
    fn forget(&mut self, subscription: u64) {
        self.active.remove(&subscription);
        self.pending.remove(&subscription);
    }
}

/// Connection to an [`EmbeddedBroker`](super::embedded::EmbeddedBroker).
///
/// A writer task drains a bounded frame buffer into the socket and a reader task
/// routes deliveries to the subscriptions opened on this connection.
pub(crate) struct LocalConnection {
    outbound: mpsc::Sender<Frame>,
    routes: Arc<Mutex<Routes>>,
    next_subscription: AtomicU64,
    open: Arc<AtomicBool>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    subscribe_timeout: Duration,
}

impl LocalConnection {
    pub(crate) async fn open(host: &str, port: u16, client: &str, wait: Duration) -> MessagingResult<Self> {
        let (mut sink, mut frames) = wire::connect(host, port, client, wait).await?.split();
        debug!("connected to the embedded broker at {}:{} as {}", host, port, client);

        let (outbound, mut buffered) = mpsc::channel::<Frame>(OUTBOUND_CAPACITY);
        let routes = Arc::new(Mutex::new(Routes::default()));
        let open = Arc::new(AtomicBool::new(true));
        let cancel = CancellationToken::new();

        let writer_open = open.clone();
        let writer_cancel = cancel.clone();
        let writer = tokio::spawn(async move {
            loop {
                let frame = select! {
                    _ = writer_cancel.cancelled() => {
                        // flush what was published before the close
                        while let Ok(frame) = buffered.try_recv() {
                            if sink.send(frame).await.is_err() {
                                break;
                            }
                        }
                        break;
                    }
                    frame = buffered.recv() => frame,
                };
                let Some(frame) = frame else { break };
                if let Err(err) = sink.send(frame).await {
                    error!("lost the connection to the embedded broker: {}", err);
                    break;
                }
            }
            writer_open.store(false, Ordering::SeqCst);
            let _ = sink.close().await;
        });

        let reader_routes = routes.clone();
        let reader_open = open.clone();
        let reader_cancel = cancel.clone();
        let reader = tokio::spawn(async move {
            loop {
                let frame = select! {
                    _ = reader_cancel.cancelled() => break,
                    frame = frames.next() => frame,
                };

                match frame {
                    Some(Ok(Frame::Deliver { subscription, body, .. })) => {
                        let mut routes = reader_routes.lock();
                        let delivered = match routes.active.get(&subscription) {
                            Some(target) => target.try_send(body),
                            None => {
                                debug!("dropping a delivery for closed subscription {}", subscription);
                                continue;
                            }
                        };
                        match delivered {
                            Ok(()) => {}
                            Err(TrySendError::Full(_)) => {
                                // ends the inbound instead of stalling every other subscription
                                error!(
                                    "subscription {} fell {} deliveries behind, ending it",
                                    subscription, INBOUND_CAPACITY
                                );
                                routes.forget(subscription);
                            }
                            Err(TrySendError::Closed(_)) => routes.forget(subscription),
                        }
                    }
                    Some(Ok(Frame::Subscribed { subscription })) => {
                        if let Some(confirm) = reader_routes.lock().pending.remove(&subscription) {
                            let _ = confirm.send(());
                        }
                    }
                    Some(Ok(Frame::Refused { reason })) => {
                        error!("embedded broker refused the connection: {}", reason);
                        break;
                    }
                    Some(Ok(other)) => warn!("unexpected frame from the embedded broker {:?}", other),
                    Some(Err(err)) => {
                        error!("unreadable frame from the embedded broker: {}", err);
                        break;
                    }
                    None => {
                        debug!("embedded broker closed the connection");
                        break;
                    }
                }
            }

            reader_open.store(false, Ordering::SeqCst);
            // ends every inbound fed by this connection
            let mut routes = reader_routes.lock();
            routes.active.clear();
            routes.pending.clear();
        });

        Ok(Self {
            outbound,
            routes,
            next_subscription: AtomicU64::new(1),
            open,
            cancel,
            tasks: Mutex::new(vec![writer, reader]),
            subscribe_timeout: SUBSCRIBE_TIMEOUT,
        })
    }
}

#[async_trait]
impl BrokerConnection for LocalConnection {
    async fn open_publisher(&self, exchange: Exchange) -> MessagingResult<Box<dyn ExchangePublisher>> {
        if !self.is_open() {
            return Err(MessagingError::Connection(
                "connection to the embedded broker is closed".to_string(),
            ));
        }

        Ok(Box::new(LocalPublisher {
            exchange,
            outbound: self.outbound.clone(),
            closed: AtomicBool::new(false),
        }))
    }

    async fn subscribe(&self, exchange: Exchange, binding: &str) -> MessagingResult<Inbound> {
        let subscription = self.next_subscription.fetch_add(1, Ordering::SeqCst);
        let (raw_sender, mut raw) = mpsc::channel::<Vec<u8>>(INBOUND_CAPACITY);
        let (confirm, confirmed) = oneshot::channel();
        {
            let mut routes = self.routes.lock();
            routes.active.insert(subscription, raw_sender);
            routes.pending.insert(subscription, confirm);
        }

        let closed = || MessagingError::Connection("connection to the embedded broker is closed".to_string());
        let requested = self
            .outbound
            .send(Frame::Subscribe {
                subscription,
                exchange: exchange.name().to_string(),
                binding: binding.to_string(),
            })
            .await;
        if requested.is_err() {
            self.routes.lock().forget(subscription);
            return Err(closed());
        }

        match tokio::time::timeout(self.subscribe_timeout, confirmed).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) => return Err(closed()),
            Err(_) => {
                self.routes.lock().forget(subscription);
                return Err(MessagingError::Connection(format!(
                    "subscription to {} was not confirmed within {:?}",
                    exchange.name(),
                    self.subscribe_timeout
                )));
            }
        }

        let (envelopes, receiver) = mpsc::channel(INBOUND_CAPACITY);
        let cancel = self.cancel.child_token();
        let forwarder_cancel = cancel.clone();
        let outbound = self.outbound.clone();
        let routes = self.routes.clone();
        let forwarder = tokio::spawn(async move {
            loop {
                let body = select! {
                    _ = forwarder_cancel.cancelled() => break,
                    body = raw.recv() => body,
                };
                let Some(body) = body else { break };

                match Envelope::decode(&body) {
                    Ok(envelope) => {
                        let handed_over = select! {
                            _ = forwarder_cancel.cancelled() => false,
                            sent = envelopes.send(envelope) => sent.is_ok(),
                        };
                        if !handed_over {
                            break;
                        }
                    }
                    Err(err) => warn!("discarding a message from {}: {}", exchange.name(), err),
                }
            }

            routes.lock().forget(subscription);
            let _ = outbound.send(Frame::Unsubscribe { subscription }).await;
        });

        debug!("subscribed to {} with {}", exchange.name(), binding);
        Ok(Inbound::new(exchange, receiver, cancel, forwarder))
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst) && !self.cancel.is_cancelled()
    }

    async fn close(&self) -> MessagingResult<()> {
        self.cancel.cancel();
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }
        Ok(())
    }
}

impl Drop for LocalConnection {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

struct LocalPublisher {
    exchange: Exchange,
    outbound: mpsc::Sender<Frame>,
    closed: AtomicBool,
}

#[async_trait]
impl ExchangePublisher for LocalPublisher {
    fn exchange(&self) -> Exchange {
        self.exchange
    }

    async fn publish(&self, routing_key: &str, envelope: &Envelope) -> MessagingResult<()> {
        let failed = |reason: &str| MessagingError::Publish {
            exchange: self.exchange.name().to_string(),
            reason: reason.to_string(),
        };

        if self.closed.load(Ordering::SeqCst) {
            return Err(failed("publisher is closed"));
        }

        let body = envelope.encode()?;
        self.outbound
            .send(Frame::Publish {
                exchange: self.exchange.name().to_string(),
                routing_key: routing_key.to_string(),
                body,
            })
            .await
            .map_err(|_| failed("connection to the embedded broker is closed"))
    }

    async fn close(&self) -> MessagingResult<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}
