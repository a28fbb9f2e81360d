//! In-process broker used when no external broker is reachable.
//!
//! Clients speak the length-delimited frames of `wire` over TCP. Each
//! connection is a session; a session's subscriptions are bindings of an
//! exchange and a topic pattern, and every publish fans out to all matching
//! bindings of all sessions.

use std::{
    collections::{BTreeMap, HashMap},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::{
    net::{TcpListener, TcpStream},
    select,
    sync::mpsc::{self, error::TrySendError},
    task::{JoinHandle, JoinSet},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use super::{
    INBOUND_CAPACITY, topic_matches,
    wire::{self, BROKER_NAME, Frame, PROTOCOL_VERSION},
};
use crate::{
    config::{BrokerProperties, EMBEDDED_SCHEME},
    error::{MessagingError, MessagingResult},
};

/// A running embedded broker. Dropping it stops the broker; `close` also waits
/// for the accept loop to finish.
pub struct EmbeddedBroker {
    binding_url: Url,
    port: u16,
    cancel: CancellationToken,
    acceptor: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl EmbeddedBroker {
    /// Starts a broker on the host and port named by `properties`.
    ///
    /// When the port is taken and `allow_dynamic_binding` is set, an ephemeral
    /// port is bound instead; a configured port of 0 always binds an ephemeral
    /// port. On success the binding URL in `properties` is rewritten to the
    /// embedded scheme and the port actually bound, and the same URL is returned
    /// by [`EmbeddedBroker::binding_url`].
    ///
    /// # Errors
    /// `Startup` when the port is taken and dynamic binding is not allowed, or
    /// when no port can be bound at all. `properties` is left untouched.
    pub async fn start(properties: &BrokerProperties, allow_dynamic_binding: bool) -> MessagingResult<Self> {
        let snapshot = properties.snapshot();
        let host = snapshot.host()?;
        let bind_host = bind_address(&host);
        let configured_port = snapshot.port();

        let listener = match TcpListener::bind((bind_host, configured_port)).await {
            Ok(listener) => listener,
            Err(err) if allow_dynamic_binding => {
                warn!(
                    "could not bind the embedded broker to {}:{} ({}), binding an ephemeral port instead",
                    bind_host, configured_port, err
                );
                TcpListener::bind((bind_host, 0)).await.map_err(|err| {
                    MessagingError::Startup(format!(
                        "could not bind the embedded broker to an ephemeral port on {}: {}",
                        bind_host, err
                    ))
                })?
            }
            Err(err) => {
                return Err(MessagingError::Startup(format!(
                    "could not bind the embedded broker to {}:{} and dynamic binding is not allowed: {}",
                    bind_host, configured_port, err
                )));
            }
        };

        let port = listener
            .local_addr()
            .map_err(|err| MessagingError::Startup(format!("embedded broker has no local address: {}", err)))?
            .port();

        let mut binding_url = snapshot.binding_url().clone();
        binding_url
            .set_scheme(EMBEDDED_SCHEME)
            .and_then(|_| binding_url.set_port(Some(port)))
            .map_err(|_| {
                MessagingError::Startup(format!(
                    "cannot rewrite binding URL {} for the embedded broker",
                    snapshot.binding_url()
                ))
            })?;

        let cancel = CancellationToken::new();
        let acceptor = tokio::spawn(accept_sessions(listener, Arc::new(Router::default()), cancel.clone()));

        properties.update(|current| current.set_binding_url(binding_url.clone()));
        info!("embedded broker listening on {}:{} ({})", bind_host, port, binding_url);

        Ok(Self {
            binding_url,
            port,
            cancel,
            acceptor: Mutex::new(Some(acceptor)),
            closed: AtomicBool::new(false),
        })
    }

    /// The port actually bound.
    pub fn messaging_port(&self) -> u16 {
        self.port
    }

    /// The resolved binding URL, identical to the one written into the properties.
    pub fn binding_url(&self) -> &Url {
        &self.binding_url
    }

    /// Stops accepting connections and ends every session. Idempotent.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            debug!("embedded broker on port {} already closed", self.port);
            return;
        }

        self.cancel.cancel();
        let acceptor = self.acceptor.lock().take();
        if let Some(acceptor) = acceptor {
            let _ = acceptor.await;
        }

        info!("embedded broker on port {} closed", self.port);
    }
}

impl Drop for EmbeddedBroker {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn bind_address(host: &str) -> &str {
    match host {
        "localhost" => "127.0.0.1",
        other => other,
    }
}

/// Frames queued for a session's socket before the session is disconnected.
const SESSION_CAPACITY: usize = 4 * INBOUND_CAPACITY;

struct Binding {
    exchange: String,
    pattern: String,
    session: mpsc::Sender<Frame>,
    /// Disconnects the owning session.
    evict: CancellationToken,
}

#[derive(Default)]
struct Router {
    bindings: Mutex<HashMap<(u64, u64), Binding>>,
}

impl Router {
    fn bind(&self, session_id: u64, subscription: u64, binding: Binding) {
        debug!(
            "session {} subscription {} bound to {} with {}",
            session_id, subscription, binding.exchange, binding.pattern
        );
        self.bindings.lock().insert((session_id, subscription), binding);
    }

    fn unbind(&self, session_id: u64, subscription: u64) {
        self.bindings.lock().remove(&(session_id, subscription));
    }

    fn drop_session(&self, session_id: u64) {
        self.bindings.lock().retain(|(session, _), _| *session != session_id);
    }

    /// Fans a publish out without waiting on any session; a session whose queue
    /// is full is disconnected.
    fn route(&self, exchange: &str, routing_key: &str, body: &[u8]) {
        let mut bindings = self.bindings.lock();
        let mut delivered = 0;
        let mut lagging = BTreeMap::new();
        for ((session_id, subscription), binding) in bindings.iter() {
            if binding.exchange == exchange && topic_matches(&binding.pattern, routing_key) {
                let deliver = Frame::Deliver {
                    subscription: *subscription,
                    routing_key: routing_key.to_string(),
                    body: body.to_vec(),
                };
                match binding.session.try_send(deliver) {
                    Ok(()) => delivered += 1,
                    Err(TrySendError::Full(_)) => {
                        lagging.insert(*session_id, binding.evict.clone());
                    }
                    Err(TrySendError::Closed(_)) => {}
                }
            }
        }

        for (session_id, evict) in lagging {
            warn!("session {} fell {} frames behind, disconnecting it", session_id, SESSION_CAPACITY);
            bindings.retain(|(session, _), _| *session != session_id);
            evict.cancel();
        }
        debug!("routed {} on {} to {} subscriptions", routing_key, exchange, delivered);
    }
}

async fn accept_sessions(listener: TcpListener, router: Arc<Router>, cancel: CancellationToken) {
    let mut sessions = JoinSet::new();
    let mut next_session = 0u64;

    loop {
        select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    next_session += 1;
                    debug!("session {} opened from {}", next_session, peer);
                    sessions.spawn(serve_session(next_session, stream, router.clone(), cancel.child_token()));
                }
                Err(err) => warn!("embedded broker failed to accept a connection: {}", err),
            },
            Some(_) = sessions.join_next(), if !sessions.is_empty() => {}
        }
    }

    while sessions.join_next().await.is_some() {}
}

async fn serve_session(session_id: u64, stream: TcpStream, router: Arc<Router>, cancel: CancellationToken) {
    if let Err(err) = stream.set_nodelay(true) {
        debug!("session {}: could not disable nagle: {}", session_id, err);
    }
    let (mut sink, mut frames) = wire::framed(stream).split();

    let greeting = select! {
        _ = cancel.cancelled() => return,
        frame = frames.next() => frame,
    };
    match greeting {
        Some(Ok(Frame::Hello { client, protocol })) if protocol == PROTOCOL_VERSION => {
            debug!("session {} greeted by {}", session_id, client);
            let welcome = Frame::Welcome {
                broker: BROKER_NAME.to_string(),
                protocol: PROTOCOL_VERSION,
            };
            if sink.send(welcome).await.is_err() {
                return;
            }
        }
        Some(Ok(Frame::Hello { protocol, .. })) => {
            let reason = format!("unsupported protocol {}", protocol);
            let _ = sink.send(Frame::Refused { reason }).await;
            return;
        }
        other => {
            debug!("session {} closed before the handshake: {:?}", session_id, other);
            return;
        }
    }

    let (outbound, mut pending) = mpsc::channel::<Frame>(SESSION_CAPACITY);
    let writer = tokio::spawn(async move {
        while let Some(frame) = pending.recv().await {
            if let Err(err) = sink.send(frame).await {
                debug!("session {} writer stopped: {}", session_id, err);
                break;
            }
        }
    });

    loop {
        let frame = select! {
            _ = cancel.cancelled() => break,
            frame = frames.next() => frame,
        };

        match frame {
            Some(Ok(Frame::Subscribe {
                subscription,
                exchange,
                binding,
            })) => {
                router.bind(
                    session_id,
                    subscription,
                    Binding {
                        exchange,
                        pattern: binding,
                        session: outbound.clone(),
                        evict: cancel.clone(),
                    },
                );
                if outbound.try_send(Frame::Subscribed { subscription }).is_err() {
                    warn!("session {} is not draining its frames, disconnecting it", session_id);
                    cancel.cancel();
                    break;
                }
            }
            Some(Ok(Frame::Unsubscribe { subscription })) => router.unbind(session_id, subscription),
            Some(Ok(Frame::Publish {
                exchange,
                routing_key,
                body,
            })) => router.route(&exchange, &routing_key, &body),
            Some(Ok(other)) => warn!("session {} sent an unexpected frame {:?}", session_id, other),
            Some(Err(err)) => {
                warn!("session {} sent an unreadable frame: {}", session_id, err);
                break;
            }
            None => break,
        }
    }

    router.drop_session(session_id);
    drop(outbound);
    if cancel.is_cancelled() {
        writer.abort();
    }
    let _ = writer.await;
    debug!("session {} closed", session_id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConnectionProperties;

    fn properties(url: &str) -> BrokerProperties {
        BrokerProperties::new(ConnectionProperties::new(Url::parse(url).unwrap()))
    }

    #[test_log::test(tokio::test)]
    async fn binds_ephemeral_port_when_configured_with_zero() {
        let properties = properties("amqp://localhost:0");

        let broker = EmbeddedBroker::start(&properties, false).await.unwrap();

        assert_ne!(broker.messaging_port(), 0);
        assert_eq!(properties.snapshot().port(), broker.messaging_port());
        assert_eq!(properties.binding_url().scheme(), EMBEDDED_SCHEME);
        assert!(wire::probe("127.0.0.1", broker.messaging_port(), std::time::Duration::from_secs(2)).await);

        broker.close().await;
    }

    fn binding(exchange: &str, pattern: &str, capacity: usize) -> (Binding, mpsc::Receiver<Frame>) {
        let (session, frames) = mpsc::channel(capacity);
        let binding = Binding {
            exchange: exchange.to_string(),
            pattern: pattern.to_string(),
            session,
            evict: CancellationToken::new(),
        };
        (binding, frames)
    }

    #[test]
    fn lagging_session_is_disconnected_and_others_keep_receiving() {
        let router = Router::default();
        let (lagging, _undrained) = binding("evaluation.statistics", "#", 2);
        let lagging_evict = lagging.evict.clone();
        let (attentive, mut drained) = binding("evaluation.statistics", "e1", 2);
        let attentive_evict = attentive.evict.clone();
        router.bind(1, 1, lagging);
        router.bind(2, 1, attentive);

        for _ in 0..3 {
            router.route("evaluation.statistics", "e1", b"body");
            assert!(matches!(drained.try_recv(), Ok(Frame::Deliver { .. })));
        }

        assert!(lagging_evict.is_cancelled());
        assert!(!attentive_evict.is_cancelled());
        let bindings = router.bindings.lock();
        assert!(!bindings.contains_key(&(1, 1)));
        assert!(bindings.contains_key(&(2, 1)));
    }

    #[test_log::test(tokio::test)]
    async fn close_is_idempotent_and_stops_accepting() {
        let properties = properties("amqp://localhost:0");
        let broker = EmbeddedBroker::start(&properties, true).await.unwrap();
        let port = broker.messaging_port();

        broker.close().await;
        broker.close().await;

        assert!(!wire::probe("127.0.0.1", port, std::time::Duration::from_millis(500)).await);
    }
}
