//! Self-healing broker client
//!
//! [`BrokerClient`] is the bridge's only view of the broker. It keeps the
//! current [`MqttSession`] together with every subscription ever requested.
//! A supervisor task waits for the session to close, then holds the state
//! lock while it reconnects (retrying forever) and replays each subscription
//! once against the new session. Publishes and subscribes issued meanwhile
//! wait on the lock until their own operation timeout expires.

use std::sync::{Arc, Weak};

use bytes::Bytes;
use tokio::sync::{mpsc, Mutex};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::{Message, MqttError, MqttOptions, MqttSession};
use crate::topic::topic_matches_filter;

/// Subscription kept across reconnects
struct SubscriptionRecord {
    filter: String,
    tx: mpsc::UnboundedSender<Message>,
}

struct ClientState {
    session: MqttSession,
    subscriptions: Vec<SubscriptionRecord>,
}

struct Inner {
    options: MqttOptions,
    state: Mutex<ClientState>,
    inbound_tx: mpsc::UnboundedSender<Message>,
}

/// Stream of messages matching one topic filter
#[derive(Debug)]
pub struct Subscription {
    filter: String,
    rx: mpsc::UnboundedReceiver<Message>,
}

impl Subscription {
    pub fn filter(&self) -> &str {
        &self.filter
    }

    /// Next matching message; `None` once the client is gone
    pub async fn recv(&mut self) -> Option<Message> {
        self.rx.recv().await
    }
}

/// One logical broker connection that survives transport failures
#[derive(Clone)]
pub struct BrokerClient {
    inner: Arc<Inner>,
}

impl BrokerClient {
    /// Connect to the broker, retrying until it answers
    pub async fn connect(options: MqttOptions) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let session = connect_until_ready(&options, &inbound_tx).await;
        info!("Connected to MQTT broker {}", options.address());

        let inner = Arc::new(Inner {
            options,
            state: Mutex::new(ClientState {
                session,
                subscriptions: Vec::new(),
            }),
            inbound_tx,
        });

        tokio::spawn(supervise(Arc::downgrade(&inner)));
        tokio::spawn(dispatch(Arc::downgrade(&inner), inbound_rx));

        Self { inner }
    }

    /// Fire-and-forget publish
    pub async fn publish(&self, topic: &str, payload: impl Into<Bytes>) -> Result<(), MqttError> {
        self.send(topic, payload.into(), false).await
    }

    /// Publish with the retain flag set
    pub async fn publish_retain(
        &self,
        topic: &str,
        payload: impl Into<Bytes>,
    ) -> Result<(), MqttError> {
        self.send(topic, payload.into(), true).await
    }

    async fn send(&self, topic: &str, payload: Bytes, retain: bool) -> Result<(), MqttError> {
        timeout(self.inner.options.operation_timeout, async {
            let state = self.inner.state.lock().await;
            state.session.publish(topic, payload, retain).await
        })
        .await
        .map_err(|_| MqttError::Timeout)?
    }

    /// Subscribe to a topic filter
    ///
    /// The subscription is recorded before the broker is asked. If the call
    /// fails or times out the returned receiver is gone, so the record is
    /// pruned and the caller has to subscribe again.
    pub async fn subscribe(&self, filter: &str) -> Result<Subscription, MqttError> {
        let (tx, rx) = mpsc::unbounded_channel();

        timeout(self.inner.options.operation_timeout, async {
            let mut state = self.inner.state.lock().await;
            state.subscriptions.push(SubscriptionRecord {
                filter: filter.to_string(),
                tx,
            });
            state.session.subscribe(filter).await
        })
        .await
        .map_err(|_| MqttError::Timeout)??;

        debug!("Subscribed to {}", filter);
        Ok(Subscription {
            filter: filter.to_string(),
            rx,
        })
    }

    /// Whether the underlying session is currently up
    pub async fn is_connected(&self) -> bool {
        !self.inner.state.lock().await.session.is_closed()
    }
}

async fn connect_until_ready(
    options: &MqttOptions,
    inbound: &mpsc::UnboundedSender<Message>,
) -> MqttSession {
    loop {
        match MqttSession::connect(options, inbound.clone()).await {
            Ok(session) => return session,
            Err(e) => {
                warn!("MQTT {}: {}", options.address(), e);
                tokio::time::sleep(options.reconnect_interval).await;
            }
        }
    }
}

/// Reconnect and resubscribe whenever the session closes
async fn supervise(inner: Weak<Inner>) {
    loop {
        let mut closed = {
            let Some(inner) = inner.upgrade() else { return };
            let state = inner.state.lock().await;
            let closed = state.session.closed();
            closed
        };

        // Also ends when the session driver is dropped
        let _ = closed.wait_for(|c| *c).await;

        let Some(inner) = inner.upgrade() else { return };
        let mut state = inner.state.lock().await;
        warn!(
            "MQTT {}: Connection lost, reconnecting",
            inner.options.address()
        );

        loop {
            tokio::time::sleep(inner.options.reconnect_interval).await;
            state.session = connect_until_ready(&inner.options, &inner.inbound_tx).await;
            state.subscriptions.retain(|record| !record.tx.is_closed());

            match restore_subscriptions(&inner.options, &state).await {
                Ok(()) => break,
                Err(e) => warn!(
                    "MQTT {}: Restoring subscriptions failed: {}, reconnecting",
                    inner.options.address(),
                    e
                ),
            }
        }

        info!(
            "MQTT {}: Reconnected, {} subscription(s) restored",
            inner.options.address(),
            state.subscriptions.len()
        );
    }
}

/// Replay every subscription record against a fresh session
///
/// A refused filter is only logged. A timeout or a lost session stops the
/// replay with an error and the session has to be replaced.
async fn restore_subscriptions(options: &MqttOptions, state: &ClientState) -> Result<(), MqttError> {
    for record in &state.subscriptions {
        let result = timeout(options.operation_timeout, state.session.subscribe(&record.filter))
            .await
            .unwrap_or(Err(MqttError::Timeout));
        match result {
            Ok(()) => {}
            Err(e @ (MqttError::Timeout | MqttError::ConnectionLost(_))) => return Err(e),
            Err(e) => warn!("MQTT: Resubscribing to {} failed: {}", record.filter, e),
        }
    }
    Ok(())
}

/// Route inbound messages to every matching subscription
async fn dispatch(inner: Weak<Inner>, mut inbound_rx: mpsc::UnboundedReceiver<Message>) {
    while let Some(message) = inbound_rx.recv().await {
        let Some(inner) = inner.upgrade() else { return };
        let mut state = inner.state.lock().await;

        state.subscriptions.retain(|record| !record.tx.is_closed());
        for record in &state.subscriptions {
            if topic_matches_filter(&message.topic, &record.filter) {
                let _ = record.tx.send(message.clone());
            }
        }
    }
}
