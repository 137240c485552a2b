//! Bus link: one gateway connection, kept alive forever
//!
//! Only failed connects wait out the back-off. A connection that ends after
//! running for a while is re-established at once, and an idle one is
//! replaced before its handle is detached.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::registry::{LinkId, LinkRegistry};
use crate::event::Event;
use crate::knx::{BusConnection, BusConnector, GroupEvent};

/// Why a connection stopped delivering
#[derive(Debug, PartialEq, Eq)]
enum LinkEnd {
    /// Transport closed its inbound stream
    Closed,
    /// Nothing arrived within the idle timeout
    Idle,
    /// The fan-in queue is gone
    Shutdown,
}

pub(crate) struct BusLink {
    pub id: LinkId,
    pub endpoint: String,
    pub connector: Arc<dyn BusConnector>,
    pub registry: Arc<LinkRegistry>,
    pub events: mpsc::Sender<Event>,
    pub reconnect_interval: Duration,
    pub idle_timeout: Option<Duration>,
}

impl BusLink {
    fn name(&self) -> &str {
        self.registry.name(self.id)
    }

    pub async fn run(self) {
        let mut next: Option<BusConnection> = None;
        loop {
            let connection = match next.take() {
                Some(connection) => connection,
                None => {
                    debug!("KNX {}: Connecting to {}", self.name(), self.endpoint);
                    match self.connector.connect(&self.endpoint).await {
                        Ok(connection) => {
                            info!("KNX {}: Connected", self.name());
                            connection
                        }
                        Err(e) => {
                            warn!("KNX {}: Connect failed: {}", self.name(), e);
                            self.back_off().await;
                            continue;
                        }
                    }
                }
            };

            let BusConnection { inbound, sender } = connection;
            self.registry.attach(self.id, sender);
            let connected_at = Instant::now();

            match self.read_loop(inbound).await {
                LinkEnd::Shutdown => {
                    self.registry.detach(self.id);
                    debug!("KNX {}: Event queue closed, stopping", self.name());
                    return;
                }
                LinkEnd::Idle => {
                    warn!(
                        "KNX {}: No traffic for {:?}, reconnecting",
                        self.name(),
                        self.idle_timeout.unwrap_or_default()
                    );
                    // The old handle stays attached until its replacement is up
                    match self.connector.connect(&self.endpoint).await {
                        Ok(connection) => next = Some(connection),
                        Err(e) => {
                            self.registry.detach(self.id);
                            warn!("KNX {}: Connect failed: {}", self.name(), e);
                            self.back_off().await;
                        }
                    }
                }
                LinkEnd::Closed => {
                    self.registry.detach(self.id);
                    warn!("KNX {}: Connection lost", self.name());
                    // A gateway that drops us right away is treated like a failed connect
                    if connected_at.elapsed() < self.reconnect_interval {
                        self.back_off().await;
                    }
                }
            }
        }
    }

    async fn back_off(&self) {
        debug!(
            "KNX {}: Retrying in {:?}",
            self.name(),
            self.reconnect_interval
        );
        tokio::time::sleep(self.reconnect_interval).await;
    }

    async fn read_loop(&self, mut inbound: mpsc::Receiver<GroupEvent>) -> LinkEnd {
        loop {
            let next = match self.idle_timeout {
                Some(idle) => match timeout(idle, inbound.recv()).await {
                    Ok(next) => next,
                    Err(_) => return LinkEnd::Idle,
                },
                None => inbound.recv().await,
            };
            let Some(telegram) = next else {
                return LinkEnd::Closed;
            };

            let destination = telegram.destination;
            let event = Event::from_bus(self.name(), telegram);
            if self.events.send(event).await.is_err() {
                return LinkEnd::Shutdown;
            }
            if self.registry.learn(self.id, destination) {
                debug!("KNX {}: Learned {}", self.name(), destination);
            }
        }
    }
}
