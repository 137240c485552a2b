//! Bus fan-in and fan-out
//!
//! Every configured gateway gets a [`link`] task that keeps its connection
//! alive and feeds received telegrams into one bounded event queue. Outbound
//! telegrams go through one bounded command queue; a dispatcher task asks
//! the [`LinkRegistry`] which link has carried traffic for the destination
//! and hands the telegram to that link's live connection.

mod link;
pub mod registry;
pub mod router;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::event::Event;
use crate::knx::{normalize_endpoint, BusConnector, GroupEvent};

pub use registry::{LinkId, LinkRegistry, LinkSnapshot, Route};

use link::BusLink;

/// Bus-side settings
#[derive(Debug, Clone)]
pub struct BusOptions {
    /// Gateway endpoints, one link each, in routing priority order
    pub gateways: Vec<String>,
    /// Pause between connection attempts
    pub reconnect_interval: Duration,
    /// Replace the connection when a link is silent this long (off by default)
    pub idle_timeout: Option<Duration>,
    /// Capacity of the event and command queues
    pub queue_capacity: usize,
    /// Shortest address prefix the router accepts as a match
    pub min_prefix_bits: u8,
}

impl Default for BusOptions {
    fn default() -> Self {
        Self {
            gateways: Vec::new(),
            reconnect_interval: Duration::from_secs(45),
            idle_timeout: None,
            queue_capacity: 5,
            min_prefix_bits: router::MAIN_GROUP_BITS,
        }
    }
}

/// Handle to the running bus side
pub struct Bus {
    /// Telegrams received on any link
    pub events: mpsc::Receiver<Event>,
    /// Telegrams to route onto the bus
    pub commands: mpsc::Sender<GroupEvent>,
    pub registry: Arc<LinkRegistry>,
}

impl Bus {
    /// Spawn one link per gateway plus the outbound dispatcher
    pub fn start(options: BusOptions, connector: Arc<dyn BusConnector>) -> Self {
        let capacity = options.queue_capacity.max(1);
        let endpoints: Vec<String> = options
            .gateways
            .iter()
            .map(String::as_str)
            .map(normalize_endpoint)
            .collect();
        let registry = Arc::new(LinkRegistry::new(
            endpoints.iter().cloned(),
            options.min_prefix_bits,
        ));

        let (event_tx, event_rx) = mpsc::channel(capacity);
        let (command_tx, command_rx) = mpsc::channel(capacity);

        for (id, endpoint) in registry.ids().zip(endpoints) {
            let link = BusLink {
                id,
                endpoint,
                connector: connector.clone(),
                registry: registry.clone(),
                events: event_tx.clone(),
                reconnect_interval: options.reconnect_interval,
                idle_timeout: options.idle_timeout,
            };
            tokio::spawn(link.run());
        }

        tokio::spawn(dispatch(registry.clone(), command_rx));

        Self {
            events: event_rx,
            commands: command_tx,
            registry,
        }
    }
}

/// Send each outbound telegram through the link chosen by the router
async fn dispatch(registry: Arc<LinkRegistry>, mut commands: mpsc::Receiver<GroupEvent>) {
    while let Some(telegram) = commands.recv().await {
        let destination = telegram.destination;
        let Some(route) = registry.route(destination) else {
            warn!(
                "KNX: No link has carried traffic for {}, dropping {}",
                destination, telegram.command
            );
            continue;
        };
        let Some(handle) = route.handle else {
            warn!(
                "KNX {}: Reconnecting, dropping {} to {}",
                route.name, telegram.command, destination
            );
            continue;
        };

        debug!(
            "KNX {}: Sending {} to {}",
            route.name, telegram.command, destination
        );
        if let Err(e) = handle.send(telegram).await {
            warn!("KNX {}: Send to {} failed: {}", route.name, destination, e);
        }
    }
}
