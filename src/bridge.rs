//! Bridge loop
//!
//! Moves telegrams between the bus and the broker:
//!
//! - every bus event is published as JSON to `{prefix}/{main}/{middle}/{sub}`
//! - catalogued writes and responses are also published, retained, to
//!   `{named_prefix}/{name}` as `YYYYMMDD-HHMMSS <value>`
//! - JSON events on `{prefix}/cmd` are sent to the bus
//! - text commands on `{named_prefix}/cmd` are resolved through the catalog
//!   and sent to the bus
//!
//! Anything malformed is logged and dropped; the loop never stops on bad
//! input.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::catalog::Catalog;
use crate::event::Event;
use crate::eventlog::EventLog;
use crate::knx::GroupEvent;
use crate::mqtt::{BrokerClient, Message, Subscription};

/// Topic settings for the bridge loop
#[derive(Debug, Clone)]
pub struct BridgeOptions {
    /// Prefix for raw JSON events and the JSON command topic
    pub prefix: String,
    /// Prefix for decoded values and the text command topic
    pub named_prefix: Option<String>,
    /// Pause between attempts to subscribe at startup
    pub subscribe_retry: Duration,
}

impl BridgeOptions {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            named_prefix: None,
            subscribe_retry: Duration::from_millis(500),
        }
    }

    pub fn command_topic(&self) -> String {
        format!("{}/cmd", self.prefix)
    }

    pub fn named_command_topic(&self) -> Option<String> {
        self.named_prefix.as_ref().map(|p| format!("{}/cmd", p))
    }
}

pub struct Bridge {
    options: BridgeOptions,
    client: BrokerClient,
    events: mpsc::Receiver<Event>,
    commands: mpsc::Sender<GroupEvent>,
    catalog: Arc<Catalog>,
    event_log: Option<EventLog>,
}

impl Bridge {
    pub fn new(
        options: BridgeOptions,
        client: BrokerClient,
        events: mpsc::Receiver<Event>,
        commands: mpsc::Sender<GroupEvent>,
        catalog: Arc<Catalog>,
    ) -> Self {
        Self {
            options,
            client,
            events,
            commands,
            catalog,
            event_log: None,
        }
    }

    pub fn with_event_log(mut self, event_log: EventLog) -> Self {
        self.event_log = Some(event_log);
        self
    }

    /// Run until the bus event queue closes
    pub async fn run(mut self) {
        let mut raw_commands = self.subscribe(&self.options.command_topic()).await;
        let mut named_commands = match self.options.named_command_topic() {
            Some(topic) => Some(self.subscribe(&topic).await),
            None => None,
        };

        info!(
            "Bridge: Publishing bus traffic under {}/",
            self.options.prefix
        );

        loop {
            tokio::select! {
                event = self.events.recv() => match event {
                    Some(event) => self.handle_event(event).await,
                    None => {
                        info!("Bridge: Bus event queue closed, stopping");
                        return;
                    }
                },
                Some(message) = raw_commands.recv() => self.handle_command(message).await,
                Some(message) = next_message(&mut named_commands) => {
                    self.handle_named_command(message).await
                }
            }
        }
    }

    /// Subscribe, retrying until the broker accepts
    async fn subscribe(&self, filter: &str) -> Subscription {
        loop {
            match self.client.subscribe(filter).await {
                Ok(subscription) => {
                    info!("Bridge: Listening for commands on {}", filter);
                    return subscription;
                }
                Err(e) => {
                    warn!("Bridge: Subscribe to {} failed: {}", filter, e);
                    tokio::time::sleep(self.options.subscribe_retry).await;
                }
            }
        }
    }

    async fn handle_event(&mut self, event: Event) {
        debug!("Bridge: {}", event);

        let topic = event.topic(&self.options.prefix);
        if let Err(e) = self.client.publish(&topic, event.to_json()).await {
            warn!("Bridge: Publish to {} failed: {}", topic, e);
        }

        if let Some(named_prefix) = &self.options.named_prefix {
            match self.catalog.value(&event) {
                Some((entry, Ok(value))) => {
                    let payload = format!("{} {}", event.time.format("%Y%m%d-%H%M%S"), value);
                    for name in &entry.names {
                        let topic = format!("{}/{}", named_prefix, name);
                        if let Err(e) = self.client.publish_retain(&topic, payload.clone()).await {
                            warn!("Bridge: Publish to {} failed: {}", topic, e);
                        }
                    }
                }
                Some((entry, Err(e))) => warn!(
                    "Bridge: Cannot decode {:?} for {} ({}): {}",
                    event.data, event.destination, entry.datapoint.code, e
                ),
                None => {}
            }
        }

        if let Some(log) = &mut self.event_log {
            let line = self.catalog.describe(&event);
            if let Err(e) = log.append(&event.time, &line).await {
                warn!(
                    "Bridge: Cannot write event log in {}: {}",
                    log.dir().display(),
                    e
                );
            }
        }
    }

    async fn handle_command(&self, message: Message) {
        let event = match Event::from_json(&message.payload) {
            Ok(event) => event,
            Err(e) => {
                warn!(
                    "Bridge: Invalid command on {}: {} ({:?})",
                    message.topic,
                    e,
                    String::from_utf8_lossy(&message.payload)
                );
                return;
            }
        };
        debug!(
            "Bridge: Command {} to {}",
            event.command, event.destination
        );
        self.enqueue(event.to_group_event()).await;
    }

    async fn handle_named_command(&self, message: Message) {
        let text = String::from_utf8_lossy(&message.payload);
        match self.catalog.command(&text) {
            Ok(telegram) => {
                info!(
                    "Bridge: Command {:?}: sending {} to {}",
                    text, telegram.command, telegram.destination
                );
                self.enqueue(telegram).await;
            }
            Err(e) => warn!("Bridge: Rejected command {:?}: {}", text, e),
        }
    }

    async fn enqueue(&self, telegram: GroupEvent) {
        if self.commands.send(telegram).await.is_err() {
            warn!("Bridge: Bus command queue closed, dropping command");
        }
    }
}

async fn next_message(subscription: &mut Option<Subscription>) -> Option<Message> {
    match subscription {
        Some(subscription) => subscription.recv().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_topics() {
        let mut options = BridgeOptions::new("control/knx");
        assert_eq!(options.command_topic(), "control/knx/cmd");
        assert_eq!(options.named_command_topic(), None);

        options.named_prefix = Some("control/rooms".to_string());
        assert_eq!(
            options.named_command_topic().as_deref(),
            Some("control/rooms/cmd")
        );
    }
}
