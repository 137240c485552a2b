//! In-process fakes shared by the integration tests
//!
//! [`FakeBroker`] speaks just enough MQTT 3.1.1 (through the crate's own
//! codec) to accept the bridge's connection, acknowledge subscriptions and
//! relay publishes. [`FakeConnector`] stands in for the KNX gateways.

#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;

use knx2mqtt::codec::{Decoder, Encoder};
use knx2mqtt::knx::{
    normalize_endpoint, BusConnection, BusConnector, BusError, BusSender, GroupCommand,
    GroupEvent,
};
use knx2mqtt::protocol::{ConnAck, Packet, Publish, SubAck};
use knx2mqtt::topic::topic_matches_filter;

pub const WAIT: Duration = Duration::from_secs(5);

struct Client {
    filters: Vec<String>,
    tx: mpsc::UnboundedSender<Packet>,
    tasks: Vec<JoinHandle<()>>,
}

#[derive(Default)]
struct BrokerState {
    clients: Mutex<Vec<Arc<Mutex<Client>>>>,
    subscribes: Mutex<Vec<String>>,
    refuse: AtomicBool,
    swallow_subscribes: AtomicUsize,
}

/// Minimal MQTT broker on a loopback port
pub struct FakeBroker {
    pub addr: SocketAddr,
    state: Arc<BrokerState>,
    connections: watch::Receiver<usize>,
    subscribed: watch::Receiver<usize>,
    published: tokio::sync::Mutex<mpsc::UnboundedReceiver<Publish>>,
}

impl FakeBroker {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = Arc::new(BrokerState::default());
        let (conn_tx, connections) = watch::channel(0);
        let (sub_tx, subscribed) = watch::channel(0);
        let (pub_tx, pub_rx) = mpsc::unbounded_channel();

        let accept_state = state.clone();
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                if accept_state.refuse.load(Ordering::SeqCst) {
                    drop(stream);
                    continue;
                }
                serve(
                    stream,
                    accept_state.clone(),
                    conn_tx.clone(),
                    sub_tx.clone(),
                    pub_tx.clone(),
                );
            }
        });

        Self {
            addr,
            state,
            connections,
            subscribed,
            published: tokio::sync::Mutex::new(pub_rx),
        }
    }

    /// Close every client connection
    pub fn drop_connections(&self) {
        for client in self.state.clients.lock().drain(..) {
            for task in client.lock().tasks.drain(..) {
                task.abort();
            }
        }
    }

    /// Close new connections right after accepting them
    pub fn refuse(&self, refuse: bool) {
        self.state.refuse.store(refuse, Ordering::SeqCst);
    }

    /// Leave the next `count` SUBSCRIBEs unanswered and unrecorded
    pub fn swallow_subscribes(&self, count: usize) {
        self.state.swallow_subscribes.store(count, Ordering::SeqCst);
    }

    /// Wait until `count` CONNECTs have been accepted in total
    pub async fn wait_connections(&self, count: usize) {
        let mut rx = self.connections.clone();
        timeout(WAIT, rx.wait_for(|n| *n >= count))
            .await
            .expect("client never connected")
            .unwrap();
    }

    /// Wait until `filter` has been subscribed `count` times in total
    pub async fn wait_subscribed(&self, filter: &str, count: usize) {
        let mut rx = self.subscribed.clone();
        let state = self.state.clone();
        timeout(
            WAIT,
            rx.wait_for(|_| state.subscribes.lock().iter().filter(|f| *f == filter).count() >= count),
        )
        .await
        .unwrap_or_else(|_| panic!("{} never subscribed {} times", filter, count))
        .unwrap();
    }

    pub fn subscribe_count(&self, filter: &str) -> usize {
        self.state
            .subscribes
            .lock()
            .iter()
            .filter(|f| *f == filter)
            .count()
    }

    /// Deliver a message to every connected subscriber
    pub fn publish(&self, topic: &str, payload: impl Into<Bytes>) {
        let payload = payload.into();
        for client in self.state.clients.lock().iter() {
            let client = client.lock();
            if client.filters.iter().any(|f| topic_matches_filter(topic, f)) {
                let _ = client.tx.send(Packet::Publish(Publish {
                    topic: topic.to_string(),
                    payload: payload.clone(),
                    ..Default::default()
                }));
            }
        }
    }

    /// Next PUBLISH received from a client
    pub async fn next_publish(&self) -> Publish {
        let mut rx = self.published.lock().await;
        timeout(WAIT, rx.recv())
            .await
            .expect("nothing published")
            .unwrap()
    }

    /// Next PUBLISH on `topic`, skipping others
    pub async fn next_publish_on(&self, topic: &str) -> Publish {
        loop {
            let publish = self.next_publish().await;
            if publish.topic == topic {
                return publish;
            }
        }
    }

    /// Whether nothing is published for a short while
    pub async fn nothing_published(&self) -> bool {
        let mut rx = self.published.lock().await;
        timeout(Duration::from_millis(200), rx.recv()).await.is_err()
    }
}

fn serve(
    stream: TcpStream,
    state: Arc<BrokerState>,
    connections: watch::Sender<usize>,
    subscribed: watch::Sender<usize>,
    published: mpsc::UnboundedSender<Publish>,
) {
    let (mut reader, mut writer) = stream.into_split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Packet>();
    let client = Arc::new(Mutex::new(Client {
        filters: Vec::new(),
        tx: tx.clone(),
        tasks: Vec::new(),
    }));

    let write_task = tokio::spawn(async move {
        while let Some(packet) = rx.recv().await {
            let mut buf = BytesMut::new();
            Encoder::new().encode(&packet, &mut buf).unwrap();
            if writer.write_all(&buf).await.is_err() {
                return;
            }
        }
    });

    let reader_client = client.clone();
    let reader_state = state.clone();
    let read_task = tokio::spawn(async move {
        let decoder = Decoder::new();
        let mut buf = BytesMut::new();
        loop {
            while let Ok(Some((packet, used))) = decoder.decode(&buf) {
                let _ = buf.split_to(used);
                match packet {
                    Packet::Connect(_) => {
                        let _ = tx.send(Packet::ConnAck(ConnAck::default()));
                        connections.send_modify(|n| *n += 1);
                    }
                    Packet::Subscribe(_) if swallow(&reader_state) => {}
                    Packet::Subscribe(subscribe) => {
                        let filters: Vec<String> = subscribe
                            .subscriptions
                            .iter()
                            .map(|s| s.filter.clone())
                            .collect();
                        reader_client.lock().filters.extend(filters.iter().cloned());
                        let _ = tx.send(Packet::SubAck(SubAck {
                            packet_id: subscribe.packet_id,
                            return_codes: vec![0; filters.len()],
                        }));
                        reader_state.subscribes.lock().extend(filters);
                        subscribed.send_modify(|n| *n += 1);
                    }
                    Packet::Publish(publish) => {
                        let _ = published.send(publish);
                    }
                    Packet::PingReq => {
                        let _ = tx.send(Packet::PingResp);
                    }
                    Packet::Disconnect => return,
                    _ => {}
                }
            }
            match reader.read_buf(&mut buf).await {
                Ok(n) if n > 0 => {}
                _ => return,
            }
        }
    });

    client.lock().tasks = vec![read_task, write_task];
    state.clients.lock().push(client);
}

fn swallow(state: &BrokerState) -> bool {
    state
        .swallow_subscribes
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

/// In-memory KNX gateway
pub struct FakeGateway {
    inbound: Mutex<Option<mpsc::Sender<GroupEvent>>>,
    connections: watch::Sender<usize>,
    sent_tx: mpsc::UnboundedSender<GroupEvent>,
    sent_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<GroupEvent>>,
}

impl FakeGateway {
    fn new() -> Arc<Self> {
        let (sent_tx, sent_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            inbound: Mutex::new(None),
            connections: watch::channel(0).0,
            sent_tx,
            sent_rx: tokio::sync::Mutex::new(sent_rx),
        })
    }

    pub async fn wait_connected(&self) {
        let mut rx = self.connections.subscribe();
        timeout(WAIT, rx.wait_for(|n| *n >= 1))
            .await
            .expect("gateway never connected")
            .unwrap();
    }

    /// Telegram from `source` appearing on this gateway's line
    pub async fn inject(&self, command: GroupCommand, source: &str, dest: &str, data: &[u8]) {
        let tx = self.inbound.lock().clone().expect("not connected");
        tx.send(GroupEvent {
            command,
            source: source.parse().unwrap(),
            destination: dest.parse().unwrap(),
            data: data.to_vec(),
        })
        .await
        .unwrap();
    }

    pub async fn next_sent(&self) -> GroupEvent {
        let mut rx = self.sent_rx.lock().await;
        timeout(WAIT, rx.recv()).await.expect("nothing sent").unwrap()
    }

    pub async fn nothing_sent(&self) -> bool {
        let mut rx = self.sent_rx.lock().await;
        timeout(Duration::from_millis(200), rx.recv()).await.is_err()
    }
}

struct FakeSender {
    sent: mpsc::UnboundedSender<GroupEvent>,
}

#[async_trait]
impl BusSender for FakeSender {
    async fn send(&self, event: GroupEvent) -> Result<(), BusError> {
        self.sent
            .send(event)
            .map_err(|_| BusError::ConnectionLost("gone".to_string()))
    }
}

/// [`BusConnector`] handing out [`FakeGateway`] connections by endpoint
pub struct FakeConnector {
    gateways: HashMap<String, Arc<FakeGateway>>,
}

impl FakeConnector {
    pub fn with(names: &[&str]) -> (Arc<Self>, Vec<Arc<FakeGateway>>) {
        let gateways: Vec<Arc<FakeGateway>> = names.iter().map(|_| FakeGateway::new()).collect();
        let connector = FakeConnector {
            gateways: names
                .iter()
                .map(|n| normalize_endpoint(n))
                .zip(gateways.iter().cloned())
                .collect(),
        };
        (Arc::new(connector), gateways)
    }
}

#[async_trait]
impl BusConnector for FakeConnector {
    async fn connect(&self, endpoint: &str) -> Result<BusConnection, BusError> {
        let gateway = self
            .gateways
            .get(endpoint)
            .ok_or_else(|| BusError::ConnectFailed(endpoint.to_string()))?;

        let (tx, rx) = mpsc::channel(16);
        *gateway.inbound.lock() = Some(tx);
        gateway.connections.send_modify(|n| *n += 1);
        Ok(BusConnection {
            inbound: rx,
            sender: Arc::new(FakeSender {
                sent: gateway.sent_tx.clone(),
            }),
        })
    }
}
