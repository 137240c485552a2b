//! KNXnet/IP tunnelling client
//!
//! Opens a data-link-layer tunnel to a gateway over UDP. A driver task per
//! tunnel acknowledges inbound telegrams, transmits outbound ones one at a
//! time (waiting for the gateway's ack, with one repetition), and keeps the
//! tunnel alive with CONNECTIONSTATE heartbeats.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{timeout, Instant};
use tracing::{debug, trace, warn};

use super::cemi::LData;
use super::frame::{Frame, Hpai, STATUS_OK};
use super::{
    normalize_endpoint, BusConnection, BusConnector, BusError, BusSender, GroupEvent,
    IndividualAddr,
};

/// Missed heartbeats before the tunnel is considered dead
const MAX_MISSED_HEARTBEATS: u8 = 3;

/// Tunnelling request transmissions before giving up (first try + one repeat)
const MAX_SEND_ATTEMPTS: u8 = 2;

/// Floor for the heartbeat period
const MIN_HEARTBEAT_INTERVAL: Duration = Duration::from_millis(100);

/// Tunnel timing parameters
#[derive(Debug, Clone)]
pub struct TunnelConfig {
    /// Time allowed for the CONNECT handshake
    pub connect_timeout: Duration,
    /// Interval between CONNECTIONSTATE requests
    pub heartbeat_interval: Duration,
    /// Time to wait for a TUNNELLING_ACK
    pub ack_timeout: Duration,
    /// Capacity of the inbound telegram channel
    pub inbound_capacity: usize,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            heartbeat_interval: Duration::from_secs(60),
            ack_timeout: Duration::from_secs(1),
            inbound_capacity: 64,
        }
    }
}

/// [`BusConnector`] opening KNXnet/IP tunnels
#[derive(Debug, Clone, Default)]
pub struct KnxTunnelConnector {
    config: TunnelConfig,
}

impl KnxTunnelConnector {
    pub fn new(config: TunnelConfig) -> Self {
        Self { config }
    }

    async fn handshake(socket: &UdpSocket) -> Result<(u8, Option<IndividualAddr>), BusError> {
        let mut buf = BytesMut::new();
        Frame::ConnectRequest {
            control: Hpai::route_back(),
            data: Hpai::route_back(),
        }
        .encode(&mut buf);
        socket.send(&buf).await?;

        let mut recv_buf = [0u8; 256];
        loop {
            let n = socket.recv(&mut recv_buf).await?;
            match Frame::decode(&recv_buf[..n]) {
                Ok(Frame::ConnectResponse {
                    channel,
                    status,
                    address,
                }) => {
                    if status != STATUS_OK {
                        return Err(BusError::Rejected(status));
                    }
                    return Ok((channel, address));
                }
                Ok(other) => trace!("Ignoring {:?} during handshake", other),
                Err(e) => trace!("Ignoring undecodable datagram during handshake: {}", e),
            }
        }
    }
}

#[async_trait]
impl BusConnector for KnxTunnelConnector {
    async fn connect(&self, endpoint: &str) -> Result<BusConnection, BusError> {
        let endpoint = normalize_endpoint(endpoint);
        let socket = UdpSocket::bind("0.0.0.0:0").await?;

        let (channel, address) = timeout(self.config.connect_timeout, async {
            socket
                .connect(&endpoint)
                .await
                .map_err(|e| BusError::ConnectFailed(e.to_string()))?;
            Self::handshake(&socket).await
        })
        .await
        .map_err(|_| BusError::Timeout)??;

        debug!(
            "Tunnel {}: Connected (channel={}, address={:?})",
            endpoint, channel, address
        );

        let (inbound_tx, inbound_rx) = mpsc::channel(self.config.inbound_capacity.max(1));
        let (request_tx, request_rx) = mpsc::channel(1);

        let driver = TunnelDriver {
            endpoint,
            socket,
            channel,
            config: self.config.clone(),
            inbound: inbound_tx,
            requests: request_rx,
            send_seq: 0,
            last_recv_seq: None,
            missed_heartbeats: 0,
        };
        tokio::spawn(driver.run());

        Ok(BusConnection {
            inbound: inbound_rx,
            sender: Arc::new(TunnelSender {
                requests: request_tx,
            }),
        })
    }
}

/// Outbound telegram waiting for the driver
struct SendRequest {
    event: GroupEvent,
    done: oneshot::Sender<Result<(), BusError>>,
}

struct TunnelSender {
    requests: mpsc::Sender<SendRequest>,
}

#[async_trait]
impl BusSender for TunnelSender {
    async fn send(&self, event: GroupEvent) -> Result<(), BusError> {
        let (done, result) = oneshot::channel();
        self.requests
            .send(SendRequest { event, done })
            .await
            .map_err(|_| BusError::ConnectionLost("tunnel closed".to_string()))?;
        result
            .await
            .map_err(|_| BusError::ConnectionLost("tunnel closed".to_string()))?
    }
}

/// Tunnelling request in flight
struct Pending {
    seq: u8,
    datagram: Bytes,
    attempts: u8,
    deadline: Instant,
    done: oneshot::Sender<Result<(), BusError>>,
}

enum Flow {
    Continue,
    Stop,
}

struct TunnelDriver {
    endpoint: String,
    socket: UdpSocket,
    channel: u8,
    config: TunnelConfig,
    inbound: mpsc::Sender<GroupEvent>,
    requests: mpsc::Receiver<SendRequest>,
    send_seq: u8,
    last_recv_seq: Option<u8>,
    missed_heartbeats: u8,
}

impl TunnelDriver {
    async fn run(mut self) {
        let mut pending = None;
        match self.drive(&mut pending).await {
            Ok(()) => debug!("Tunnel {}: Closed", self.endpoint),
            Err(e) => warn!("Tunnel {}: {}", self.endpoint, e),
        }

        if let Some(p) = pending.take() {
            let _ = p
                .done
                .send(Err(BusError::ConnectionLost("tunnel closed".to_string())));
        }

        let mut buf = BytesMut::new();
        Frame::DisconnectRequest {
            channel: self.channel,
            control: Hpai::route_back(),
        }
        .encode(&mut buf);
        let _ = self.socket.send(&buf).await;
    }

    async fn drive(&mut self, pending: &mut Option<Pending>) -> Result<(), BusError> {
        let mut recv_buf = vec![0u8; 512];
        let mut heartbeat = tokio::time::interval(
            self.config
                .heartbeat_interval
                .max(MIN_HEARTBEAT_INTERVAL),
        );
        heartbeat.reset();

        loop {
            let ack_deadline = pending.as_ref().map(|p| p.deadline);

            tokio::select! {
                result = self.socket.recv(&mut recv_buf) => {
                    let n = result?;
                    match Frame::decode(&recv_buf[..n]) {
                        Ok(frame) => {
                            if let Flow::Stop = self.handle_frame(frame, pending).await? {
                                return Ok(());
                            }
                        }
                        Err(e) => trace!("Tunnel {}: Dropping datagram: {}", self.endpoint, e),
                    }
                }

                request = self.requests.recv(), if pending.is_none() => {
                    match request {
                        Some(request) => *pending = self.transmit(request).await?,
                        None => return Ok(()),
                    }
                }

                _ = tokio::time::sleep_until(ack_deadline.unwrap_or_else(Instant::now)), if ack_deadline.is_some() => {
                    self.retransmit(pending).await?;
                }

                _ = heartbeat.tick() => {
                    if self.missed_heartbeats >= MAX_MISSED_HEARTBEATS {
                        return Err(BusError::ConnectionLost("heartbeat not answered".to_string()));
                    }
                    self.missed_heartbeats += 1;
                    let mut buf = BytesMut::new();
                    Frame::ConnectionStateRequest {
                        channel: self.channel,
                        control: Hpai::route_back(),
                    }
                    .encode(&mut buf);
                    self.socket.send(&buf).await?;
                }

                _ = self.inbound.closed() => return Ok(()),
            }
        }
    }

    async fn handle_frame(
        &mut self,
        frame: Frame,
        pending: &mut Option<Pending>,
    ) -> Result<Flow, BusError> {
        match frame {
            Frame::TunnellingRequest { channel, seq, cemi } if channel == self.channel => {
                let mut buf = BytesMut::new();
                Frame::TunnellingAck {
                    channel,
                    seq,
                    status: STATUS_OK,
                }
                .encode(&mut buf);
                self.socket.send(&buf).await?;

                if self.last_recv_seq == Some(seq) {
                    trace!("Tunnel {}: Duplicate request seq={}", self.endpoint, seq);
                    return Ok(Flow::Continue);
                }
                self.last_recv_seq = Some(seq);

                match LData::decode(&cemi) {
                    Ok(ldata) if ldata.is_indication() => {
                        // Never stall acks and heartbeats behind a slow consumer
                        match self.inbound.try_send(ldata.event) {
                            Ok(()) => {}
                            Err(mpsc::error::TrySendError::Full(event)) => warn!(
                                "Tunnel {}: Inbound queue full, dropping telegram to {}",
                                self.endpoint, event.destination
                            ),
                            Err(mpsc::error::TrySendError::Closed(_)) => return Ok(Flow::Stop),
                        }
                    }
                    Ok(_) => {}
                    Err(e) => trace!("Tunnel {}: Skipping cEMI frame: {}", self.endpoint, e),
                }
            }
            Frame::TunnellingAck {
                channel,
                seq,
                status,
            } if channel == self.channel => {
                if pending.as_ref().is_some_and(|p| p.seq == seq) {
                    if let Some(p) = pending.take() {
                        self.send_seq = self.send_seq.wrapping_add(1);
                        let result = if status == STATUS_OK {
                            Ok(())
                        } else {
                            Err(BusError::Rejected(status))
                        };
                        let _ = p.done.send(result);
                    }
                }
            }
            Frame::ConnectionStateResponse { channel, status } if channel == self.channel => {
                if status != STATUS_OK {
                    return Err(BusError::ConnectionLost(format!(
                        "connection state status 0x{:02x}",
                        status
                    )));
                }
                self.missed_heartbeats = 0;
            }
            Frame::DisconnectRequest { channel, .. } if channel == self.channel => {
                let mut buf = BytesMut::new();
                Frame::DisconnectResponse {
                    channel,
                    status: STATUS_OK,
                }
                .encode(&mut buf);
                let _ = self.socket.send(&buf).await;
                return Err(BusError::ConnectionLost(
                    "gateway closed the tunnel".to_string(),
                ));
            }
            Frame::DisconnectResponse { channel, .. } if channel == self.channel => {
                return Ok(Flow::Stop);
            }
            other => trace!("Tunnel {}: Ignoring {:?}", self.endpoint, other),
        }
        Ok(Flow::Continue)
    }

    async fn transmit(&mut self, request: SendRequest) -> Result<Option<Pending>, BusError> {
        let event = GroupEvent {
            source: IndividualAddr::default(),
            ..request.event
        };

        let mut cemi = BytesMut::new();
        if let Err(e) = LData::request(event).encode(&mut cemi) {
            // Refuse the telegram but keep the tunnel
            let _ = request.done.send(Err(e.into()));
            return Ok(None);
        }

        let mut buf = BytesMut::new();
        Frame::TunnellingRequest {
            channel: self.channel,
            seq: self.send_seq,
            cemi: cemi.freeze(),
        }
        .encode(&mut buf);
        let datagram = buf.freeze();
        self.socket.send(&datagram).await?;

        Ok(Some(Pending {
            seq: self.send_seq,
            datagram,
            attempts: 1,
            deadline: Instant::now() + self.config.ack_timeout,
            done: request.done,
        }))
    }

    async fn retransmit(&mut self, pending: &mut Option<Pending>) -> Result<(), BusError> {
        let Some(p) = pending.as_mut() else {
            return Ok(());
        };

        if p.attempts >= MAX_SEND_ATTEMPTS {
            if let Some(p) = pending.take() {
                let _ = p.done.send(Err(BusError::Timeout));
            }
            return Err(BusError::ConnectionLost(
                "tunnelling request not acknowledged".to_string(),
            ));
        }

        debug!("Tunnel {}: Repeating request seq={}", self.endpoint, p.seq);
        p.attempts += 1;
        p.deadline = Instant::now() + self.config.ack_timeout;
        self.socket.send(&p.datagram).await?;
        Ok(())
    }
}
