//! Single MQTT broker session
//!
//! A session is one TCP connection to the broker. After the CONNECT/CONNACK
//! handshake a driver task owns the socket: it writes requests coming from
//! the session handle, decodes inbound packets, answers QoS 1 deliveries,
//! matches SUBACKs to pending subscribes and keeps the connection alive with
//! PINGREQ. When the connection ends for any reason the driver flips the
//! `closed` watch and exits; sessions are never revived.

use std::collections::HashMap;
use std::time::Duration;

use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::timeout;
use tracing::{debug, trace, warn};

use super::{Message, MqttError, MqttOptions};
use crate::codec::{Decoder, Encoder, DEFAULT_MAX_PACKET_SIZE};
use crate::protocol::{
    Connect, ConnectReturnCode, Packet, PubAck, Publish, QoS, Subscribe, Subscription,
    SUBACK_FAILURE,
};
use crate::topic::{validate_topic_filter, validate_topic_name};

/// Requests from the session handle to its driver
enum SessionCommand {
    Publish {
        publish: Publish,
        done: oneshot::Sender<Result<(), MqttError>>,
    },
    Subscribe {
        filter: String,
        done: oneshot::Sender<Result<(), MqttError>>,
    },
}

/// Handle to a live broker session
pub struct MqttSession {
    commands: mpsc::Sender<SessionCommand>,
    closed: watch::Receiver<bool>,
}

impl MqttSession {
    /// Dial the broker and complete the CONNECT handshake
    ///
    /// Every PUBLISH received on this session is forwarded to `inbound`.
    pub async fn connect(
        options: &MqttOptions,
        inbound: mpsc::UnboundedSender<Message>,
    ) -> Result<Self, MqttError> {
        let address = options.address();

        let (reader, writer, buffered) = timeout(options.connect_timeout, async {
            let stream = TcpStream::connect(&address)
                .await
                .map_err(|e| MqttError::ConnectFailed(format!("{}: {}", address, e)))?;
            let _ = stream.set_nodelay(true);
            handshake(stream, options).await
        })
        .await
        .map_err(|_| MqttError::Timeout)??;

        debug!("MQTT {}: Connected as '{}'", address, options.client_id);

        let (command_tx, command_rx) = mpsc::channel(16);
        let (closed_tx, closed_rx) = watch::channel(false);

        let driver = SessionDriver {
            address,
            reader,
            writer,
            read_buf: buffered,
            encoder: Encoder::new(),
            decoder: Decoder::new().with_max_packet_size(DEFAULT_MAX_PACKET_SIZE),
            commands: command_rx,
            inbound,
            pending_subacks: HashMap::new(),
            next_packet_id: 1,
            keep_alive: options.keep_alive,
            awaiting_pingresp: false,
        };

        tokio::spawn(async move {
            driver.run().await;
            let _ = closed_tx.send(true);
        });

        Ok(Self {
            commands: command_tx,
            closed: closed_rx,
        })
    }

    /// Publish a QoS 0 message
    pub async fn publish(
        &self,
        topic: &str,
        payload: Bytes,
        retain: bool,
    ) -> Result<(), MqttError> {
        validate_topic_name(topic).map_err(MqttError::InvalidTopic)?;

        let publish = Publish {
            retain,
            topic: topic.to_string(),
            payload,
            ..Default::default()
        };
        let (done, result) = oneshot::channel();
        self.request(SessionCommand::Publish { publish, done }, result)
            .await
    }

    /// Subscribe to a filter and wait for the broker's SUBACK
    pub async fn subscribe(&self, filter: &str) -> Result<(), MqttError> {
        validate_topic_filter(filter).map_err(MqttError::InvalidTopic)?;

        let (done, result) = oneshot::channel();
        let command = SessionCommand::Subscribe {
            filter: filter.to_string(),
            done,
        };
        self.request(command, result).await
    }

    async fn request(
        &self,
        command: SessionCommand,
        result: oneshot::Receiver<Result<(), MqttError>>,
    ) -> Result<(), MqttError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| MqttError::ConnectionLost("session closed".to_string()))?;
        result
            .await
            .map_err(|_| MqttError::ConnectionLost("session closed".to_string()))?
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Watch that turns `true` once the connection is gone
    pub fn closed(&self) -> watch::Receiver<bool> {
        self.closed.clone()
    }
}

/// Send CONNECT and wait for CONNACK
///
/// Returns the split stream and any bytes read past the CONNACK.
async fn handshake(
    stream: TcpStream,
    options: &MqttOptions,
) -> Result<(OwnedReadHalf, OwnedWriteHalf, BytesMut), MqttError> {
    let (mut reader, mut writer) = stream.into_split();

    let connect = Packet::Connect(Connect {
        client_id: options.client_id.clone(),
        clean_session: true,
        keep_alive: options.keep_alive,
        username: None,
        password: None,
    });
    let mut buf = BytesMut::new();
    Encoder::new().encode(&connect, &mut buf)?;
    writer.write_all(&buf).await?;

    let decoder = Decoder::new();
    let mut read_buf = BytesMut::with_capacity(1024);
    loop {
        if reader.read_buf(&mut read_buf).await? == 0 {
            return Err(MqttError::ConnectionLost(
                "closed before CONNACK".to_string(),
            ));
        }
        if let Some((packet, used)) = decoder.decode(&read_buf)? {
            read_buf.advance(used);
            return match packet {
                Packet::ConnAck(connack) if connack.return_code == ConnectReturnCode::Accepted => {
                    Ok((reader, writer, read_buf))
                }
                Packet::ConnAck(connack) => Err(MqttError::Rejected(connack.return_code)),
                other => Err(MqttError::ConnectFailed(format!(
                    "expected CONNACK, got packet type {}",
                    other.packet_type()
                ))),
            };
        }
    }
}

struct SessionDriver {
    address: String,
    reader: OwnedReadHalf,
    writer: OwnedWriteHalf,
    read_buf: BytesMut,
    encoder: Encoder,
    decoder: Decoder,
    commands: mpsc::Receiver<SessionCommand>,
    inbound: mpsc::UnboundedSender<Message>,
    pending_subacks: HashMap<u16, (String, oneshot::Sender<Result<(), MqttError>>)>,
    next_packet_id: u16,
    keep_alive: u16,
    awaiting_pingresp: bool,
}

impl SessionDriver {
    async fn run(mut self) {
        match self.drive().await {
            Ok(()) => debug!("MQTT {}: Session closed", self.address),
            Err(e) => warn!("MQTT {}: {}", self.address, e),
        }

        for (_, (_, done)) in self.pending_subacks.drain() {
            let _ = done.send(Err(MqttError::ConnectionLost(
                "session closed".to_string(),
            )));
        }

        let mut buf = BytesMut::new();
        if self.encoder.encode(&Packet::Disconnect, &mut buf).is_ok() {
            let _ = self.writer.write_all(&buf).await;
        }
    }

    async fn drive(&mut self) -> Result<(), MqttError> {
        // Packets that arrived together with the CONNACK
        self.process_read_buf().await?;

        let period = Duration::from_secs(self.keep_alive.max(1) as u64);
        let mut keepalive_timer = tokio::time::interval(period);
        keepalive_timer.reset();

        loop {
            tokio::select! {
                command = self.commands.recv() => {
                    match command {
                        Some(command) => self.handle_command(command).await?,
                        // Handle dropped
                        None => return Ok(()),
                    }
                }

                result = self.reader.read_buf(&mut self.read_buf) => {
                    if result? == 0 {
                        return Err(MqttError::ConnectionLost(
                            "connection closed by broker".to_string(),
                        ));
                    }
                    self.process_read_buf().await?;
                }

                _ = keepalive_timer.tick(), if self.keep_alive > 0 => {
                    if self.awaiting_pingresp {
                        return Err(MqttError::ConnectionLost("keep-alive timeout".to_string()));
                    }
                    self.awaiting_pingresp = true;
                    self.write_packet(&Packet::PingReq).await?;
                }
            }
        }
    }

    async fn handle_command(&mut self, command: SessionCommand) -> Result<(), MqttError> {
        match command {
            SessionCommand::Publish { publish, done } => {
                let mut buf = BytesMut::new();
                if let Err(e) = self.encoder.encode(&Packet::Publish(publish), &mut buf) {
                    let _ = done.send(Err(e.into()));
                    return Ok(());
                }
                let result = self.writer.write_all(&buf).await;
                let failed = result.is_err();
                let _ = done.send(result.map_err(MqttError::from));
                if failed {
                    return Err(MqttError::ConnectionLost("write failed".to_string()));
                }
            }
            SessionCommand::Subscribe { filter, done } => {
                let packet_id = self.allocate_packet_id();
                let subscribe = Packet::Subscribe(Subscribe {
                    packet_id,
                    subscriptions: vec![Subscription {
                        filter: filter.clone(),
                        qos: QoS::AtMostOnce,
                    }],
                });
                self.write_packet(&subscribe).await?;
                trace!("MQTT {}: SUBSCRIBE {} (id={})", self.address, filter, packet_id);
                self.pending_subacks.insert(packet_id, (filter, done));
            }
        }
        Ok(())
    }

    async fn process_read_buf(&mut self) -> Result<(), MqttError> {
        while let Some((packet, used)) = self.decoder.decode(&self.read_buf)? {
            self.read_buf.advance(used);
            self.handle_packet(packet).await?;
        }
        Ok(())
    }

    async fn handle_packet(&mut self, packet: Packet) -> Result<(), MqttError> {
        match packet {
            Packet::Publish(publish) => {
                if publish.qos == QoS::AtLeastOnce {
                    if let Some(packet_id) = publish.packet_id {
                        self.write_packet(&Packet::PubAck(PubAck { packet_id }))
                            .await?;
                    }
                }
                let _ = self.inbound.send(Message {
                    topic: publish.topic,
                    payload: publish.payload,
                    retain: publish.retain,
                });
            }
            Packet::SubAck(suback) => match self.pending_subacks.remove(&suback.packet_id) {
                Some((filter, done)) => {
                    let result = if suback.return_codes.contains(&SUBACK_FAILURE) {
                        Err(MqttError::SubscribeRefused(filter))
                    } else {
                        Ok(())
                    };
                    let _ = done.send(result);
                }
                None => trace!(
                    "MQTT {}: SUBACK for unknown id {}",
                    self.address,
                    suback.packet_id
                ),
            },
            Packet::PingResp => self.awaiting_pingresp = false,
            Packet::PubAck(_) => {}
            Packet::Disconnect => {
                return Err(MqttError::ConnectionLost(
                    "broker sent DISCONNECT".to_string(),
                ))
            }
            other => trace!(
                "MQTT {}: Ignoring packet type {}",
                self.address,
                other.packet_type()
            ),
        }
        Ok(())
    }

    async fn write_packet(&mut self, packet: &Packet) -> Result<(), MqttError> {
        let mut buf = BytesMut::new();
        self.encoder.encode(packet, &mut buf)?;
        self.writer.write_all(&buf).await?;
        Ok(())
    }

    fn allocate_packet_id(&mut self) -> u16 {
        let id = self.next_packet_id;
        self.next_packet_id = self.next_packet_id.checked_add(1).unwrap_or(1);
        id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ConnAck, SubAck};
    use tokio::net::TcpListener;

    /// Accept one client and answer its CONNECT with the given code
    async fn accept(listener: &TcpListener, code: ConnectReturnCode) -> (TcpStream, Connect) {
        let (mut stream, _) = listener.accept().await.unwrap();
        let packet = read_packet(&mut stream).await;
        let Packet::Connect(connect) = packet else {
            panic!("Expected CONNECT, got {:?}", packet);
        };
        write_packet(
            &mut stream,
            Packet::ConnAck(ConnAck {
                session_present: false,
                return_code: code,
            }),
        )
        .await;
        (stream, connect)
    }

    async fn read_packet(stream: &mut TcpStream) -> Packet {
        let mut buf = BytesMut::new();
        loop {
            if let Some((packet, _)) = Decoder::new().decode(&buf).unwrap() {
                return packet;
            }
            let n = timeout(Duration::from_secs(2), stream.read_buf(&mut buf))
                .await
                .expect("read timed out")
                .unwrap();
            assert!(n > 0, "client closed the connection");
        }
    }

    async fn write_packet(stream: &mut TcpStream, packet: Packet) {
        let mut buf = BytesMut::new();
        Encoder::new().encode(&packet, &mut buf).unwrap();
        stream.write_all(&buf).await.unwrap();
    }

    async fn listener() -> (TcpListener, MqttOptions) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let options = MqttOptions::new(listener.local_addr().unwrap().to_string(), "test-client");
        (listener, options)
    }

    #[tokio::test]
    async fn test_connect_and_publish() {
        let (listener, options) = listener().await;
        let (tx, _rx) = mpsc::unbounded_channel();

        let (session, (mut stream, connect)) = tokio::join!(
            MqttSession::connect(&options, tx),
            accept(&listener, ConnectReturnCode::Accepted)
        );
        let session = session.unwrap();
        assert_eq!(connect.client_id, "test-client");
        assert_eq!(connect.keep_alive, 60);

        session
            .publish("knx/1/2/3", Bytes::from_static(b"{}"), true)
            .await
            .unwrap();

        match read_packet(&mut stream).await {
            Packet::Publish(publish) => {
                assert_eq!(publish.topic, "knx/1/2/3");
                assert!(publish.retain);
                assert_eq!(publish.qos, QoS::AtMostOnce);
            }
            other => panic!("Expected PUBLISH, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_connect_rejected() {
        let (listener, options) = listener().await;
        let (tx, _rx) = mpsc::unbounded_channel();

        let (session, _) = tokio::join!(
            MqttSession::connect(&options, tx),
            accept(&listener, ConnectReturnCode::NotAuthorized)
        );
        assert!(matches!(
            session,
            Err(MqttError::Rejected(ConnectReturnCode::NotAuthorized))
        ));
    }

    #[tokio::test]
    async fn test_connect_timeout() {
        let (listener, mut options) = listener().await;
        options.connect_timeout = Duration::from_millis(100);
        let (tx, _rx) = mpsc::unbounded_channel();

        // Accepts TCP but never sends CONNACK
        let _hold = listener;
        let result = MqttSession::connect(&options, tx).await;
        assert!(matches!(result, Err(MqttError::Timeout)));
    }

    #[tokio::test]
    async fn test_subscribe_and_receive() {
        let (listener, options) = listener().await;
        let (tx, mut rx) = mpsc::unbounded_channel();

        let (session, (mut stream, _)) = tokio::join!(
            MqttSession::connect(&options, tx),
            accept(&listener, ConnectReturnCode::Accepted)
        );
        let session = session.unwrap();

        let broker = async {
            let Packet::Subscribe(subscribe) = read_packet(&mut stream).await else {
                panic!("Expected SUBSCRIBE");
            };
            assert_eq!(subscribe.subscriptions[0].filter, "knx/cmd");
            write_packet(
                &mut stream,
                Packet::SubAck(SubAck {
                    packet_id: subscribe.packet_id,
                    return_codes: vec![0],
                }),
            )
            .await;
        };
        let (result, _) = tokio::join!(session.subscribe("knx/cmd"), broker);
        result.unwrap();

        write_packet(
            &mut stream,
            Packet::Publish(Publish {
                qos: QoS::AtLeastOnce,
                topic: "knx/cmd".to_string(),
                packet_id: Some(9),
                payload: Bytes::from_static(b"hello"),
                ..Default::default()
            }),
        )
        .await;

        let message = rx.recv().await.unwrap();
        assert_eq!(message.topic, "knx/cmd");
        assert_eq!(message.payload, Bytes::from_static(b"hello"));
        assert_eq!(
            read_packet(&mut stream).await,
            Packet::PubAck(PubAck { packet_id: 9 })
        );
    }

    #[tokio::test]
    async fn test_refused_subscription() {
        let (listener, options) = listener().await;
        let (tx, _rx) = mpsc::unbounded_channel();

        let (session, (mut stream, _)) = tokio::join!(
            MqttSession::connect(&options, tx),
            accept(&listener, ConnectReturnCode::Accepted)
        );
        let session = session.unwrap();

        let broker = async {
            let Packet::Subscribe(subscribe) = read_packet(&mut stream).await else {
                panic!("Expected SUBSCRIBE");
            };
            write_packet(
                &mut stream,
                Packet::SubAck(SubAck {
                    packet_id: subscribe.packet_id,
                    return_codes: vec![SUBACK_FAILURE],
                }),
            )
            .await;
        };
        let (result, _) = tokio::join!(session.subscribe("secret/#"), broker);
        assert!(matches!(result, Err(MqttError::SubscribeRefused(f)) if f == "secret/#"));
    }

    #[tokio::test]
    async fn test_closed_when_broker_goes_away() {
        let (listener, options) = listener().await;
        let (tx, _rx) = mpsc::unbounded_channel();

        let (session, (stream, _)) = tokio::join!(
            MqttSession::connect(&options, tx),
            accept(&listener, ConnectReturnCode::Accepted)
        );
        let session = session.unwrap();
        assert!(!session.is_closed());

        drop(stream);
        let mut closed = session.closed();
        timeout(Duration::from_secs(2), closed.wait_for(|c| *c))
            .await
            .unwrap()
            .unwrap();
        assert!(session.is_closed());
        assert!(session
            .publish("knx/0/0/1", Bytes::new(), false)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_invalid_topic_rejected_locally() {
        let (listener, options) = listener().await;
        let (tx, _rx) = mpsc::unbounded_channel();

        let (session, _conn) = tokio::join!(
            MqttSession::connect(&options, tx),
            accept(&listener, ConnectReturnCode::Accepted)
        );
        let session = session.unwrap();
        assert!(matches!(
            session.publish("knx/+", Bytes::new(), false).await,
            Err(MqttError::InvalidTopic(_))
        ));
    }
}
