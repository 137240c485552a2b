//! KNXnet/IP frames used by the tunnelling client
//!
//! Every frame starts with the 6-byte header
//! `[0x06, 0x10, service_type (u16), total_length (u16)]`.

use std::net::{Ipv4Addr, SocketAddrV4};

use bytes::{BufMut, Bytes, BytesMut};

use super::address::IndividualAddr;
use super::FrameError;

const HEADER_LEN: u8 = 0x06;
const PROTOCOL_VERSION: u8 = 0x10;
const HPAI_LEN: u8 = 0x08;
const HPAI_UDP: u8 = 0x01;
const CONNECTION_HEADER_LEN: u8 = 0x04;

/// CRI: tunnel connection on the data link layer
const TUNNEL_CONNECTION: u8 = 0x04;
const TUNNEL_LINKLAYER: u8 = 0x02;

pub const CONNECT_REQUEST: u16 = 0x0205;
pub const CONNECT_RESPONSE: u16 = 0x0206;
pub const CONNECTIONSTATE_REQUEST: u16 = 0x0207;
pub const CONNECTIONSTATE_RESPONSE: u16 = 0x0208;
pub const DISCONNECT_REQUEST: u16 = 0x0209;
pub const DISCONNECT_RESPONSE: u16 = 0x020A;
pub const TUNNELLING_REQUEST: u16 = 0x0420;
pub const TUNNELLING_ACK: u16 = 0x0421;

/// Status code for a successful response
pub const STATUS_OK: u8 = 0x00;

/// Host Protocol Address Information (UDP endpoint)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Hpai(pub SocketAddrV4);

impl Hpai {
    /// `0.0.0.0:0` asks the gateway to answer to the datagram's source address
    pub fn route_back() -> Self {
        Self(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0))
    }

    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(HPAI_LEN);
        buf.put_u8(HPAI_UDP);
        buf.put_slice(&self.0.ip().octets());
        buf.put_u16(self.0.port());
    }

    fn decode(buf: &[u8]) -> Result<Self, FrameError> {
        if buf.len() < HPAI_LEN as usize || buf[0] != HPAI_LEN {
            return Err(FrameError::Truncated);
        }
        let ip = Ipv4Addr::new(buf[2], buf[3], buf[4], buf[5]);
        let port = u16::from_be_bytes([buf[6], buf[7]]);
        Ok(Self(SocketAddrV4::new(ip, port)))
    }
}

/// KNXnet/IP frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    ConnectRequest {
        control: Hpai,
        data: Hpai,
    },
    ConnectResponse {
        channel: u8,
        status: u8,
        /// Tunnel address assigned by the gateway
        address: Option<IndividualAddr>,
    },
    ConnectionStateRequest {
        channel: u8,
        control: Hpai,
    },
    ConnectionStateResponse {
        channel: u8,
        status: u8,
    },
    DisconnectRequest {
        channel: u8,
        control: Hpai,
    },
    DisconnectResponse {
        channel: u8,
        status: u8,
    },
    TunnellingRequest {
        channel: u8,
        seq: u8,
        cemi: Bytes,
    },
    TunnellingAck {
        channel: u8,
        seq: u8,
        status: u8,
    },
}

impl Frame {
    pub fn service_type(&self) -> u16 {
        match self {
            Frame::ConnectRequest { .. } => CONNECT_REQUEST,
            Frame::ConnectResponse { .. } => CONNECT_RESPONSE,
            Frame::ConnectionStateRequest { .. } => CONNECTIONSTATE_REQUEST,
            Frame::ConnectionStateResponse { .. } => CONNECTIONSTATE_RESPONSE,
            Frame::DisconnectRequest { .. } => DISCONNECT_REQUEST,
            Frame::DisconnectResponse { .. } => DISCONNECT_RESPONSE,
            Frame::TunnellingRequest { .. } => TUNNELLING_REQUEST,
            Frame::TunnellingAck { .. } => TUNNELLING_ACK,
        }
    }

    /// Encode the frame including its header
    pub fn encode(&self, buf: &mut BytesMut) {
        let mut body = BytesMut::with_capacity(32);
        match self {
            Frame::ConnectRequest { control, data } => {
                control.encode(&mut body);
                data.encode(&mut body);
                body.put_u8(0x04);
                body.put_u8(TUNNEL_CONNECTION);
                body.put_u8(TUNNEL_LINKLAYER);
                body.put_u8(0x00);
            }
            Frame::ConnectResponse {
                channel,
                status,
                address,
            } => {
                body.put_u8(*channel);
                body.put_u8(*status);
                if let Some(address) = address {
                    Hpai::route_back().encode(&mut body);
                    body.put_u8(0x04);
                    body.put_u8(TUNNEL_CONNECTION);
                    body.put_u16(address.raw());
                }
            }
            Frame::ConnectionStateRequest { channel, control }
            | Frame::DisconnectRequest { channel, control } => {
                body.put_u8(*channel);
                body.put_u8(0x00);
                control.encode(&mut body);
            }
            Frame::ConnectionStateResponse { channel, status }
            | Frame::DisconnectResponse { channel, status } => {
                body.put_u8(*channel);
                body.put_u8(*status);
            }
            Frame::TunnellingRequest { channel, seq, cemi } => {
                body.put_u8(CONNECTION_HEADER_LEN);
                body.put_u8(*channel);
                body.put_u8(*seq);
                body.put_u8(0x00);
                body.put_slice(cemi);
            }
            Frame::TunnellingAck {
                channel,
                seq,
                status,
            } => {
                body.put_u8(CONNECTION_HEADER_LEN);
                body.put_u8(*channel);
                body.put_u8(*seq);
                body.put_u8(*status);
            }
        }

        buf.put_u8(HEADER_LEN);
        buf.put_u8(PROTOCOL_VERSION);
        buf.put_u16(self.service_type());
        buf.put_u16(HEADER_LEN as u16 + body.len() as u16);
        buf.put_slice(&body);
    }

    /// Decode one datagram
    pub fn decode(buf: &[u8]) -> Result<Self, FrameError> {
        if buf.len() < HEADER_LEN as usize {
            return Err(FrameError::Truncated);
        }
        if buf[0] != HEADER_LEN || buf[1] != PROTOCOL_VERSION {
            return Err(FrameError::InvalidHeader);
        }
        let service_type = u16::from_be_bytes([buf[2], buf[3]]);
        let total_len = u16::from_be_bytes([buf[4], buf[5]]) as usize;
        if total_len < HEADER_LEN as usize {
            return Err(FrameError::InvalidHeader);
        }
        let body = buf
            .get(HEADER_LEN as usize..total_len)
            .ok_or(FrameError::Truncated)?;

        let frame = match service_type {
            CONNECT_REQUEST => {
                let control = Hpai::decode(body)?;
                let data = Hpai::decode(body.get(8..).ok_or(FrameError::Truncated)?)?;
                Frame::ConnectRequest { control, data }
            }
            CONNECT_RESPONSE => {
                let (channel, status) = channel_and_status(body)?;
                // HPAI (8) + CRD (4) follow on success
                let address = match body.get(12..14) {
                    Some(ia) if status == STATUS_OK => {
                        Some(IndividualAddr::new(u16::from_be_bytes([ia[0], ia[1]])))
                    }
                    _ => None,
                };
                Frame::ConnectResponse {
                    channel,
                    status,
                    address,
                }
            }
            CONNECTIONSTATE_REQUEST | DISCONNECT_REQUEST => {
                let (channel, _) = channel_and_status(body)?;
                let control = Hpai::decode(&body[2..])?;
                if service_type == CONNECTIONSTATE_REQUEST {
                    Frame::ConnectionStateRequest { channel, control }
                } else {
                    Frame::DisconnectRequest { channel, control }
                }
            }
            CONNECTIONSTATE_RESPONSE => {
                let (channel, status) = channel_and_status(body)?;
                Frame::ConnectionStateResponse { channel, status }
            }
            DISCONNECT_RESPONSE => {
                let (channel, status) = channel_and_status(body)?;
                Frame::DisconnectResponse { channel, status }
            }
            TUNNELLING_REQUEST => {
                let header = connection_header(body)?;
                Frame::TunnellingRequest {
                    channel: header[1],
                    seq: header[2],
                    cemi: Bytes::copy_from_slice(&body[header[0] as usize..]),
                }
            }
            TUNNELLING_ACK => {
                let header = connection_header(body)?;
                Frame::TunnellingAck {
                    channel: header[1],
                    seq: header[2],
                    status: header[3],
                }
            }
            other => return Err(FrameError::UnsupportedService(other)),
        };

        Ok(frame)
    }
}

fn channel_and_status(body: &[u8]) -> Result<(u8, u8), FrameError> {
    match body {
        [channel, status, ..] => Ok((*channel, *status)),
        _ => Err(FrameError::Truncated),
    }
}

fn connection_header(body: &[u8]) -> Result<&[u8], FrameError> {
    if body.len() < CONNECTION_HEADER_LEN as usize || body[0] < CONNECTION_HEADER_LEN {
        return Err(FrameError::Truncated);
    }
    body.get(..body[0] as usize).ok_or(FrameError::Truncated)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encoded(frame: &Frame) -> Vec<u8> {
        let mut buf = BytesMut::new();
        frame.encode(&mut buf);
        buf.to_vec()
    }

    #[test]
    fn test_connect_request_layout() {
        let bytes = encoded(&Frame::ConnectRequest {
            control: Hpai::route_back(),
            data: Hpai::route_back(),
        });
        assert_eq!(bytes.len(), 26);
        assert_eq!(&bytes[..6], &[0x06, 0x10, 0x02, 0x05, 0x00, 0x1A]);
        assert_eq!(&bytes[22..], &[0x04, 0x04, 0x02, 0x00]);
    }

    #[test]
    fn test_decode_connect_response() {
        let datagram = [
            0x06, 0x10, 0x02, 0x06, 0x00, 0x14, 0x15, 0x00, 0x08, 0x01, 0xC0, 0xA8, 0x01, 0x0B,
            0x0E, 0x57, 0x04, 0x04, 0x11, 0xFF,
        ];
        assert_eq!(
            Frame::decode(&datagram).unwrap(),
            Frame::ConnectResponse {
                channel: 0x15,
                status: STATUS_OK,
                address: Some("1.1.255".parse().unwrap()),
            }
        );
    }

    #[test]
    fn test_decode_connect_response_error() {
        let datagram = [0x06, 0x10, 0x02, 0x06, 0x00, 0x08, 0x00, 0x24];
        assert_eq!(
            Frame::decode(&datagram).unwrap(),
            Frame::ConnectResponse {
                channel: 0,
                status: 0x24,
                address: None,
            }
        );
    }

    #[test]
    fn test_tunnelling_request_decode() {
        let frame = Frame::TunnellingRequest {
            channel: 7,
            seq: 42,
            cemi: Bytes::from_static(&[0x29, 0x00, 0xBC]),
        };
        let bytes = encoded(&frame);
        assert_eq!(&bytes[..6], &[0x06, 0x10, 0x04, 0x20, 0x00, 0x0D]);
        assert_eq!(Frame::decode(&bytes).unwrap(), frame);
    }

    #[test]
    fn test_tunnelling_ack_decode() {
        let datagram = [0x06, 0x10, 0x04, 0x21, 0x00, 0x0A, 0x04, 0x07, 0x2A, 0x00];
        assert_eq!(
            Frame::decode(&datagram).unwrap(),
            Frame::TunnellingAck {
                channel: 7,
                seq: 42,
                status: STATUS_OK,
            }
        );
    }

    #[test]
    fn test_decode_rejects_bad_header() {
        assert_eq!(
            Frame::decode(&[0x06, 0x20, 0x04, 0x21, 0x00, 0x06]),
            Err(FrameError::InvalidHeader)
        );
        assert_eq!(
            Frame::decode(&[0x06, 0x10, 0x04, 0x21, 0x00, 0x0A, 0x04]),
            Err(FrameError::Truncated)
        );
        assert_eq!(
            Frame::decode(&[0x06, 0x10, 0x05, 0x30, 0x00, 0x06]),
            Err(FrameError::UnsupportedService(0x0530))
        );
    }
}
