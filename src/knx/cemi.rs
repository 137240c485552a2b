//! cEMI L_Data frames
//!
//! Only the group-value services (Read, Response, Write) are understood.
//! Payloads follow the short-data convention: the first byte of
//! [`GroupEvent::data`] holds the 6 bits packed into the APCI octet, any
//! further bytes follow it on the wire.

use bytes::{BufMut, BytesMut};

use super::address::{GroupAddr, IndividualAddr};
use super::{FrameError, GroupCommand, GroupEvent};

/// cEMI message codes
pub const L_DATA_REQ: u8 = 0x11;
pub const L_DATA_CON: u8 = 0x2E;
pub const L_DATA_IND: u8 = 0x29;

/// Standard frame, no repeat, broadcast, low priority
const DEFAULT_CTRL1: u8 = 0xBC;
/// Group destination, hop count 6
const DEFAULT_CTRL2: u8 = 0xE0;

/// APCI codes for group-value services
const APCI_READ: u8 = 0b0000;
const APCI_RESPONSE: u8 = 0b0001;
const APCI_WRITE: u8 = 0b0010;

/// A decoded L_Data frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LData {
    pub message_code: u8,
    pub event: GroupEvent,
}

impl LData {
    /// Build an L_Data.req for an outbound group event
    pub fn request(event: GroupEvent) -> Self {
        Self {
            message_code: L_DATA_REQ,
            event,
        }
    }

    pub fn is_indication(&self) -> bool {
        self.message_code == L_DATA_IND
    }

    pub fn encode(&self, buf: &mut BytesMut) -> Result<(), FrameError> {
        let event = &self.event;
        let short = event.data.first().copied().unwrap_or(0);
        let extra = event.data.get(1..).unwrap_or(&[]);
        if extra.len() > 253 {
            return Err(FrameError::PayloadTooLarge(event.data.len()));
        }

        let apci = match event.command {
            GroupCommand::Read => APCI_READ,
            GroupCommand::Response => APCI_RESPONSE,
            GroupCommand::Write => APCI_WRITE,
        };

        buf.put_u8(self.message_code);
        buf.put_u8(0); // no additional info
        buf.put_u8(DEFAULT_CTRL1);
        buf.put_u8(DEFAULT_CTRL2);
        buf.put_u16(event.source.raw());
        buf.put_u16(event.destination.raw());
        buf.put_u8(1 + extra.len() as u8);
        buf.put_u8((apci >> 2) & 0x03);
        buf.put_u8(((apci & 0x03) << 6) | (short & 0x3F));
        buf.put_slice(extra);
        Ok(())
    }

    pub fn decode(buf: &[u8]) -> Result<Self, FrameError> {
        if buf.len() < 2 {
            return Err(FrameError::Truncated);
        }
        let message_code = buf[0];
        if !matches!(message_code, L_DATA_REQ | L_DATA_CON | L_DATA_IND) {
            return Err(FrameError::UnsupportedMessageCode(message_code));
        }

        let info_len = buf[1] as usize;
        let body = buf.get(2 + info_len..).ok_or(FrameError::Truncated)?;
        // ctrl1, ctrl2, src, dst, npdu length, tpci, apci
        if body.len() < 9 {
            return Err(FrameError::Truncated);
        }

        let ctrl2 = body[1];
        if ctrl2 & 0x80 == 0 {
            return Err(FrameError::NotGroupAddressed);
        }

        let source = IndividualAddr::new(u16::from_be_bytes([body[2], body[3]]));
        let destination = GroupAddr::new(u16::from_be_bytes([body[4], body[5]]));
        let npdu_len = body[6] as usize;
        let tpdu = body.get(7..8 + npdu_len).ok_or(FrameError::Truncated)?;
        if tpdu.len() < 2 {
            return Err(FrameError::Truncated);
        }

        let apci = ((tpdu[0] & 0x03) << 2) | (tpdu[1] >> 6);
        let command = match apci {
            APCI_READ => GroupCommand::Read,
            APCI_RESPONSE => GroupCommand::Response,
            APCI_WRITE => GroupCommand::Write,
            other => return Err(FrameError::UnsupportedApci(other)),
        };

        let mut data = Vec::with_capacity(tpdu.len() - 1);
        data.push(tpdu[1] & 0x3F);
        data.extend_from_slice(&tpdu[2..]);

        Ok(Self {
            message_code,
            event: GroupEvent {
                command,
                source,
                destination,
                data,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_event(data: Vec<u8>) -> GroupEvent {
        GroupEvent {
            command: GroupCommand::Write,
            source: "1.1.10".parse().unwrap(),
            destination: "1/2/3".parse().unwrap(),
            data,
        }
    }

    #[test]
    fn test_encode_short_write() {
        let mut buf = BytesMut::new();
        LData::request(write_event(vec![1])).encode(&mut buf).unwrap();
        assert_eq!(
            &buf[..],
            &[0x11, 0x00, 0xBC, 0xE0, 0x11, 0x0A, 0x0A, 0x03, 0x01, 0x00, 0x81]
        );
    }

    #[test]
    fn test_encode_long_write() {
        let mut buf = BytesMut::new();
        LData::request(write_event(vec![0, 0x0C, 0x1A]))
            .encode(&mut buf)
            .unwrap();
        assert_eq!(&buf[8..], &[0x03, 0x00, 0x80, 0x0C, 0x1A]);
    }

    #[test]
    fn test_decode_indication_with_additional_info() {
        let frame = [
            0x29, 0x02, 0xAA, 0xBB, 0xBC, 0xE0, 0x11, 0x0A, 0x0A, 0x03, 0x03, 0x00, 0x40, 0x0C,
            0x1A,
        ];
        let ldata = LData::decode(&frame).unwrap();
        assert!(ldata.is_indication());
        assert_eq!(ldata.event.command, GroupCommand::Response);
        assert_eq!(ldata.event.source.to_string(), "1.1.10");
        assert_eq!(ldata.event.destination.to_string(), "1/2/3");
        assert_eq!(ldata.event.data, vec![0x00, 0x0C, 0x1A]);
    }

    #[test]
    fn test_decode_read() {
        let frame = [0x29, 0x00, 0xBC, 0xE0, 0x11, 0x0A, 0x0A, 0x03, 0x01, 0x00, 0x00];
        let ldata = LData::decode(&frame).unwrap();
        assert_eq!(ldata.event.command, GroupCommand::Read);
        assert_eq!(ldata.event.data, vec![0]);
    }

    #[test]
    fn test_decode_rejects_individual_destination() {
        let frame = [0x29, 0x00, 0xBC, 0x60, 0x11, 0x0A, 0x11, 0x01, 0x01, 0x00, 0x81];
        assert_eq!(LData::decode(&frame), Err(FrameError::NotGroupAddressed));
    }

    #[test]
    fn test_decode_truncated() {
        let frame = [0x29, 0x00, 0xBC, 0xE0, 0x11, 0x0A, 0x0A, 0x03, 0x03, 0x00, 0x80];
        assert_eq!(LData::decode(&frame), Err(FrameError::Truncated));
    }
}
