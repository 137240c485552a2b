//! MQTT Codec Tests

use bytes::{Bytes, BytesMut};
use pretty_assertions::assert_eq;

use crate::codec::{Decoder, Encoder};
use crate::protocol::{
    ConnAck, Connect, ConnectReturnCode, DecodeError, EncodeError, Packet, PubAck, Publish, QoS,
    SubAck, Subscribe, Subscription, SUBACK_FAILURE,
};

fn encode_packet(packet: &Packet) -> BytesMut {
    let mut buf = BytesMut::new();
    Encoder::new().encode(packet, &mut buf).unwrap();
    buf
}

fn decode_packet(buf: &[u8]) -> Result<Packet, DecodeError> {
    match Decoder::new().decode(buf)? {
        Some((packet, consumed)) => {
            assert_eq!(consumed, buf.len());
            Ok(packet)
        }
        None => Err(DecodeError::InsufficientData),
    }
}

#[test]
fn test_connect_bytes() {
    let packet = Packet::Connect(Connect {
        client_id: "knx".to_string(),
        keep_alive: 60,
        ..Default::default()
    });

    let encoded = encode_packet(&packet);
    assert_eq!(
        &encoded[..],
        &[
            0x10, 0x0F, // fixed header
            0x00, 0x04, b'M', b'Q', b'T', b'T', // protocol name
            0x04, // level
            0x02, // clean session
            0x00, 0x3C, // keep alive
            0x00, 0x03, b'k', b'n', b'x',
        ]
    );
    assert_eq!(decode_packet(&encoded).unwrap(), packet);
}

#[test]
fn test_connect_with_credentials() {
    let packet = Packet::Connect(Connect {
        client_id: "bridge".to_string(),
        clean_session: true,
        keep_alive: 30,
        username: Some("user".to_string()),
        password: Some(Bytes::from_static(b"secret")),
    });

    let encoded = encode_packet(&packet);
    assert_eq!(encoded[9], 0xC2);
    assert_eq!(decode_packet(&encoded).unwrap(), packet);
}

#[test]
fn test_connack() {
    assert_eq!(
        decode_packet(&[0x20, 0x02, 0x00, 0x00]).unwrap(),
        Packet::ConnAck(ConnAck::default())
    );
    assert_eq!(
        decode_packet(&[0x20, 0x02, 0x01, 0x05]).unwrap(),
        Packet::ConnAck(ConnAck {
            session_present: true,
            return_code: ConnectReturnCode::NotAuthorized,
        })
    );
    assert_eq!(
        decode_packet(&[0x20, 0x02, 0x00, 0x09]),
        Err(DecodeError::InvalidReturnCode(9))
    );
}

#[test]
fn test_publish_qos0_retained() {
    let packet = Packet::Publish(Publish {
        retain: true,
        topic: "knx/1/2/3".to_string(),
        payload: Bytes::from_static(b"on"),
        ..Default::default()
    });

    let encoded = encode_packet(&packet);
    assert_eq!(encoded[0], 0x31);
    assert_eq!(encoded[1] as usize, 2 + 9 + 2);
    assert_eq!(decode_packet(&encoded).unwrap(), packet);
}

#[test]
fn test_publish_qos1_has_packet_id() {
    let packet = Packet::Publish(Publish {
        qos: QoS::AtLeastOnce,
        topic: "knx/cmd".to_string(),
        packet_id: Some(7),
        payload: Bytes::from_static(b"{}"),
        ..Default::default()
    });

    let encoded = encode_packet(&packet);
    assert_eq!(encoded[0], 0x32);
    assert_eq!(&encoded[11..13], &[0x00, 0x07]);
    assert_eq!(decode_packet(&encoded).unwrap(), packet);
}

#[test]
fn test_publish_rejects_wildcard_topic() {
    let packet = Packet::Publish(Publish {
        topic: "knx/#".to_string(),
        ..Default::default()
    });
    let mut buf = BytesMut::new();
    assert_eq!(
        Encoder::new().encode(&packet, &mut buf),
        Err(EncodeError::InvalidTopicName)
    );

    let raw = [0x30, 0x07, 0x00, 0x05, b'k', b'n', b'x', b'/', b'+'];
    assert!(matches!(
        decode_packet(&raw),
        Err(DecodeError::MalformedPacket(_))
    ));
}

#[test]
fn test_subscribe_and_suback() {
    let packet = Packet::Subscribe(Subscribe {
        packet_id: 1,
        subscriptions: vec![
            Subscription {
                filter: "knx/cmd".to_string(),
                qos: QoS::AtMostOnce,
            },
            Subscription {
                filter: "home/+/cmd".to_string(),
                qos: QoS::AtLeastOnce,
            },
        ],
    });

    let encoded = encode_packet(&packet);
    assert_eq!(encoded[0], 0x82);
    assert_eq!(decode_packet(&encoded).unwrap(), packet);

    let suback = Packet::SubAck(SubAck {
        packet_id: 1,
        return_codes: vec![0, SUBACK_FAILURE],
    });
    let encoded = encode_packet(&suback);
    assert_eq!(&encoded[..], &[0x90, 0x04, 0x00, 0x01, 0x00, 0x80]);
    assert_eq!(decode_packet(&encoded).unwrap(), suback);
}

#[test]
fn test_subscribe_requires_fixed_flags() {
    let raw = [0x80, 0x06, 0x00, 0x01, 0x00, 0x01, b'a', 0x00];
    assert_eq!(decode_packet(&raw), Err(DecodeError::InvalidFlags));
}

#[test]
fn test_control_packets() {
    for packet in [Packet::PingReq, Packet::PingResp, Packet::Disconnect] {
        let encoded = encode_packet(&packet);
        assert_eq!(encoded.len(), 2);
        assert_eq!(encoded[0] >> 4, packet.packet_type());
        assert_eq!(decode_packet(&encoded).unwrap(), packet);
    }

    let encoded = encode_packet(&Packet::PubAck(PubAck { packet_id: 300 }));
    assert_eq!(&encoded[..], &[0x40, 0x02, 0x01, 0x2C]);
}

#[test]
fn test_partial_input_waits_for_more() {
    let packet = Packet::Publish(Publish {
        topic: "knx/0/0/1".to_string(),
        payload: Bytes::from(vec![0u8; 200]),
        ..Default::default()
    });
    let encoded = encode_packet(&packet);
    let decoder = Decoder::new();

    // Two-byte remaining length split after the first byte
    assert_eq!(decoder.decode(&encoded[..2]).unwrap(), None);
    assert_eq!(decoder.decode(&encoded[..encoded.len() - 1]).unwrap(), None);
    assert!(decoder.decode(&encoded).unwrap().is_some());
}

#[test]
fn test_two_packets_in_one_buffer() {
    let mut buf = encode_packet(&Packet::PingResp);
    buf.extend_from_slice(&encode_packet(&Packet::SubAck(SubAck {
        packet_id: 2,
        return_codes: vec![0],
    })));

    let decoder = Decoder::new();
    let (first, used) = decoder.decode(&buf).unwrap().unwrap();
    assert_eq!(first, Packet::PingResp);
    let (second, _) = decoder.decode(&buf[used..]).unwrap().unwrap();
    assert!(matches!(second, Packet::SubAck(SubAck { packet_id: 2, .. })));
}

#[test]
fn test_max_packet_size() {
    let packet = Packet::Publish(Publish {
        topic: "t".to_string(),
        payload: Bytes::from(vec![0u8; 64]),
        ..Default::default()
    });
    let encoded = encode_packet(&packet);
    let decoder = Decoder::new().with_max_packet_size(16);
    assert_eq!(decoder.decode(&encoded), Err(DecodeError::PacketTooLarge));
}

#[test]
fn test_unsupported_packet_type() {
    // PUBREC is not part of the supported subset
    assert_eq!(
        decode_packet(&[0x50, 0x02, 0x00, 0x01]),
        Err(DecodeError::InvalidPacketType(5))
    );
}

mod proptest_tests {
    use super::*;
    use crate::codec::{read_variable_int, write_variable_int};
    use proptest::prelude::*;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(500))]

        #[test]
        fn prop_variable_int_roundtrip(value in 0u32..268_435_455u32) {
            let mut buf = BytesMut::new();
            let written = write_variable_int(&mut buf, value).unwrap();
            let (decoded, consumed) = read_variable_int(&buf).unwrap();
            prop_assert_eq!(value, decoded);
            prop_assert_eq!(written, consumed);
        }

        // Any strict prefix of a packet is reported as incomplete
        #[test]
        fn prop_publish_prefix_is_incomplete(
            topic in "[a-z0-9]{1,20}(/[a-z0-9]{1,10}){0,4}",
            payload in proptest::collection::vec(any::<u8>(), 0..300),
            cut in 0usize..1000,
        ) {
            let packet = Packet::Publish(Publish {
                topic,
                payload: Bytes::from(payload),
                ..Default::default()
            });
            let encoded = encode_packet(&packet);
            let cut = cut % encoded.len();
            prop_assert_eq!(Decoder::new().decode(&encoded[..cut]).unwrap(), None);
        }

        #[test]
        fn prop_decode_never_panics(data in proptest::collection::vec(any::<u8>(), 0..64)) {
            let _ = Decoder::new().decode(&data);
        }
    }
}
