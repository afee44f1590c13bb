use crate::raknet::{
    build_unconnected_ping, build_unconnected_pong, is_offline_message, motd_payload,
    parse_unconnected_ping, parse_unconnected_pong, ID_OPEN_CONNECTION_REQUEST_1,
    ID_UNCONNECTED_PONG, OFFLINE_MESSAGE_MAGIC,
};

#[test]
fn ping_roundtrip() {
    let datagram = build_unconnected_ping(123456, 0xDEADBEEF);
    let ping = parse_unconnected_ping(&datagram).unwrap();
    assert_eq!(ping.time, 123456);
    assert_eq!(ping.client_guid, 0xDEADBEEF);
}

#[test]
fn ping_with_wrong_magic_is_rejected() {
    let mut datagram = build_unconnected_ping(1, 2);
    datagram[9] ^= 0xFF;
    assert!(parse_unconnected_ping(&datagram).is_none());
}

#[test]
fn truncated_ping_is_rejected() {
    let datagram = build_unconnected_ping(1, 2);
    assert!(parse_unconnected_ping(&datagram[..20]).is_none());
}

#[test]
fn pong_roundtrip() {
    let payload = motd_payload("A server", 686, "1.21.51", 0, 20, 42, "world", 19132);
    let datagram = build_unconnected_pong(99, 42, &payload);
    assert_eq!(datagram[0], ID_UNCONNECTED_PONG);
    let pong = parse_unconnected_pong(&datagram).unwrap();
    assert_eq!(pong.time, 99);
    assert_eq!(pong.server_guid, 42);
    assert_eq!(pong.payload, payload.as_bytes());
}

#[test]
fn motd_payload_field_order() {
    let payload = motd_payload("Sleepy", 686, "1.21.51", 0, 20, 7, "world", 19132);
    let fields: Vec<&str> = payload.split(';').collect();
    assert_eq!(fields[0], "MCPE");
    assert_eq!(fields[1], "Sleepy");
    assert_eq!(fields[2], "686");
    assert_eq!(fields[3], "1.21.51");
    assert_eq!(fields[4], "0");
    assert_eq!(fields[5], "20");
    assert_eq!(fields[6], "7");
    assert_eq!(fields[7], "world");
    assert_eq!(fields[8], "Survival");
    assert_eq!(fields[10], "19132");
}

#[test]
fn motd_payload_escapes_separators() {
    let payload = motd_payload("a;b", 686, "1.21.51", 0, 20, 7, "w", 19132);
    assert!(payload.starts_with("MCPE;a:b;"));
}

#[test]
fn offline_message_detection() {
    let mut ocr1 = vec![ID_OPEN_CONNECTION_REQUEST_1];
    ocr1.extend_from_slice(&OFFLINE_MESSAGE_MAGIC);
    ocr1.extend_from_slice(&[6, 0, 0]); // protocol version + padding start
    assert!(is_offline_message(&ocr1));

    // a connected-RakNet data frame has no magic
    assert!(!is_offline_message(&[0x84, 0x00, 0x00, 0x00]));
    assert!(!is_offline_message(&[]));
}
