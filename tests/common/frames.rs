//! Wire-frame helpers for connection tests.

use tidemark::protocol::{Opcode, HEADER_LEN, MAGIC_REQUEST, MAGIC_RESPONSE};

/// Encode a request frame.
pub fn request_frame(
    opcode: u8,
    partition: u16,
    extras: &[u8],
    key: &[u8],
    value: &[u8],
    opaque: u32,
    cas: u64,
) -> Vec<u8> {
    let body_len = (extras.len() + key.len() + value.len()) as u32;
    let mut frame = Vec::with_capacity(HEADER_LEN + body_len as usize);
    frame.push(MAGIC_REQUEST);
    frame.push(opcode);
    frame.extend_from_slice(&(key.len() as u16).to_be_bytes());
    frame.push(extras.len() as u8);
    frame.push(0); // datatype
    frame.extend_from_slice(&partition.to_be_bytes());
    frame.extend_from_slice(&body_len.to_be_bytes());
    frame.extend_from_slice(&opaque.to_le_bytes());
    frame.extend_from_slice(&cas.to_be_bytes());
    frame.extend_from_slice(extras);
    frame.extend_from_slice(key);
    frame.extend_from_slice(value);
    frame
}

pub fn noop_frame(opaque: u32) -> Vec<u8> {
    request_frame(Opcode::Noop.as_u8(), 0, &[], &[], &[], opaque, 0)
}

pub fn hello_frame(agent: &str, features: &[u16], opaque: u32) -> Vec<u8> {
    let value: Vec<u8> = features.iter().flat_map(|f| f.to_be_bytes()).collect();
    request_frame(
        Opcode::Hello.as_u8(),
        0,
        &[],
        agent.as_bytes(),
        &value,
        opaque,
        0,
    )
}

pub fn sasl_plain_frame(user: &str, password: &str, opaque: u32) -> Vec<u8> {
    let mut payload = vec![0u8];
    payload.extend_from_slice(user.as_bytes());
    payload.push(0);
    payload.extend_from_slice(password.as_bytes());
    request_frame(
        Opcode::SaslAuth.as_u8(),
        0,
        &[],
        b"PLAIN",
        &payload,
        opaque,
        0,
    )
}

pub fn select_bucket_frame(bucket: &str, opaque: u32) -> Vec<u8> {
    request_frame(
        Opcode::SelectBucket.as_u8(),
        0,
        &[],
        bucket.as_bytes(),
        &[],
        opaque,
        0,
    )
}

pub fn set_frame(partition: u16, key: &str, value: &[u8], opaque: u32) -> Vec<u8> {
    // Store extras: 4-byte flags + 4-byte expiry.
    request_frame(
        Opcode::Set.as_u8(),
        partition,
        &[0u8; 8],
        key.as_bytes(),
        value,
        opaque,
        0,
    )
}

pub fn get_frame(partition: u16, key: &str, opaque: u32) -> Vec<u8> {
    request_frame(
        Opcode::Get.as_u8(),
        partition,
        &[],
        key.as_bytes(),
        &[],
        opaque,
        0,
    )
}

pub fn delete_frame(partition: u16, key: &str, opaque: u32) -> Vec<u8> {
    request_frame(
        Opcode::Delete.as_u8(),
        partition,
        &[],
        key.as_bytes(),
        &[],
        opaque,
        0,
    )
}

pub fn quit_frame(opaque: u32) -> Vec<u8> {
    request_frame(Opcode::Quit.as_u8(), 0, &[], &[], &[], opaque, 0)
}

/// A decoded response frame.
#[derive(Debug, Clone)]
pub struct ParsedResponse {
    pub opcode: u8,
    pub status: u16,
    pub opaque: u32,
    pub cas: u64,
    pub extras: Vec<u8>,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

/// Split a byte stream into response frames.
pub fn parse_responses(mut bytes: &[u8]) -> Vec<ParsedResponse> {
    let mut responses = Vec::new();
    while bytes.len() >= HEADER_LEN {
        assert_eq!(bytes[0], MAGIC_RESPONSE, "response magic");
        let opcode = bytes[1];
        let key_len = u16::from_be_bytes([bytes[2], bytes[3]]) as usize;
        let extras_len = bytes[4] as usize;
        let status = u16::from_be_bytes([bytes[6], bytes[7]]);
        let body_len = u32::from_be_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]) as usize;
        let opaque = u32::from_le_bytes([bytes[12], bytes[13], bytes[14], bytes[15]]);
        let cas = u64::from_be_bytes([
            bytes[16], bytes[17], bytes[18], bytes[19], bytes[20], bytes[21], bytes[22],
            bytes[23],
        ]);
        assert!(bytes.len() >= HEADER_LEN + body_len, "complete frame");
        let body = &bytes[HEADER_LEN..HEADER_LEN + body_len];
        responses.push(ParsedResponse {
            opcode,
            status,
            opaque,
            cas,
            extras: body[..extras_len].to_vec(),
            key: body[extras_len..extras_len + key_len].to_vec(),
            value: body[extras_len + key_len..].to_vec(),
        });
        bytes = &bytes[HEADER_LEN + body_len..];
    }
    responses
}
