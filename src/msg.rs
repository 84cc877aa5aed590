//! CoAP message model and RFC 7252 wire codec.
//!
//! Covers the subset of RFC 7252 the transports need: the 4-byte header,
//! tokens, option delta/length encoding (with the 13/14 extended forms),
//! the 0xFF payload marker, and the Block1/Block2 option value format
//! from RFC 7959. Anything beyond that (observe, proxying, ETags) is out
//! of scope.

use crate::errors::{RejectionReason, Result, TransportError};
use std::collections::BTreeMap;

/// CoAP protocol version; the only value ever put on the wire.
pub const COAP_VERSION: u8 = 1;

/// Maximum token length permitted by RFC 7252.
pub const MAX_TOKEN_LENGTH: usize = 8;

/// Option numbers used by the transports.
pub mod option {
    pub const URI_PATH: u16 = 11;
    pub const CONTENT_FORMAT: u16 = 12;
    pub const BLOCK2: u16 = 23;
    pub const BLOCK1: u16 = 27;
}

/// CoAP message types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Confirmable,
    NonConfirmable,
    Acknowledgement,
    Reset,
}

impl MessageType {
    fn to_bits(self) -> u8 {
        match self {
            MessageType::Confirmable => 0,
            MessageType::NonConfirmable => 1,
            MessageType::Acknowledgement => 2,
            MessageType::Reset => 3,
        }
    }

    fn from_bits(bits: u8) -> Self {
        match bits & 0x03 {
            0 => MessageType::Confirmable,
            1 => MessageType::NonConfirmable,
            2 => MessageType::Acknowledgement,
            _ => MessageType::Reset,
        }
    }
}

/// CoAP codes as `class.detail` pairs packed into one byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Code(pub u8);

impl Code {
    pub const EMPTY: Code = Code(0x00);
    pub const GET: Code = Code(0x01);
    pub const POST: Code = Code(0x02);
    pub const CHANGED: Code = Code(0x44); // 2.04
    pub const CONTENT: Code = Code(0x45); // 2.05
    pub const CONTINUE: Code = Code(0x5F); // 2.31
    pub const BAD_REQUEST: Code = Code(0x80); // 4.00
    pub const INTERNAL_SERVER_ERROR: Code = Code(0xA0); // 5.00

    pub fn new(class: u8, detail: u8) -> Self {
        Code((class << 5) | (detail & 0x1F))
    }

    pub fn class(&self) -> u8 {
        self.0 >> 5
    }

    pub fn detail(&self) -> u8 {
        self.0 & 0x1F
    }

    pub fn is_request(&self) -> bool {
        self.class() == 0 && self.detail() != 0
    }

    pub fn is_success(&self) -> bool {
        self.class() == 2
    }

    pub fn is_error(&self) -> bool {
        self.class() == 4 || self.class() == 5
    }

    /// Dotted form, e.g. `4.00`.
    pub fn dotted(&self) -> String {
        format!("{}.{:02}", self.class(), self.detail())
    }
}

/// Block1/Block2 option value (RFC 7959): `num`, `more`, and the SZX
/// size exponent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockOption {
    pub num: u32,
    pub more: bool,
    /// Block size in bytes; a power of two within 16..=1024.
    pub size: usize,
}

impl BlockOption {
    pub fn new(num: u32, more: bool, size: usize) -> Self {
        BlockOption { num, more, size }
    }

    fn szx(&self) -> u8 {
        // 16 -> 0 ... 1024 -> 6
        (self.size.trailing_zeros().saturating_sub(4)) as u8
    }

    /// Encode as the minimal-length big-endian uint CoAP options use.
    pub fn encode(&self) -> Vec<u8> {
        let value = (self.num << 4) | u32::from(self.more) << 3 | u32::from(self.szx() & 0x07);
        encode_uint_option(value)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() > 3 {
            return Err(TransportError::Malformed(format!(
                "block option value of {} bytes exceeds 3",
                bytes.len()
            )));
        }
        let value = decode_uint_option(bytes) as u32;
        let szx = (value & 0x07) as u8;
        if szx == 7 {
            return Err(TransportError::Malformed("reserved block SZX 7".into()));
        }
        Ok(BlockOption {
            num: value >> 4,
            more: value & 0x08 != 0,
            size: 1usize << (szx + 4),
        })
    }
}

fn encode_uint_option(value: u32) -> Vec<u8> {
    let bytes = value.to_be_bytes();
    let skip = bytes.iter().take_while(|b| **b == 0).count();
    bytes[skip..].to_vec()
}

fn decode_uint_option(bytes: &[u8]) -> u64 {
    bytes.iter().fold(0u64, |acc, b| (acc << 8) | u64::from(*b))
}

/// A CoAP message.
///
/// Options are held in a number-keyed map; repeatable options (Uri-Path)
/// store one value per occurrence, in wire order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoapMessage {
    pub mtype: MessageType,
    pub code: Code,
    pub message_id: u16,
    pub token: Vec<u8>,
    options: BTreeMap<u16, Vec<Vec<u8>>>,
    pub payload: Vec<u8>,
}

impl CoapMessage {
    pub fn new(mtype: MessageType, code: Code, message_id: u16, token: Vec<u8>) -> Self {
        debug_assert!(token.len() <= MAX_TOKEN_LENGTH);
        CoapMessage {
            mtype,
            code,
            message_id,
            token,
            options: BTreeMap::new(),
            payload: Vec::new(),
        }
    }

    /// An Empty ACK correlating to `message_id` (no token, no payload).
    pub fn ack(message_id: u16) -> Self {
        CoapMessage::new(MessageType::Acknowledgement, Code::EMPTY, message_id, Vec::new())
    }

    /// A Reset correlating to `message_id`.
    pub fn reset(message_id: u16) -> Self {
        CoapMessage::new(MessageType::Reset, Code::EMPTY, message_id, Vec::new())
    }

    pub fn with_payload(mut self, payload: Vec<u8>) -> Self {
        self.payload = payload;
        self
    }

    pub fn add_option(&mut self, number: u16, value: Vec<u8>) {
        self.options.entry(number).or_default().push(value);
    }

    pub fn set_option(&mut self, number: u16, value: Vec<u8>) {
        self.options.insert(number, vec![value]);
    }

    pub fn option(&self, number: u16) -> Option<&[u8]> {
        self.options
            .get(&number)
            .and_then(|vs| vs.first())
            .map(|v| v.as_slice())
    }

    pub fn option_values(&self, number: u16) -> &[Vec<u8>] {
        self.options.get(&number).map(|v| v.as_slice()).unwrap_or(&[])
    }

    /// Set the Uri-Path options from a `/`-separated path.
    pub fn set_uri_path(&mut self, path: &str) {
        self.options.remove(&option::URI_PATH);
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            self.add_option(option::URI_PATH, segment.as_bytes().to_vec());
        }
    }

    /// Reconstruct the `/`-separated resource path.
    pub fn uri_path(&self) -> String {
        let segments: Vec<String> = self
            .option_values(option::URI_PATH)
            .iter()
            .map(|v| String::from_utf8_lossy(v).into_owned())
            .collect();
        format!("/{}", segments.join("/"))
    }

    pub fn set_content_format(&mut self, format: u16) {
        self.set_option(option::CONTENT_FORMAT, encode_uint_option(u32::from(format)));
    }

    pub fn content_format(&self) -> Option<u16> {
        self.option(option::CONTENT_FORMAT)
            .map(|v| decode_uint_option(v) as u16)
    }

    pub fn set_block1(&mut self, block: BlockOption) {
        self.set_option(option::BLOCK1, block.encode());
    }

    pub fn block1(&self) -> Option<Result<BlockOption>> {
        self.option(option::BLOCK1).map(BlockOption::decode)
    }

    pub fn set_block2(&mut self, block: BlockOption) {
        self.set_option(option::BLOCK2, block.encode());
    }

    pub fn block2(&self) -> Option<Result<BlockOption>> {
        self.option(option::BLOCK2).map(BlockOption::decode)
    }

    /// Serialize to RFC 7252 wire format.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(4 + self.token.len() + self.payload.len() + 16);

        out.push(
            (COAP_VERSION << 6) | (self.mtype.to_bits() << 4) | (self.token.len() as u8 & 0x0F),
        );
        out.push(self.code.0);
        out.extend_from_slice(&self.message_id.to_be_bytes());
        out.extend_from_slice(&self.token);

        let mut last_number = 0u16;
        for (number, values) in &self.options {
            for value in values {
                let delta = number - last_number;
                encode_option_header(&mut out, delta, value.len());
                out.extend_from_slice(value);
                last_number = *number;
            }
        }

        if !self.payload.is_empty() {
            out.push(0xFF);
            out.extend_from_slice(&self.payload);
        }

        out
    }

    /// Parse from RFC 7252 wire format.
    pub fn decode(data: &[u8]) -> Result<CoapMessage> {
        if data.len() < 4 {
            return Err(TransportError::Malformed(format!(
                "datagram of {} bytes is shorter than the CoAP header",
                data.len()
            )));
        }

        let version = data[0] >> 6;
        if version != COAP_VERSION {
            return Err(TransportError::Malformed(format!(
                "unsupported CoAP version {version}"
            )));
        }
        let mtype = MessageType::from_bits(data[0] >> 4);
        let token_length = (data[0] & 0x0F) as usize;
        if token_length > MAX_TOKEN_LENGTH {
            return Err(TransportError::Malformed(format!(
                "token length {token_length} exceeds 8"
            )));
        }

        let code = Code(data[1]);
        let message_id = u16::from_be_bytes([data[2], data[3]]);

        if data.len() < 4 + token_length {
            return Err(TransportError::Malformed("truncated token".into()));
        }
        let token = data[4..4 + token_length].to_vec();

        let mut msg = CoapMessage::new(mtype, code, message_id, token);
        let mut pos = 4 + token_length;
        let mut number = 0u16;

        while pos < data.len() {
            let byte = data[pos];
            if byte == 0xFF {
                pos += 1;
                if pos == data.len() {
                    return Err(TransportError::Malformed(
                        "payload marker with empty payload".into(),
                    ));
                }
                msg.payload = data[pos..].to_vec();
                return Ok(msg);
            }

            pos += 1;
            let delta = decode_option_extended(data, &mut pos, byte >> 4)?;
            let length = decode_option_extended(data, &mut pos, byte & 0x0F)?;

            number = number
                .checked_add(delta)
                .ok_or_else(|| TransportError::Malformed("option delta overflow".into()))?;

            let length = length as usize;
            if pos + length > data.len() {
                return Err(TransportError::Malformed("truncated option value".into()));
            }
            msg.add_option(number, data[pos..pos + length].to_vec());
            pos += length;
        }

        Ok(msg)
    }
}

fn encode_option_header(out: &mut Vec<u8>, delta: u16, length: usize) {
    let (delta_nibble, delta_ext) = encode_option_nibble(delta);
    let (length_nibble, length_ext) = encode_option_nibble(length as u16);
    out.push((delta_nibble << 4) | length_nibble);
    out.extend_from_slice(&delta_ext);
    out.extend_from_slice(&length_ext);
}

fn encode_option_nibble(value: u16) -> (u8, Vec<u8>) {
    match value {
        0..=12 => (value as u8, Vec::new()),
        13..=268 => (13, vec![(value - 13) as u8]),
        _ => (14, (value - 269).to_be_bytes().to_vec()),
    }
}

fn decode_option_extended(data: &[u8], pos: &mut usize, nibble: u8) -> Result<u16> {
    match nibble {
        0..=12 => Ok(u16::from(nibble)),
        13 => {
            let b = *data
                .get(*pos)
                .ok_or_else(|| TransportError::Malformed("truncated option header".into()))?;
            *pos += 1;
            Ok(u16::from(b) + 13)
        }
        14 => {
            if *pos + 2 > data.len() {
                return Err(TransportError::Malformed("truncated option header".into()));
            }
            let v = u16::from_be_bytes([data[*pos], data[*pos + 1]]);
            *pos += 2;
            v.checked_add(269)
                .ok_or_else(|| TransportError::Malformed("option delta overflow".into()))
        }
        _ => Err(TransportError::Malformed(
            "reserved option nibble 15".into(),
        )),
    }
}

/// Datagram-level malformedness screen applied before full decoding.
///
/// Returns the rejection reason, or `None` when the datagram passes.
/// Checks operate on the raw bytes: empty or sub-header-length input,
/// wrong version bits, oversized token, and the all-zero / all-0xFF
/// corruption patterns.
pub fn screen_datagram(data: &[u8]) -> Option<RejectionReason> {
    if data.len() < 4 {
        return Some(RejectionReason::EmptyPayload);
    }

    // The corruption patterns also fail the version check; screen them
    // first so the recorded reason names the actual pattern.
    if data.iter().all(|b| *b == 0xFF) {
        return Some(RejectionReason::AllOnesPayload);
    }
    if data.iter().all(|b| *b == 0x00) {
        return Some(RejectionReason::AllZeroPayload);
    }

    let version = (data[0] >> 6) & 0x03;
    if version != COAP_VERSION {
        return Some(RejectionReason::BadVersion);
    }

    let token_length = data[0] & 0x0F;
    if token_length as usize > MAX_TOKEN_LENGTH {
        return Some(RejectionReason::TokenTooLong);
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trip() {
        let mut msg = CoapMessage::new(
            MessageType::Confirmable,
            Code::POST,
            0xBEEF,
            vec![1, 2, 3, 4],
        );
        msg.set_uri_path("/raft/request_vote");
        msg.set_content_format(50);
        msg.payload = b"{\"term\":1}".to_vec();

        let wire = msg.encode();
        let back = CoapMessage::decode(&wire).unwrap();
        assert_eq!(back, msg);
        assert_eq!(back.uri_path(), "/raft/request_vote");
        assert_eq!(back.content_format(), Some(50));
    }

    #[test]
    fn extended_option_deltas_round_trip() {
        // Block1 (27) after Content-Format (12) exercises a delta of 15,
        // which needs the 13-extended form.
        let mut msg = CoapMessage::new(MessageType::Confirmable, Code::POST, 7, vec![9]);
        msg.set_content_format(50);
        msg.set_block1(BlockOption::new(3, true, 1024));
        let back = CoapMessage::decode(&msg.encode()).unwrap();
        assert_eq!(back.block1().unwrap().unwrap(), BlockOption::new(3, true, 1024));

        // An option number above 280 exercises the 14-extended form.
        let mut msg = CoapMessage::new(MessageType::NonConfirmable, Code::GET, 8, vec![]);
        msg.set_option(2048, vec![0xAB]);
        let back = CoapMessage::decode(&msg.encode()).unwrap();
        assert_eq!(back.option(2048), Some(&[0xAB][..]));
    }

    #[test]
    fn block_option_encoding_matches_rfc7959() {
        // num=5, more=true, size=1024 (szx 6) -> 0x5E
        let block = BlockOption::new(5, true, 1024);
        assert_eq!(block.encode(), vec![0x5E]);
        assert_eq!(BlockOption::decode(&[0x5E]).unwrap(), block);

        // num=0, more=false, size=16 (szx 0) -> zero-length uint
        let first = BlockOption::new(0, false, 16);
        assert_eq!(first.encode(), Vec::<u8>::new());
        assert_eq!(BlockOption::decode(&[]).unwrap(), first);
    }

    #[test]
    fn reserved_szx_rejected() {
        assert!(BlockOption::decode(&[0x07]).is_err());
    }

    #[test]
    fn empty_ack_has_no_token_or_payload() {
        let ack = CoapMessage::ack(1234);
        let wire = ack.encode();
        assert_eq!(wire.len(), 4);
        let back = CoapMessage::decode(&wire).unwrap();
        assert_eq!(back.mtype, MessageType::Acknowledgement);
        assert_eq!(back.code, Code::EMPTY);
        assert_eq!(back.message_id, 1234);
    }

    #[test]
    fn screen_rejects_corrupt_datagrams() {
        assert_eq!(screen_datagram(&[]), Some(RejectionReason::EmptyPayload));
        assert_eq!(
            screen_datagram(&[0x40, 0x01]),
            Some(RejectionReason::EmptyPayload)
        );
        // Version bits 00.
        assert_eq!(
            screen_datagram(&[0x00, 0x01, 0x00, 0x01]),
            Some(RejectionReason::BadVersion)
        );
        // TKL 9.
        assert_eq!(
            screen_datagram(&[0x49, 0x01, 0x00, 0x01]),
            Some(RejectionReason::TokenTooLong)
        );
        assert_eq!(
            screen_datagram(&[0xFF; 8]),
            Some(RejectionReason::AllOnesPayload)
        );
        assert_eq!(
            screen_datagram(&[0x00; 8]),
            Some(RejectionReason::AllZeroPayload)
        );

        let ok = CoapMessage::new(MessageType::Confirmable, Code::POST, 1, vec![1]).encode();
        assert_eq!(screen_datagram(&ok), None);
    }

    #[test]
    fn payload_marker_with_nothing_after_is_malformed() {
        let mut wire = CoapMessage::new(MessageType::Confirmable, Code::POST, 1, vec![]).encode();
        wire.push(0xFF);
        assert!(CoapMessage::decode(&wire).is_err());
    }
}
