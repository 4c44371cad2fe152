//! CoAP message framing (RFC 7252 §3)
//!
//! A [`Message`] is the wire-level unit exchanged over UDP: a fixed 4-byte
//! header, a token, delta-encoded options and an optional payload. The codec
//! is strict: anything it cannot frame exactly is a
//! [`GatewayError::MalformedMessage`], which callers log and drop.

use std::fmt;

use crate::error::{GatewayError, Result};

/// Largest datagram accepted or produced (RFC 7252 §4.6 recommendation)
pub const MAX_MESSAGE_SIZE: usize = 1152;

/// Protocol version carried in every header
pub const VERSION: u8 = 1;

const PAYLOAD_MARKER: u8 = 0xFF;
const HEADER_LEN: usize = 4;
const MAX_OPTION_LEN: usize = 65535 + 269;

/// Option numbers used by the gateway (RFC 7252 §5.10)
pub mod options {
    pub const URI_HOST: u16 = 3;
    pub const URI_PORT: u16 = 7;
    pub const URI_PATH: u16 = 11;
    pub const CONTENT_FORMAT: u16 = 12;
    pub const URI_QUERY: u16 = 15;
    pub const ACCEPT: u16 = 17;
}

/// CoAP message type (header bits 2-3)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    Confirmable,
    NonConfirmable,
    Acknowledgement,
    Reset,
}

impl MessageType {
    fn from_bits(bits: u8) -> Self {
        match bits & 0x03 {
            0 => Self::Confirmable,
            1 => Self::NonConfirmable,
            2 => Self::Acknowledgement,
            _ => Self::Reset,
        }
    }

    fn bits(self) -> u8 {
        match self {
            Self::Confirmable => 0,
            Self::NonConfirmable => 1,
            Self::Acknowledgement => 2,
            Self::Reset => 3,
        }
    }
}

/// Raw message code in `class.detail` form
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct MessageCode(u8);

impl MessageCode {
    /// 0.00, used by empty ACK/RST and CoAP ping
    pub const EMPTY: Self = Self(0);

    pub const fn new(class: u8, detail: u8) -> Self {
        Self(((class & 0x07) << 5) | (detail & 0x1f))
    }

    pub const fn from_u8(raw: u8) -> Self {
        Self(raw)
    }

    pub const fn as_u8(self) -> u8 {
        self.0
    }

    pub const fn class(self) -> u8 {
        self.0 >> 5
    }

    pub const fn detail(self) -> u8 {
        self.0 & 0x1f
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn is_request(self) -> bool {
        self.class() == 0 && self.detail() != 0
    }

    pub fn is_response(self) -> bool {
        matches!(self.class(), 2..=5)
    }

    fn is_reserved(self) -> bool {
        matches!(self.class(), 1 | 6 | 7)
    }
}

impl fmt::Display for MessageCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:02}", self.class(), self.detail())
    }
}

impl fmt::Debug for MessageCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MessageCode({self})")
    }
}

/// Request/response correlator, 0 to 8 bytes
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Token {
    len: u8,
    bytes: [u8; 8],
}

impl Token {
    pub const MAX_LEN: usize = 8;

    pub fn new(bytes: &[u8]) -> Result<Self> {
        if bytes.len() > Self::MAX_LEN {
            return Err(GatewayError::malformed(format!(
                "token of {} bytes exceeds {}",
                bytes.len(),
                Self::MAX_LEN
            )));
        }
        let mut token = Self {
            len: bytes.len() as u8,
            bytes: [0; 8],
        };
        token.bytes[..bytes.len()].copy_from_slice(bytes);
        Ok(token)
    }

    /// Eight-byte token from a counter value
    pub fn from_u64(value: u64) -> Self {
        Self {
            len: 8,
            bytes: value.to_be_bytes(),
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..self.len as usize]
    }

    pub fn len(&self) -> usize {
        self.len as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.as_bytes() {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Token({self})")
    }
}

/// A single option: number plus opaque value
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoapOption {
    pub number: u16,
    pub value: Vec<u8>,
}

/// A complete CoAP message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub message_type: MessageType,
    pub code: MessageCode,
    pub message_id: u16,
    pub token: Token,
    /// Sorted by option number; equal numbers keep insertion order
    options: Vec<CoapOption>,
    pub payload: Vec<u8>,
}

impl Message {
    pub fn new(message_type: MessageType, code: MessageCode, message_id: u16) -> Self {
        Self {
            message_type,
            code,
            message_id,
            token: Token::default(),
            options: Vec::new(),
            payload: Vec::new(),
        }
    }

    /// Empty acknowledgement for a confirmable message
    pub fn empty_ack(message_id: u16) -> Self {
        Self::new(MessageType::Acknowledgement, MessageCode::EMPTY, message_id)
    }

    /// Reset rejecting the message with `message_id`
    pub fn reset(message_id: u16) -> Self {
        Self::new(MessageType::Reset, MessageCode::EMPTY, message_id)
    }

    pub fn with_token(mut self, token: Token) -> Self {
        self.token = token;
        self
    }

    pub fn with_payload(mut self, payload: Vec<u8>) -> Self {
        self.payload = payload;
        self
    }

    pub fn options(&self) -> &[CoapOption] {
        &self.options
    }

    /// Insert an option, keeping the list ordered by number
    pub fn add_option(&mut self, number: u16, value: Vec<u8>) {
        let index = self.options.partition_point(|o| o.number <= number);
        self.options.insert(index, CoapOption { number, value });
    }

    pub fn option_values(&self, number: u16) -> impl Iterator<Item = &[u8]> {
        self.options
            .iter()
            .filter(move |o| o.number == number)
            .map(|o| o.value.as_slice())
    }

    pub fn first_option(&self, number: u16) -> Option<&[u8]> {
        self.option_values(number).next()
    }

    /// Add a uint option using the shortest big-endian form (0 is empty)
    pub fn add_uint_option(&mut self, number: u16, value: u32) {
        let bytes = value.to_be_bytes();
        let skip = bytes.iter().take_while(|b| **b == 0).count();
        self.add_option(number, bytes[skip..].to_vec());
    }

    pub fn uint_option(&self, number: u16) -> Option<u32> {
        let value = self.first_option(number)?;
        if value.len() > 4 {
            return None;
        }
        Some(value.iter().fold(0u32, |acc, b| (acc << 8) | u32::from(*b)))
    }

    /// Uri-Path segments, decoded as UTF-8 (lossy)
    pub fn uri_path(&self) -> Vec<String> {
        self.option_values(options::URI_PATH)
            .map(|v| String::from_utf8_lossy(v).into_owned())
            .collect()
    }

    pub fn uri_query(&self) -> Vec<String> {
        self.option_values(options::URI_QUERY)
            .map(|v| String::from_utf8_lossy(v).into_owned())
            .collect()
    }

    pub fn content_format(&self) -> Option<u16> {
        self.uint_option(options::CONTENT_FORMAT)
            .and_then(|v| u16::try_from(v).ok())
    }

    pub fn accept(&self) -> Option<u16> {
        self.uint_option(options::ACCEPT)
            .and_then(|v| u16::try_from(v).ok())
    }

    /// Parse a datagram
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() > MAX_MESSAGE_SIZE {
            return Err(GatewayError::malformed(format!(
                "datagram of {} bytes exceeds {MAX_MESSAGE_SIZE}",
                bytes.len()
            )));
        }
        if bytes.len() < HEADER_LEN {
            return Err(GatewayError::malformed("truncated header"));
        }

        let version = bytes[0] >> 6;
        if version != VERSION {
            return Err(GatewayError::malformed(format!(
                "unsupported version {version}"
            )));
        }
        let message_type = MessageType::from_bits(bytes[0] >> 4);
        let token_len = (bytes[0] & 0x0f) as usize;
        if token_len > Token::MAX_LEN {
            return Err(GatewayError::malformed(format!(
                "reserved token length {token_len}"
            )));
        }
        let code = MessageCode::from_u8(bytes[1]);
        if code.is_reserved() {
            return Err(GatewayError::malformed(format!("invalid code {code}")));
        }
        let message_id = u16::from_be_bytes([bytes[2], bytes[3]]);

        if code.is_empty() && (bytes.len() != HEADER_LEN || token_len != 0) {
            return Err(GatewayError::malformed("empty message with content"));
        }
        if bytes.len() < HEADER_LEN + token_len {
            return Err(GatewayError::malformed("truncated token"));
        }
        let token = Token::new(&bytes[HEADER_LEN..HEADER_LEN + token_len])?;

        let mut message = Self::new(message_type, code, message_id).with_token(token);
        let mut pos = HEADER_LEN + token_len;
        let mut number = 0usize;

        while pos < bytes.len() {
            let byte = bytes[pos];
            pos += 1;

            if byte == PAYLOAD_MARKER {
                if pos == bytes.len() {
                    return Err(GatewayError::malformed("payload marker without payload"));
                }
                message.payload = bytes[pos..].to_vec();
                break;
            }

            let delta = read_extended(byte >> 4, bytes, &mut pos)?;
            let length = read_extended(byte & 0x0f, bytes, &mut pos)?;

            number += delta;
            let option_number = u16::try_from(number)
                .map_err(|_| GatewayError::malformed(format!("option number {number}")))?;
            if bytes.len() - pos < length {
                return Err(GatewayError::malformed("truncated option value"));
            }
            message.options.push(CoapOption {
                number: option_number,
                value: bytes[pos..pos + length].to_vec(),
            });
            pos += length;
        }

        Ok(message)
    }

    /// Serialize to a datagram
    pub fn encode(&self) -> Result<Vec<u8>> {
        if self.code.is_reserved() {
            return Err(GatewayError::malformed(format!("invalid code {}", self.code)));
        }
        if self.code.is_empty()
            && !(self.token.is_empty() && self.options.is_empty() && self.payload.is_empty())
        {
            return Err(GatewayError::malformed("empty message with content"));
        }

        let mut out = Vec::with_capacity(HEADER_LEN + self.token.len() + self.payload.len() + 16);
        out.push((VERSION << 6) | (self.message_type.bits() << 4) | self.token.len() as u8);
        out.push(self.code.as_u8());
        out.extend_from_slice(&self.message_id.to_be_bytes());
        out.extend_from_slice(self.token.as_bytes());

        let mut previous = 0u16;
        for option in &self.options {
            if option.value.len() > MAX_OPTION_LEN {
                return Err(GatewayError::malformed(format!(
                    "option {} value of {} bytes",
                    option.number,
                    option.value.len()
                )));
            }
            let delta = usize::from(option.number - previous);
            let (delta_nibble, delta_ext) = split_extended(delta);
            let (len_nibble, len_ext) = split_extended(option.value.len());
            out.push((delta_nibble << 4) | len_nibble);
            out.extend_from_slice(&delta_ext);
            out.extend_from_slice(&len_ext);
            out.extend_from_slice(&option.value);
            previous = option.number;
        }

        if !self.payload.is_empty() {
            out.push(PAYLOAD_MARKER);
            out.extend_from_slice(&self.payload);
        }

        if out.len() > MAX_MESSAGE_SIZE {
            return Err(GatewayError::malformed(format!(
                "encoded message of {} bytes exceeds {MAX_MESSAGE_SIZE}",
                out.len()
            )));
        }
        Ok(out)
    }
}

fn read_extended(nibble: u8, bytes: &[u8], pos: &mut usize) -> Result<usize> {
    match nibble {
        0..=12 => Ok(usize::from(nibble)),
        13 => {
            let ext = *bytes
                .get(*pos)
                .ok_or_else(|| GatewayError::malformed("truncated option extension"))?;
            *pos += 1;
            Ok(usize::from(ext) + 13)
        }
        14 => {
            let ext = bytes
                .get(*pos..*pos + 2)
                .ok_or_else(|| GatewayError::malformed("truncated option extension"))?;
            *pos += 2;
            Ok(usize::from(u16::from_be_bytes([ext[0], ext[1]])) + 269)
        }
        _ => Err(GatewayError::malformed("reserved option nibble 15")),
    }
}

fn split_extended(value: usize) -> (u8, Vec<u8>) {
    if value < 13 {
        (value as u8, Vec::new())
    } else if value < 269 {
        (13, vec![(value - 13) as u8])
    } else {
        (14, ((value - 269) as u16).to_be_bytes().to_vec())
    }
}
