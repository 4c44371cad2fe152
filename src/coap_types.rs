//! Transport-agnostic request and response types
//!
//! Handlers see [`Request`] and produce [`Response`]; the server and client
//! convert them to and from wire [`Message`]s. This keeps resource logic free
//! of token and message-id bookkeeping.

use std::borrow::Cow;

use crate::error::{GatewayError, Result};
use crate::message::{Message, MessageCode, MessageType, Token, options};

/// Uri-Path segments are limited to 255 bytes
const MAX_SEGMENT_LEN: usize = 255;

/// CoAP Content-Format identifiers used by the gateway
/// See: https://www.iana.org/assignments/core-parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum ContentFormat {
    /// text/plain;charset=utf-8
    TextPlain = 0,
    /// application/link-format
    LinkFormat = 40,
    /// application/json
    Json = 50,
    /// application/cbor
    Cbor = 60,
}

impl ContentFormat {
    /// Convert from raw content-format ID
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            0 => Some(Self::TextPlain),
            40 => Some(Self::LinkFormat),
            50 => Some(Self::Json),
            60 => Some(Self::Cbor),
            _ => None,
        }
    }

    /// Get the raw content-format ID
    pub fn as_u16(self) -> u16 {
        self as u16
    }
}

/// Request methods
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
    Put,
    Delete,
}

impl std::fmt::Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Method::Get => f.write_str("GET"),
            Method::Post => f.write_str("POST"),
            Method::Put => f.write_str("PUT"),
            Method::Delete => f.write_str("DELETE"),
        }
    }
}

impl Method {
    pub fn code(self) -> MessageCode {
        match self {
            Self::Get => MessageCode::new(0, 1),
            Self::Post => MessageCode::new(0, 2),
            Self::Put => MessageCode::new(0, 3),
            Self::Delete => MessageCode::new(0, 4),
        }
    }

    pub fn from_code(code: MessageCode) -> Option<Self> {
        match (code.class(), code.detail()) {
            (0, 1) => Some(Self::Get),
            (0, 2) => Some(Self::Post),
            (0, 3) => Some(Self::Put),
            (0, 4) => Some(Self::Delete),
            _ => None,
        }
    }
}

/// Response code category
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseClass {
    Success,
    ClientError,
    ServerError,
}

/// CoAP response codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseCode {
    // Success codes
    /// 2.01 Created
    Created,
    /// 2.02 Deleted
    Deleted,
    /// 2.03 Valid
    Valid,
    /// 2.04 Changed
    Changed,
    /// 2.05 Content
    Content,

    // Client error codes
    /// 4.00 Bad Request
    BadRequest,
    /// 4.01 Unauthorized
    Unauthorized,
    /// 4.02 Bad Option
    BadOption,
    /// 4.03 Forbidden
    Forbidden,
    /// 4.04 Not Found
    NotFound,
    /// 4.05 Method Not Allowed
    MethodNotAllowed,
    /// 4.06 Not Acceptable
    NotAcceptable,
    /// 4.13 Request Entity Too Large
    RequestEntityTooLarge,
    /// 4.15 Unsupported Content-Format
    UnsupportedContentFormat,

    // Server error codes
    /// 5.00 Internal Server Error
    InternalServerError,
    /// 5.01 Not Implemented
    NotImplemented,
    /// 5.03 Service Unavailable
    ServiceUnavailable,
}

impl std::fmt::Display for ResponseCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (class, detail) = self.to_code_pair();
        write!(f, "{}.{:02}", class, detail)
    }
}

impl ResponseCode {
    /// Convert to CoAP response code format (class.detail)
    pub fn to_code_pair(self) -> (u8, u8) {
        match self {
            Self::Created => (2, 1),
            Self::Deleted => (2, 2),
            Self::Valid => (2, 3),
            Self::Changed => (2, 4),
            Self::Content => (2, 5),
            Self::BadRequest => (4, 0),
            Self::Unauthorized => (4, 1),
            Self::BadOption => (4, 2),
            Self::Forbidden => (4, 3),
            Self::NotFound => (4, 4),
            Self::MethodNotAllowed => (4, 5),
            Self::NotAcceptable => (4, 6),
            Self::RequestEntityTooLarge => (4, 13),
            Self::UnsupportedContentFormat => (4, 15),
            Self::InternalServerError => (5, 0),
            Self::NotImplemented => (5, 1),
            Self::ServiceUnavailable => (5, 3),
        }
    }

    pub fn from_code_pair(class: u8, detail: u8) -> Option<Self> {
        let code = match (class, detail) {
            (2, 1) => Self::Created,
            (2, 2) => Self::Deleted,
            (2, 3) => Self::Valid,
            (2, 4) => Self::Changed,
            (2, 5) => Self::Content,
            (4, 0) => Self::BadRequest,
            (4, 1) => Self::Unauthorized,
            (4, 2) => Self::BadOption,
            (4, 3) => Self::Forbidden,
            (4, 4) => Self::NotFound,
            (4, 5) => Self::MethodNotAllowed,
            (4, 6) => Self::NotAcceptable,
            (4, 13) => Self::RequestEntityTooLarge,
            (4, 15) => Self::UnsupportedContentFormat,
            (5, 0) => Self::InternalServerError,
            (5, 1) => Self::NotImplemented,
            (5, 3) => Self::ServiceUnavailable,
            _ => return None,
        };
        Some(code)
    }

    pub fn code(self) -> MessageCode {
        let (class, detail) = self.to_code_pair();
        MessageCode::new(class, detail)
    }

    pub fn from_code(code: MessageCode) -> Option<Self> {
        Self::from_code_pair(code.class(), code.detail())
    }

    pub fn class(self) -> ResponseClass {
        match self.to_code_pair().0 {
            2 => ResponseClass::Success,
            4 => ResponseClass::ClientError,
            _ => ResponseClass::ServerError,
        }
    }

    /// Check if this is a success code
    pub fn is_success(self) -> bool {
        self.class() == ResponseClass::Success
    }
}

/// Resource types advertised through discovery
pub mod resource_types {
    /// Single metric read by name
    pub const SENSOR: &str = "sensor";
    /// Full reading set
    pub const SENSOR_SNAPSHOT: &str = "sensor.snapshot";
}

/// Uri-Query items of a request, kept in wire order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryParams {
    items: Vec<String>,
}

impl QueryParams {
    /// Build from a `k=v&k2=v2` query string
    pub fn parse(query: &str) -> Self {
        Self {
            items: query
                .split('&')
                .filter(|part| !part.is_empty())
                .map(str::to_string)
                .collect(),
        }
    }

    pub fn from_items(items: Vec<String>) -> Self {
        Self { items }
    }

    /// Value of the first `key=value` item with the given key
    pub fn get(&self, key: &str) -> Option<&str> {
        self.items.iter().find_map(|item| match item.split_once('=') {
            Some((k, v)) if k == key => Some(v),
            _ => None,
        })
    }

    pub fn items(&self) -> &[String] {
        &self.items
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// Split `/a/b` into validated Uri-Path segments
pub fn split_path(path: &str) -> Result<Vec<String>> {
    let segments: Vec<String> = path
        .split('/')
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect();
    if let Some(long) = segments.iter().find(|s| s.len() > MAX_SEGMENT_LEN) {
        return Err(GatewayError::InvalidPath(format!(
            "segment of {} bytes in {path}",
            long.len()
        )));
    }
    Ok(segments)
}

/// A request (transport-agnostic)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    /// The request method
    pub method: Method,
    /// Target path segments
    pub path: Vec<String>,
    /// Query items
    pub query: QueryParams,
    /// Raw payload
    pub payload: Vec<u8>,
    /// Content format of the payload (raw option value)
    pub content_format: Option<u16>,
    /// Preferred response format (raw option value)
    pub accept: Option<u16>,
}

impl Request {
    /// Create a new request for the root path
    pub fn new(method: Method) -> Self {
        Self {
            method,
            path: Vec::new(),
            payload: Vec::new(),
            query: QueryParams::default(),
            content_format: None,
            accept: None,
        }
    }

    /// Set the target path
    pub fn with_path(mut self, path: &str) -> Result<Self> {
        self.path = split_path(path)?;
        Ok(self)
    }

    /// Set the payload
    pub fn with_payload(mut self, payload: Vec<u8>) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_content_format(mut self, format: ContentFormat) -> Self {
        self.content_format = Some(format.as_u16());
        self
    }

    pub fn with_accept(mut self, format: ContentFormat) -> Self {
        self.accept = Some(format.as_u16());
        self
    }

    /// Set query parameters
    pub fn with_query(mut self, query: QueryParams) -> Self {
        self.query = query;
        self
    }

    /// Path as `/a/b`
    pub fn path_string(&self) -> String {
        format!("/{}", self.path.join("/"))
    }

    /// Build from a received message; `None` for codes that are not a known method
    pub fn from_message(message: &Message) -> Option<Self> {
        let method = Method::from_code(message.code)?;
        Some(Self {
            method,
            path: message.uri_path(),
            query: QueryParams::from_items(message.uri_query()),
            payload: message.payload.clone(),
            content_format: message.content_format(),
            accept: message.accept(),
        })
    }

    /// Frame as a wire message with the given correlation fields
    pub fn to_message(&self, message_type: MessageType, message_id: u16, token: Token) -> Message {
        let mut message = Message::new(message_type, self.method.code(), message_id)
            .with_token(token)
            .with_payload(self.payload.clone());
        for segment in &self.path {
            message.add_option(options::URI_PATH, segment.as_bytes().to_vec());
        }
        if let Some(format) = self.content_format {
            message.add_uint_option(options::CONTENT_FORMAT, u32::from(format));
        }
        for item in self.query.items() {
            message.add_option(options::URI_QUERY, item.as_bytes().to_vec());
        }
        if let Some(accept) = self.accept {
            message.add_uint_option(options::ACCEPT, u32::from(accept));
        }
        message
    }
}

/// A response (transport-agnostic)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    /// Response code
    pub code: ResponseCode,
    /// Raw payload
    pub payload: Vec<u8>,
    /// Content format of the payload
    pub content_format: Option<ContentFormat>,
}

impl Response {
    /// Create a success response with content
    pub fn content(payload: Vec<u8>, format: ContentFormat) -> Self {
        Self {
            code: ResponseCode::Content,
            payload,
            content_format: Some(format),
        }
    }

    /// Create an error response with a text diagnostic
    pub fn error(code: ResponseCode, message: &str) -> Self {
        Self {
            code,
            payload: message.as_bytes().to_vec(),
            content_format: None,
        }
    }

    /// Create a not found error
    pub fn not_found(path: &str) -> Self {
        Self::error(
            ResponseCode::NotFound,
            &format!("Resource not found: {}", path),
        )
    }

    /// Create a method not allowed error
    pub fn method_not_allowed(method: Method) -> Self {
        Self::error(
            ResponseCode::MethodNotAllowed,
            &format!("Method {} not allowed", method),
        )
    }

    /// Payload as text (lossy)
    pub fn payload_text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }

    /// Build from a received message; `None` when the code is not a known response code
    pub fn from_message(message: &Message) -> Option<Self> {
        let code = ResponseCode::from_code(message.code)?;
        Some(Self {
            code,
            payload: message.payload.clone(),
            content_format: message.content_format().and_then(ContentFormat::from_u16),
        })
    }

    /// Frame as a wire message answering the given token
    pub fn to_message(&self, message_type: MessageType, message_id: u16, token: Token) -> Message {
        let mut message = Message::new(message_type, self.code.code(), message_id)
            .with_token(token)
            .with_payload(self.payload.clone());
        if let Some(format) = self.content_format {
            message.add_uint_option(options::CONTENT_FORMAT, u32::from(format.as_u16()));
        }
        message
    }
}
