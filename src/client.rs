//! Client request/response engine
//!
//! [`CoapClient`] owns one UDP socket and a background receive task. Each
//! outgoing request registers a [`PendingExchange`] under a fresh token; the
//! receive task resolves it when a response with that token arrives from
//! the same peer. Exchanges are bounded by a deadline and remove themselves
//! from the table when resolved, timed out, cancelled or dropped, so late
//! responses are decoded and discarded.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicU16, AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::net::UdpSocket;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::coap_types::{ContentFormat, Method, Request, Response};
use crate::config::ClientConfig;
use crate::error::{GatewayError, Result};
use crate::message::{Message, MessageType, Token};
use crate::resource::{Link, WELL_KNOWN_CORE};

/// Receive buffer; larger than any accepted message so oversize datagrams are detected
const RECV_BUFFER_SIZE: usize = 1500;

/// Lifecycle of one exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeState {
    Created,
    Sent,
    Resolved,
    TimedOut,
    Cancelled,
}

enum Reply {
    Response(Message),
    Reset,
}

struct PendingEntry {
    peer: SocketAddr,
    message_id: u16,
    /// Set once an empty ACK arrives; stops retransmission
    acknowledged: bool,
    reply: oneshot::Sender<Reply>,
}

type PendingTable = Arc<Mutex<HashMap<Token, PendingEntry>>>;

/// CoAP client for polling remote resources
pub struct CoapClient {
    socket: Arc<UdpSocket>,
    pending: PendingTable,
    next_token: AtomicU64,
    next_message_id: AtomicU16,
    timeout: Duration,
    ack_timeout: Duration,
    max_retransmit: u8,
    receiver: JoinHandle<()>,
}

impl CoapClient {
    /// Bind the local socket and start the receive task
    pub async fn bind(config: &ClientConfig) -> Result<Self> {
        config.validate()?;
        let socket = Arc::new(UdpSocket::bind(config.bind).await?);
        let pending: PendingTable = Arc::new(Mutex::new(HashMap::new()));
        let receiver = tokio::spawn(receive_loop(socket.clone(), pending.clone()));
        debug!(local = %socket.local_addr()?, "CoAP client bound");

        Ok(Self {
            socket,
            pending,
            next_token: AtomicU64::new(rand::random()),
            next_message_id: AtomicU16::new(rand::random()),
            timeout: config.timeout(),
            ack_timeout: config.ack_timeout(),
            max_retransmit: config.max_retransmit,
            receiver,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Number of exchanges currently awaiting a response
    pub fn pending_exchanges(&self) -> usize {
        self.pending.lock().len()
    }

    fn register(&self, peer: SocketAddr, message_id: u16, reply: oneshot::Sender<Reply>) -> Token {
        let mut table = self.pending.lock();
        loop {
            let token = Token::from_u64(self.next_token.fetch_add(1, Ordering::Relaxed));
            if let Entry::Vacant(slot) = table.entry(token) {
                slot.insert(PendingEntry {
                    peer,
                    message_id,
                    acknowledged: false,
                    reply,
                });
                return token;
            }
        }
    }

    /// Send a confirmable request and return the exchange awaiting its response
    pub async fn send(&self, peer: SocketAddr, request: &Request) -> Result<PendingExchange<'_>> {
        check_unicast(peer.ip())?;
        let message_id = self.next_message_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        let token = self.register(peer, message_id, tx);

        let mut exchange = PendingExchange {
            client: self,
            peer,
            token,
            message_id,
            datagram: Vec::new(),
            reply: rx,
            state: ExchangeState::Created,
        };

        // on any error below, dropping the exchange frees the token
        exchange.datagram = request
            .to_message(MessageType::Confirmable, message_id, token)
            .encode()?;
        self.socket.send_to(&exchange.datagram, peer).await?;
        exchange.state = ExchangeState::Sent;
        debug!(%peer, %token, mid = message_id, path = %request.path_string(), method = %request.method, "request sent");

        Ok(exchange)
    }

    /// Send a request and wait for a success response
    pub async fn request(&self, peer: SocketAddr, request: &Request) -> Result<Response> {
        let response = self.send(peer, request).await?.wait().await?;
        if response.code.is_success() {
            Ok(response)
        } else {
            Err(GatewayError::RemoteError {
                code: response.code.code(),
                message: response.payload_text().into_owned(),
            })
        }
    }

    /// GET `path` on `peer` with `payload` as the request body
    pub async fn request_get(&self, peer: SocketAddr, path: &str, payload: &[u8]) -> Result<Response> {
        let request = Request::new(Method::Get)
            .with_path(path)?
            .with_payload(payload.to_vec());
        self.request(peer, &request).await
    }

    /// GET a resource whose payload is a decimal number
    pub async fn read_value(&self, peer: SocketAddr, path: &str, payload: &[u8]) -> Result<f64> {
        let response = self.request_get(peer, path, payload).await?;
        parse_value(&response.payload)
    }

    /// List the peer's resources via `/.well-known/core`
    pub async fn discover(&self, peer: SocketAddr) -> Result<Vec<Link>> {
        let request = Request::new(Method::Get)
            .with_path(WELL_KNOWN_CORE)?
            .with_accept(ContentFormat::LinkFormat);
        let response = self.request(peer, &request).await?;
        let document = std::str::from_utf8(&response.payload)
            .map_err(|e| GatewayError::InvalidResponseFormat(e.to_string()))?;
        Link::parse_list(document)
    }
}

impl Drop for CoapClient {
    fn drop(&mut self) {
        self.receiver.abort();
    }
}

/// Replies are matched on the exact source address, so a target must be
/// one a reply can come back from
pub fn check_unicast(ip: IpAddr) -> Result<()> {
    if ip.is_unspecified() || ip.is_multicast() {
        return Err(GatewayError::InvalidConfig(format!(
            "{ip} is not a unicast address"
        )));
    }
    Ok(())
}

fn parse_value(payload: &[u8]) -> Result<f64> {
    let text = std::str::from_utf8(payload)
        .map_err(|_| GatewayError::InvalidResponseFormat("payload is not UTF-8".into()))?
        .trim();
    match text.parse::<f64>() {
        Ok(value) if value.is_finite() => Ok(value),
        _ => Err(GatewayError::InvalidResponseFormat(format!(
            "{text:?} is not a number"
        ))),
    }
}

/// An outstanding request awaiting its response
///
/// Dropping the exchange abandons it: the token is released and any late
/// response carrying it is discarded by the receive task.
pub struct PendingExchange<'a> {
    client: &'a CoapClient,
    peer: SocketAddr,
    token: Token,
    message_id: u16,
    datagram: Vec<u8>,
    reply: oneshot::Receiver<Reply>,
    state: ExchangeState,
}

impl PendingExchange<'_> {
    pub fn token(&self) -> Token {
        self.token
    }

    pub fn message_id(&self) -> u16 {
        self.message_id
    }

    pub fn state(&self) -> ExchangeState {
        self.state
    }

    /// Abandon the exchange before its deadline
    pub fn cancel(mut self) {
        self.state = ExchangeState::Cancelled;
        debug!(peer = %self.peer, token = %self.token, "exchange cancelled");
    }

    fn acknowledged(&self) -> bool {
        self.client
            .pending
            .lock()
            .get(&self.token)
            .is_some_and(|entry| entry.acknowledged)
    }

    /// Wait for the response, retransmitting if configured, until the deadline
    pub async fn wait(mut self) -> Result<Response> {
        let deadline = Instant::now() + self.client.timeout;
        let mut backoff = self.client.ack_timeout;
        let mut retransmits = 0u8;

        loop {
            let resend_at = (retransmits < self.client.max_retransmit)
                .then(|| Instant::now() + backoff)
                .filter(|at| *at < deadline);
            let wake_at = resend_at.unwrap_or(deadline);

            match tokio::time::timeout_at(wake_at, &mut self.reply).await {
                Ok(Ok(Reply::Response(message))) => {
                    self.state = ExchangeState::Resolved;
                    return match Response::from_message(&message) {
                        Some(response) => {
                            debug!(peer = %self.peer, token = %self.token, code = %response.code, "response received");
                            Ok(response)
                        }
                        None => Err(GatewayError::RemoteError {
                            code: message.code,
                            message: String::from_utf8_lossy(&message.payload).into_owned(),
                        }),
                    };
                }
                Ok(Ok(Reply::Reset)) => {
                    self.state = ExchangeState::Resolved;
                    warn!(peer = %self.peer, token = %self.token, "request reset by peer");
                    return Err(GatewayError::Reset { peer: self.peer });
                }
                Ok(Err(_)) | Err(_) if resend_at.is_none() => {
                    self.state = ExchangeState::TimedOut;
                    warn!(peer = %self.peer, token = %self.token, timeout = ?self.client.timeout, "no response before deadline");
                    return Err(GatewayError::NoResponse {
                        peer: self.peer,
                        timeout: self.client.timeout,
                    });
                }
                Ok(Err(_)) => {
                    // sender vanished without a reply; nothing left to wait for
                    self.state = ExchangeState::TimedOut;
                    return Err(GatewayError::NoResponse {
                        peer: self.peer,
                        timeout: self.client.timeout,
                    });
                }
                Err(_) => {
                    retransmits += 1;
                    backoff *= 2;
                    if self.acknowledged() {
                        continue;
                    }
                    debug!(peer = %self.peer, token = %self.token, attempt = retransmits, "retransmitting request");
                    self.client.socket.send_to(&self.datagram, self.peer).await?;
                }
            }
        }
    }
}

impl Drop for PendingExchange<'_> {
    fn drop(&mut self) {
        self.client.pending.lock().remove(&self.token);
    }
}

async fn receive_loop(socket: Arc<UdpSocket>, pending: PendingTable) {
    let mut buf = vec![0u8; RECV_BUFFER_SIZE];
    loop {
        let (len, peer) = match socket.recv_from(&mut buf).await {
            Ok(received) => received,
            Err(e) => {
                warn!(error = %e, "client receive failed");
                tokio::time::sleep(Duration::from_millis(10)).await;
                continue;
            }
        };

        let message = match Message::decode(&buf[..len]) {
            Ok(message) => message,
            Err(e) => {
                warn!(%peer, error = %e, "dropping malformed datagram");
                continue;
            }
        };

        if let Some(ack) = route(&pending, peer, message) {
            match ack.encode() {
                Ok(bytes) => {
                    if let Err(e) = socket.send_to(&bytes, peer).await {
                        warn!(%peer, error = %e, "failed to acknowledge response");
                    }
                }
                Err(e) => warn!(%peer, error = %e, "failed to encode acknowledgement"),
            }
        }
    }
}

/// Deliver an incoming message to its exchange; returns an ACK to send, if any
fn route(pending: &PendingTable, peer: SocketAddr, message: Message) -> Option<Message> {
    let mut table = pending.lock();

    match message.message_type {
        MessageType::Reset => {
            let token = table
                .iter()
                .find(|(_, e)| e.peer == peer && e.message_id == message.message_id)
                .map(|(token, _)| *token);
            match token.and_then(|token| table.remove(&token)) {
                Some(entry) => {
                    let _ = entry.reply.send(Reply::Reset);
                }
                None => debug!(%peer, mid = message.message_id, "ignoring unmatched reset"),
            }
            None
        }
        MessageType::Acknowledgement if message.code.is_empty() => {
            if let Some(entry) = table
                .values_mut()
                .find(|e| e.peer == peer && e.message_id == message.message_id)
            {
                entry.acknowledged = true;
            }
            None
        }
        _ if message.code.is_response() => {
            let confirmable = message.message_type == MessageType::Confirmable;
            let message_id = message.message_id;
            let token = message.token;

            match table.entry(token) {
                Entry::Occupied(slot) if slot.get().peer == peer => {
                    let entry = slot.remove();
                    if entry.reply.send(Reply::Response(message)).is_err() {
                        debug!(%peer, %token, "exchange abandoned before delivery");
                    }
                    confirmable.then(|| Message::empty_ack(message_id))
                }
                _ => {
                    info!(%peer, %token, code = %message.code, "discarding response with no pending exchange");
                    // RFC 7252 §4.2: reject so the peer stops retransmitting
                    confirmable.then(|| Message::reset(message_id))
                }
            }
        }
        _ => {
            debug!(%peer, code = %message.code, "ignoring non-response message");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_value() {
        assert_eq!(parse_value(b"23.5").unwrap(), 23.5);
        assert_eq!(parse_value(b" 1001.3\n").unwrap(), 1001.3);
        for bad in [&b"not_a_number"[..], b"", b"NaN", b"inf", b"\xff"] {
            assert!(matches!(
                parse_value(bad),
                Err(GatewayError::InvalidResponseFormat(_))
            ));
        }
    }

    #[test]
    fn test_check_unicast() {
        assert!(check_unicast("127.0.0.1".parse().unwrap()).is_ok());
        assert!(check_unicast("fe80::1".parse().unwrap()).is_ok());
        for ip in ["0.0.0.0", "::", "224.0.1.187", "ff02::fd"] {
            assert!(matches!(
                check_unicast(ip.parse().unwrap()),
                Err(GatewayError::InvalidConfig(_))
            ));
        }
    }

    fn entry(peer: SocketAddr, message_id: u16) -> (PendingEntry, oneshot::Receiver<Reply>) {
        let (tx, rx) = oneshot::channel();
        let entry = PendingEntry {
            peer,
            message_id,
            acknowledged: false,
            reply: tx,
        };
        (entry, rx)
    }

    #[test]
    fn test_route_matches_token_and_peer() {
        let pending: PendingTable = Arc::new(Mutex::new(HashMap::new()));
        let peer: SocketAddr = "127.0.0.1:5683".parse().unwrap();
        let other: SocketAddr = "127.0.0.1:5684".parse().unwrap();
        let token = Token::from_u64(9);
        let (pending_entry, mut rx) = entry(peer, 100);
        pending.lock().insert(token, pending_entry);

        let response = Response::content(b"1.5".to_vec(), ContentFormat::TextPlain)
            .to_message(MessageType::Confirmable, 555, token);

        // same token from another peer is not ours
        let reply = route(&pending, other, response.clone());
        assert_eq!(reply, Some(Message::reset(555)));
        assert_eq!(pending.lock().len(), 1);

        let ack = route(&pending, peer, response.clone());
        assert_eq!(ack, Some(Message::empty_ack(555)));
        assert!(pending.lock().is_empty());
        assert!(matches!(rx.try_recv(), Ok(Reply::Response(m)) if m == response));
    }

    #[test]
    fn test_route_empty_ack_and_reset() {
        let pending: PendingTable = Arc::new(Mutex::new(HashMap::new()));
        let peer: SocketAddr = "127.0.0.1:5683".parse().unwrap();
        let token = Token::from_u64(1);
        let (pending_entry, mut rx) = entry(peer, 7);
        pending.lock().insert(token, pending_entry);

        assert_eq!(route(&pending, peer, Message::empty_ack(7)), None);
        assert!(pending.lock()[&token].acknowledged);

        assert_eq!(route(&pending, peer, Message::reset(7)), None);
        assert!(pending.lock().is_empty());
        assert!(matches!(rx.try_recv(), Ok(Reply::Reset)));
    }

    #[test]
    fn test_late_response_is_discarded() {
        let pending: PendingTable = Arc::new(Mutex::new(HashMap::new()));
        let peer: SocketAddr = "127.0.0.1:5683".parse().unwrap();
        let late = Response::content(b"2.0".to_vec(), ContentFormat::TextPlain).to_message(
            MessageType::Acknowledgement,
            3,
            Token::from_u64(42),
        );

        assert_eq!(route(&pending, peer, late), None);
        assert!(pending.lock().is_empty());
    }

    #[test]
    fn test_unmatched_confirmable_response_is_reset() {
        let pending: PendingTable = Arc::new(Mutex::new(HashMap::new()));
        let peer: SocketAddr = "127.0.0.1:5683".parse().unwrap();
        let separate = Response::content(b"2.0".to_vec(), ContentFormat::TextPlain).to_message(
            MessageType::Confirmable,
            0x0b0b,
            Token::from_u64(77),
        );

        assert_eq!(route(&pending, peer, separate), Some(Message::reset(0x0b0b)));
        assert!(pending.lock().is_empty());
    }
}
