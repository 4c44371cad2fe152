//! UDP server hosting a [`ResourceTree`]

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU16, Ordering};
use std::time::Duration;

use tokio::net::UdpSocket;
use tracing::{debug, info, warn};

use crate::coap_types::{Request, Response, ResponseCode};
use crate::error::Result;
use crate::message::{Message, MessageType};
use crate::resource::ResourceTree;

const RECV_BUFFER_SIZE: usize = 1500;

/// CoAP endpoint answering requests from a resource tree
pub struct CoapServer {
    socket: Arc<UdpSocket>,
    context: Arc<ServerContext>,
}

struct ServerContext {
    tree: Arc<ResourceTree>,
    next_message_id: AtomicU16,
}

impl CoapServer {
    pub async fn bind(addr: SocketAddr, tree: Arc<ResourceTree>) -> Result<Self> {
        let socket = UdpSocket::bind(addr).await?;
        Ok(Self {
            socket: Arc::new(socket),
            context: Arc::new(ServerContext {
                tree,
                next_message_id: AtomicU16::new(rand::random()),
            }),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Serve until `shutdown` completes
    ///
    /// Each datagram is handled on its own task, so a slow handler never
    /// holds up unrelated exchanges.
    pub async fn run(self, shutdown: impl Future<Output = ()>) -> Result<()> {
        info!(addr = %self.local_addr()?, resources = self.context.tree.len(), "CoAP server listening");
        tokio::pin!(shutdown);
        let mut buf = vec![0u8; RECV_BUFFER_SIZE];

        loop {
            let received = tokio::select! {
                _ = &mut shutdown => None,
                received = self.socket.recv_from(&mut buf) => Some(received),
            };

            let (len, peer) = match received {
                None => break,
                Some(Ok(received)) => received,
                Some(Err(e)) => {
                    warn!(error = %e, "server receive failed");
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    continue;
                }
            };

            let datagram = buf[..len].to_vec();
            let socket = self.socket.clone();
            let context = self.context.clone();
            tokio::spawn(async move {
                if let Some(reply) = context.handle_datagram(peer, &datagram) {
                    if let Err(e) = socket.send_to(&reply, peer).await {
                        warn!(%peer, error = %e, "failed to send reply");
                    }
                }
            });
        }

        info!("CoAP server stopped");
        Ok(())
    }
}

impl ServerContext {
    /// Produce the encoded reply for one datagram, if it warrants one
    fn handle_datagram(&self, peer: SocketAddr, datagram: &[u8]) -> Option<Vec<u8>> {
        let message = match Message::decode(datagram) {
            Ok(message) => message,
            Err(e) => {
                warn!(%peer, error = %e, "dropping malformed datagram");
                return None;
            }
        };

        if message.code.is_empty() {
            // CoAP ping
            if message.message_type == MessageType::Confirmable {
                debug!(%peer, mid = message.message_id, "answering ping with reset");
                return Message::reset(message.message_id).encode().ok();
            }
            return None;
        }

        if !message.code.is_request() {
            debug!(%peer, code = %message.code, "ignoring non-request message");
            return None;
        }

        let (reply_type, reply_id) = match message.message_type {
            MessageType::Confirmable => (MessageType::Acknowledgement, message.message_id),
            MessageType::NonConfirmable => (
                MessageType::NonConfirmable,
                self.next_message_id.fetch_add(1, Ordering::Relaxed),
            ),
            _ => {
                debug!(%peer, mid = message.message_id, "ignoring request in ack/reset");
                return None;
            }
        };

        let response = match Request::from_message(&message) {
            Some(request) => {
                let response = self.tree.dispatch(&request);
                info!(
                    %peer,
                    token = %message.token,
                    mid = message.message_id,
                    method = %request.method,
                    path = %request.path_string(),
                    code = %response.code,
                    "request handled"
                );
                response
            }
            None => {
                debug!(%peer, code = %message.code, "unsupported method");
                Response::error(ResponseCode::MethodNotAllowed, "Method not allowed")
            }
        };

        match response.to_message(reply_type, reply_id, message.token).encode() {
            Ok(bytes) => Some(bytes),
            Err(e) => {
                warn!(%peer, token = %message.token, error = %e, "response not encodable, sending 5.00");
                let fallback = Response {
                    code: ResponseCode::InternalServerError,
                    payload: Vec::new(),
                    content_format: None,
                };
                fallback
                    .to_message(reply_type, reply_id, message.token)
                    .encode()
                    .ok()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coap_types::{ContentFormat, Method};
    use crate::message::{MessageCode, Token};

    fn context() -> ServerContext {
        let mut tree = ResourceTree::new();
        tree.register("echo", |request: &Request| {
            Response::content(request.payload.clone(), ContentFormat::TextPlain)
        })
        .unwrap();
        tree.register("big", |_: &Request| {
            Response::content(vec![b'x'; 2000], ContentFormat::TextPlain)
        })
        .unwrap();
        ServerContext {
            tree: Arc::new(tree),
            next_message_id: AtomicU16::new(100),
        }
    }

    fn peer() -> SocketAddr {
        "127.0.0.1:40000".parse().unwrap()
    }

    fn request(message_type: MessageType, path: &str, payload: &[u8]) -> Vec<u8> {
        Request::new(Method::Get)
            .with_path(path)
            .unwrap()
            .with_payload(payload.to_vec())
            .to_message(message_type, 0x1234, Token::new(&[0xab, 0xcd]).unwrap())
            .encode()
            .unwrap()
    }

    #[test]
    fn test_confirmable_gets_piggybacked_ack() {
        let reply = context()
            .handle_datagram(peer(), &request(MessageType::Confirmable, "echo", b"hi"))
            .unwrap();
        let reply = Message::decode(&reply).unwrap();

        assert_eq!(reply.message_type, MessageType::Acknowledgement);
        assert_eq!(reply.message_id, 0x1234);
        assert_eq!(reply.token.as_bytes(), &[0xab, 0xcd]);
        assert_eq!(reply.code, ResponseCode::Content.code());
        assert_eq!(reply.payload, b"hi");
    }

    #[test]
    fn test_non_confirmable_gets_non_reply() {
        let reply = context()
            .handle_datagram(peer(), &request(MessageType::NonConfirmable, "echo", b""))
            .unwrap();
        let reply = Message::decode(&reply).unwrap();

        assert_eq!(reply.message_type, MessageType::NonConfirmable);
        assert_eq!(reply.message_id, 100);
        assert_eq!(reply.token.as_bytes(), &[0xab, 0xcd]);
    }

    #[test]
    fn test_ping_gets_reset() {
        let ping = Message::new(MessageType::Confirmable, MessageCode::EMPTY, 77)
            .encode()
            .unwrap();
        let reply = Message::decode(&context().handle_datagram(peer(), &ping).unwrap()).unwrap();

        assert_eq!(reply, Message::reset(77));
    }

    #[test]
    fn test_ignored_datagrams() {
        let ctx = context();
        assert!(ctx.handle_datagram(peer(), &[0x40, 0x01]).is_none());
        assert!(
            ctx.handle_datagram(peer(), &Message::empty_ack(5).encode().unwrap())
                .is_none()
        );
        let response = Response::content(b"1".to_vec(), ContentFormat::TextPlain)
            .to_message(MessageType::Confirmable, 9, Token::default())
            .encode()
            .unwrap();
        assert!(ctx.handle_datagram(peer(), &response).is_none());
    }

    #[test]
    fn test_unknown_method_and_oversize_response() {
        let ctx = context();
        let fetch = Message::new(MessageType::Confirmable, MessageCode::new(0, 5), 1)
            .encode()
            .unwrap();
        let reply = Message::decode(&ctx.handle_datagram(peer(), &fetch).unwrap()).unwrap();
        assert_eq!(reply.code, ResponseCode::MethodNotAllowed.code());

        let reply = ctx
            .handle_datagram(peer(), &request(MessageType::Confirmable, "big", b""))
            .unwrap();
        let reply = Message::decode(&reply).unwrap();
        assert_eq!(reply.code, ResponseCode::InternalServerError.code());
        assert!(reply.payload.is_empty());
    }
}
