use std::collections::HashMap;
use std::convert::TryFrom;
use std::io::ErrorKind;
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{channel, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::key::Key;
use crate::node::contact::Contact;
use crate::{lock, MESSAGE_LENGTH, SOCKET_POLL_INTERVAL};

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageType {
    Ping,
    Pong,
    Store,
    FindNode,
    FindValue,
    Reply,
}

#[derive(Serialize, Deserialize, Debug, Default)]
struct Body {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    key: Option<Key>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    contacts: Option<Vec<Contact>>,
}

/// The layout of a message on the wire.
#[derive(Serialize, Deserialize, Debug)]
struct Envelope {
    #[serde(rename = "type")]
    message_type: MessageType,
    #[serde(rename = "fromID")]
    from_id: Key,
    #[serde(rename = "requestID")]
    request_id: Key,
    #[serde(default)]
    body: Body,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Ping,
    Pong,
    Store(Key, String),
    FindNode(Key),
    FindValue(Key),
    Reply(Reply),
}

/// The body of a `REPLY`, which answers both `FIND_NODE` and `FIND_VALUE`.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Contacts(Vec<Contact>),
    Value(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub from_id: Key,
    pub request_id: Key,
    pub payload: Payload,
}

impl Message {
    pub fn encode(&self) -> Result<Vec<u8>> {
        let buffer = serde_json::to_vec(&Envelope::from(self))?;
        if buffer.len() > MESSAGE_LENGTH {
            return Err(Error::MessageTooLarge(buffer.len()));
        }
        Ok(buffer)
    }

    pub fn decode(buffer: &[u8]) -> Result<Self> {
        let envelope: Envelope = serde_json::from_slice(buffer)?;
        Message::try_from(envelope)
    }
}

impl<'a> From<&'a Message> for Envelope {
    fn from(message: &'a Message) -> Self {
        let (message_type, body) = match message.payload.clone() {
            Payload::Ping => (MessageType::Ping, Body::default()),
            Payload::Pong => (MessageType::Pong, Body::default()),
            Payload::Store(key, value) => (
                MessageType::Store,
                Body {
                    key: Some(key),
                    value: Some(value),
                    ..Body::default()
                },
            ),
            Payload::FindNode(key) => (
                MessageType::FindNode,
                Body {
                    key: Some(key),
                    ..Body::default()
                },
            ),
            Payload::FindValue(key) => (
                MessageType::FindValue,
                Body {
                    key: Some(key),
                    ..Body::default()
                },
            ),
            Payload::Reply(Reply::Contacts(contacts)) => (
                MessageType::Reply,
                Body {
                    contacts: Some(contacts),
                    ..Body::default()
                },
            ),
            Payload::Reply(Reply::Value(value)) => (
                MessageType::Reply,
                Body {
                    value: Some(value),
                    ..Body::default()
                },
            ),
        };
        Envelope {
            message_type,
            from_id: message.from_id,
            request_id: message.request_id,
            body,
        }
    }
}

impl TryFrom<Envelope> for Message {
    type Error = Error;

    fn try_from(envelope: Envelope) -> Result<Self> {
        let Envelope {
            message_type,
            from_id,
            request_id,
            body,
        } = envelope;
        let missing = |field: &str| {
            Error::MalformedMessage(format!("{:?} without {}", message_type, field))
        };

        let payload = match message_type {
            MessageType::Ping => Payload::Ping,
            MessageType::Pong => Payload::Pong,
            MessageType::Store => Payload::Store(
                body.key.ok_or_else(|| missing("key"))?,
                body.value.ok_or_else(|| missing("value"))?,
            ),
            MessageType::FindNode => Payload::FindNode(body.key.ok_or_else(|| missing("key"))?),
            MessageType::FindValue => Payload::FindValue(body.key.ok_or_else(|| missing("key"))?),
            MessageType::Reply => match (body.value, body.contacts) {
                (Some(value), _) => Payload::Reply(Reply::Value(value)),
                (None, Some(contacts)) => Payload::Reply(Reply::Contacts(contacts)),
                (None, None) => return Err(missing("value or contacts")),
            },
        };

        Ok(Message {
            from_id,
            request_id,
            payload,
        })
    }
}

/// The RPC endpoint of a node.
///
/// Every request is tagged with a fresh request id and registered in `pending_requests` before it
/// is sent. The reply and the timeout race to remove the registration, so exactly one of them
/// resolves the request.
pub struct Protocol {
    id: Key,
    socket: Mutex<Option<Arc<UdpSocket>>>,
    local_addr: SocketAddr,
    pending_requests: Mutex<HashMap<Key, Sender<Message>>>,
    is_open: Arc<AtomicBool>,
    timeout: Duration,
}

impl Protocol {
    /// Starts a thread that decodes the datagrams received on `socket` and forwards them with
    /// their source address to `tx`.
    pub fn new(
        id: Key,
        socket: UdpSocket,
        tx: Sender<(Message, SocketAddr)>,
        timeout: u64,
    ) -> Result<Protocol> {
        socket.set_read_timeout(Some(Duration::from_millis(SOCKET_POLL_INTERVAL)))?;
        let local_addr = socket.local_addr()?;
        let socket = Arc::new(socket);
        let is_open = Arc::new(AtomicBool::new(true));

        let receiver_socket = Arc::clone(&socket);
        let receiver_is_open = Arc::clone(&is_open);
        thread::spawn(move || {
            let mut buffer = vec![0u8; MESSAGE_LENGTH];
            while receiver_is_open.load(Ordering::Acquire) {
                let (len, src_addr) = match receiver_socket.recv_from(&mut buffer) {
                    Ok(received) => received,
                    Err(ref err)
                        if err.kind() == ErrorKind::WouldBlock
                            || err.kind() == ErrorKind::TimedOut =>
                    {
                        continue
                    },
                    Err(err) => {
                        warn!("Protocol: Could not receive data: {}", err);
                        continue;
                    },
                };

                match Message::decode(&buffer[..len]) {
                    Ok(message) => {
                        if tx.send((message, src_addr)).is_err() {
                            warn!("Protocol: Connection closed.");
                            break;
                        }
                    },
                    Err(err) => warn!("Protocol: Dropped message from {}: {}", src_addr, err),
                }
            }
            debug!("{} - Closed socket", local_addr);
        });

        Ok(Protocol {
            id,
            socket: Mutex::new(Some(socket)),
            local_addr,
            pending_requests: Mutex::new(HashMap::new()),
            is_open,
            timeout: Duration::from_millis(timeout),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn is_open(&self) -> bool {
        self.is_open.load(Ordering::Acquire)
    }

    /// Sends `message` without waiting for anything in return. Returns `false` if the message
    /// could not be sent.
    pub fn send_message(&self, message: &Message, dest: SocketAddr) -> bool {
        let socket = match lock(&self.socket).as_ref() {
            Some(socket) => Arc::clone(socket),
            None => return false,
        };
        let buffer = match message.encode() {
            Ok(buffer) => buffer,
            Err(err) => {
                warn!("Protocol: Could not encode message to {}: {}", dest, err);
                return false;
            },
        };
        if let Err(err) = socket.send_to(&buffer, dest) {
            warn!("Protocol: Could not send data to {}: {}", dest, err);
            return false;
        }
        true
    }

    /// Sends a one way message, such as a `STORE`, with a fresh request id.
    pub fn send(&self, dest: &Contact, payload: Payload) -> bool {
        let message = Message {
            from_id: self.id,
            request_id: Key::rand(),
            payload,
        };
        self.send_message(&message, dest.addr())
    }

    /// Answers the request `request_id` received from `dest`.
    pub fn reply(&self, dest: SocketAddr, request_id: Key, payload: Payload) -> bool {
        let message = Message {
            from_id: self.id,
            request_id,
            payload,
        };
        self.send_message(&message, dest)
    }

    /// Sends a request and blocks until the correlated reply arrives or the request times out.
    /// Returns `None` on timeout or if the endpoint is closed meanwhile.
    pub fn send_request(&self, dest: &Contact, payload: Payload) -> Option<Message> {
        if !self.is_open() {
            return None;
        }

        let (response_tx, response_rx) = channel();
        let token = {
            let mut pending_requests = lock(&self.pending_requests);
            let mut token = Key::rand();
            while pending_requests.contains_key(&token) {
                token = Key::rand();
            }
            pending_requests.insert(token, response_tx);
            token
        };

        let message = Message {
            from_id: self.id,
            request_id: token,
            payload,
        };
        if !self.send_message(&message, dest.addr()) {
            lock(&self.pending_requests).remove(&token);
            return None;
        }

        match response_rx.recv_timeout(self.timeout) {
            Ok(response) => Some(response),
            Err(RecvTimeoutError::Timeout) => {
                if lock(&self.pending_requests).remove(&token).is_some() {
                    warn!(
                        "{} - Request to {:?} timed out after waiting for {} milliseconds",
                        self.local_addr,
                        dest,
                        self.timeout.as_millis(),
                    );
                    None
                } else {
                    // the reply was delivered between the timeout and the removal
                    response_rx.try_recv().ok()
                }
            },
            Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    /// Hands a `PONG` or `REPLY` to the request waiting for it. Returns `false` if no request is
    /// waiting, either because it already timed out or because it never existed.
    pub fn deliver(&self, message: Message) -> bool {
        let mut pending_requests = lock(&self.pending_requests);
        match pending_requests.remove(&message.request_id) {
            Some(sender) => sender.send(message).is_ok(),
            None => false,
        }
    }

    /// Returns the number of requests waiting for a reply.
    pub fn pending_count(&self) -> usize {
        lock(&self.pending_requests).len()
    }

    /// Closes the socket and fails every pending request.
    pub fn close(&self) {
        self.is_open.store(false, Ordering::Release);
        lock(&self.socket).take();
        lock(&self.pending_requests).clear();
    }
}

#[cfg(test)]
mod tests {
    use std::net::{SocketAddr, UdpSocket};
    use std::sync::mpsc::{channel, Receiver};
    use std::sync::Arc;
    use std::thread;
    use std::time::{Duration, Instant};

    use super::{Message, Payload, Protocol, Reply};
    use crate::key::Key;
    use crate::node::contact::Contact;

    fn bind(timeout: u64) -> (Arc<Protocol>, Receiver<(Message, SocketAddr)>) {
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        let (tx, rx) = channel();
        (Arc::new(Protocol::new(Key::rand(), socket, tx, timeout).unwrap()), rx)
    }

    fn contact_of(protocol: &Protocol) -> Contact {
        Contact::new(protocol.id, protocol.local_addr())
    }

    #[test]
    fn test_wire_format() {
        let from_id = Key::rand();
        let request_id = Key::rand();
        let key = Key::hash(b"cool");
        let message = Message {
            from_id,
            request_id,
            payload: Payload::Store(key, "cool".to_string()),
        };
        let json: serde_json::Value = serde_json::from_slice(&message.encode().unwrap()).unwrap();
        assert_eq!(json["type"], "STORE");
        assert_eq!(json["fromID"], from_id.to_string());
        assert_eq!(json["requestID"], request_id.to_string());
        assert_eq!(json["body"]["key"], key.to_string());
        assert_eq!(json["body"]["value"], "cool");
        assert_eq!(Message::decode(&message.encode().unwrap()).unwrap(), message);

        let find = Message {
            payload: Payload::FindNode(key),
            ..message.clone()
        };
        let json: serde_json::Value = serde_json::from_slice(&find.encode().unwrap()).unwrap();
        assert_eq!(json["type"], "FIND_NODE");
    }

    #[test]
    fn test_reply_body_decides_payload() {
        let from_id = Key::rand();
        let request_id = Key::rand();
        let value_reply = format!(
            r#"{{"type":"REPLY","fromID":"{}","requestID":"{}","body":{{"value":"cool"}}}}"#,
            from_id, request_id,
        );
        assert_eq!(
            Message::decode(value_reply.as_bytes()).unwrap().payload,
            Payload::Reply(Reply::Value("cool".to_string())),
        );

        let contacts_reply = format!(
            r#"{{"type":"REPLY","fromID":"{}","requestID":"{}","body":{{"contacts":[{{"nodeID":"{}","ip":"127.0.0.1","port":4000}}]}}}}"#,
            from_id, request_id, from_id,
        );
        match Message::decode(contacts_reply.as_bytes()).unwrap().payload {
            Payload::Reply(Reply::Contacts(contacts)) => {
                assert_eq!(contacts.len(), 1);
                assert_eq!(contacts[0].id, from_id);
                assert_eq!(contacts[0].port, 4000);
            },
            payload => panic!("unexpected payload {:?}", payload),
        }

        let pong = format!(
            r#"{{"type":"PONG","fromID":"{}","requestID":"{}"}}"#,
            from_id, request_id,
        );
        assert_eq!(Message::decode(pong.as_bytes()).unwrap().payload, Payload::Pong);
    }

    #[test]
    fn test_malformed_messages() {
        let from_id = Key::rand();
        let empty_reply = format!(
            r#"{{"type":"REPLY","fromID":"{}","requestID":"{}","body":{{}}}}"#,
            from_id, from_id,
        );
        assert!(Message::decode(empty_reply.as_bytes()).is_err());

        let keyless_store = format!(
            r#"{{"type":"STORE","fromID":"{}","requestID":"{}","body":{{"value":"cool"}}}}"#,
            from_id, from_id,
        );
        assert!(Message::decode(keyless_store.as_bytes()).is_err());

        let unknown = format!(
            r#"{{"type":"JOIN","fromID":"{}","requestID":"{}"}}"#,
            from_id, from_id,
        );
        assert!(Message::decode(unknown.as_bytes()).is_err());
        assert!(Message::decode(b"not json").is_err());
    }

    #[test]
    fn test_message_too_large() {
        let message = Message {
            from_id: Key::rand(),
            request_id: Key::rand(),
            payload: Payload::Reply(Reply::Value("x".repeat(70_000))),
        };
        assert!(message.encode().is_err());
    }

    #[test]
    fn test_request_reply() {
        let (client, client_rx) = bind(1000);
        let (server, server_rx) = bind(1000);

        let server_clone = Arc::clone(&server);
        thread::spawn(move || {
            for (message, src_addr) in server_rx.iter() {
                if let Payload::Ping = message.payload {
                    server_clone.reply(src_addr, message.request_id, Payload::Pong);
                }
            }
        });
        let client_clone = Arc::clone(&client);
        thread::spawn(move || {
            for (message, _) in client_rx.iter() {
                client_clone.deliver(message);
            }
        });

        let response = client.send_request(&contact_of(&server), Payload::Ping).unwrap();
        assert_eq!(response.payload, Payload::Pong);
        assert_eq!(response.from_id, server.id);
        assert_eq!(client.pending_count(), 0);
    }

    #[test]
    fn test_request_timeout() {
        let (client, _client_rx) = bind(100);
        let silent = UdpSocket::bind("127.0.0.1:0").unwrap();
        let dest = Contact::new(Key::rand(), silent.local_addr().unwrap());

        let start = Instant::now();
        assert_eq!(client.send_request(&dest, Payload::Ping), None);
        assert!(start.elapsed() >= Duration::from_millis(100));
        assert_eq!(client.pending_count(), 0);

        // a reply to a request that already timed out is dropped
        let stale = Message {
            from_id: dest.id,
            request_id: Key::rand(),
            payload: Payload::Pong,
        };
        assert!(!client.deliver(stale));
    }

    #[test]
    fn test_close() {
        let (client, _client_rx) = bind(5000);
        let silent = UdpSocket::bind("127.0.0.1:0").unwrap();
        let dest = Contact::new(Key::rand(), silent.local_addr().unwrap());

        let client_clone = Arc::clone(&client);
        let waiter = thread::spawn(move || client_clone.send_request(&dest, Payload::Ping));
        thread::sleep(Duration::from_millis(100));

        let start = Instant::now();
        client.close();
        assert_eq!(waiter.join().unwrap(), None);
        assert!(start.elapsed() < Duration::from_millis(5000));
        assert!(!client.is_open());
        assert_eq!(client.pending_count(), 0);
        assert!(!client.send(&contact_of(&client), Payload::Ping));
    }
}
