//! Per-connection state machine: handshake, authentication, message
//! loop.
//!
//! Owns a split `TcpStream` for its whole life: the read half is
//! driven directly by this session's own task, while the write half is
//! shared (behind a mutex) with the [`SessionOutbox`] the fabric uses
//! to push broadcasts back to this connection.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};

use aonet_crypto::{KeyExchange, SecureChannel};
use aonet_protocol::{self as protocol, Message, MessageType};

use crate::error::{SessionError, Violation};
use crate::fabric::{Fabric, Outbox, GENERAL};

const MIN_USERNAME_LEN: usize = 2;

/// All state associated with one accepted transport, from accept to
/// close.
pub struct Session {
    peer_addr: SocketAddr,
    read: OwnedReadHalf,
    write: Arc<tokio::sync::Mutex<OwnedWriteHalf>>,
    secure_channel: Arc<SecureChannel>,
    key_exchange: KeyExchange,
    username: Option<String>,
    authenticated: bool,
    current_channel: String,
}

impl Session {
    pub fn new(read: OwnedReadHalf, write: OwnedWriteHalf, peer_addr: SocketAddr) -> Self {
        Self {
            peer_addr,
            read,
            write: Arc::new(tokio::sync::Mutex::new(write)),
            secure_channel: Arc::new(SecureChannel::new()),
            key_exchange: KeyExchange::new(),
            username: None,
            authenticated: false,
            current_channel: GENERAL.to_string(),
        }
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn username(&self) -> Option<&str> {
        self.username.as_deref()
    }

    /// Read one framed record, length-prefix first, then the record
    /// itself. Any short read collapses to [`SessionError::TransportClosed`]
    /// or [`SessionError::ShortRead`].
    async fn read_frame(&mut self) -> Result<Vec<u8>, SessionError> {
        let mut len_buf = [0u8; 4];
        match self.read.read_exact(&mut len_buf).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Err(SessionError::TransportClosed)
            }
            Err(e) => return Err(e.into()),
        }

        let len = protocol::framing::read_length_prefix(len_buf) as usize;
        let mut body = vec![0u8; len];
        match self.read.read_exact(&mut body).await {
            Ok(_) => Ok(body),
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Err(SessionError::ShortRead),
            Err(e) => Err(e.into()),
        }
    }

    /// Read one plaintext record and decode it.
    async fn read_plain(&mut self) -> Result<Message, SessionError> {
        let record = self.read_frame().await?;
        Ok(protocol::decode(&record)?)
    }

    /// Read one encrypted record, decrypt, then decode.
    async fn read_encrypted(&mut self) -> Result<Message, SessionError> {
        let record = self.read_frame().await?;
        if record.len() < 12 {
            return Err(SessionError::DecryptAuthFail);
        }
        let (nonce, ciphertext) = record.split_at(12);
        let plaintext = self.secure_channel.decrypt(nonce, ciphertext)?;
        Ok(protocol::decode(&plaintext)?)
    }

    /// Send a message, optionally through the secure channel, prefixed
    /// with its 4-byte length.
    async fn send(&self, message: &Message, encrypted: bool) -> Result<(), SessionError> {
        let encoded = protocol::encode(message.version, message.msg_type, message.msg_id, &message.body);

        let record = if encrypted {
            let (nonce, ciphertext) = self.secure_channel.encrypt(&encoded)?;
            let mut combined = nonce;
            combined.extend_from_slice(&ciphertext);
            combined
        } else {
            encoded
        };

        let framed = protocol::framing::frame(&record);
        let mut write = self.write.lock().await;
        write.write_all(&framed).await?;
        write.flush().await?;
        Ok(())
    }

    async fn send_plain(&self, msg_type: MessageType, body: Vec<u8>) -> Result<(), SessionError> {
        self.send(&Message::new(msg_type, body), false).await
    }

    async fn send_encrypted(&self, msg_type: MessageType, body: Vec<u8>) -> Result<(), SessionError> {
        self.send(&Message::new(msg_type, body), true).await
    }

    /// (1) Read one framed, unencrypted `HI` with a 32-byte public key.
    /// (2) Derive the shared key and initialize the secure channel.
    /// (3) Reply with our own `HI`.
    pub async fn do_handshake(&mut self) -> Result<(), SessionError> {
        log::debug!("waiting for HI from {}", self.peer_addr);
        let msg = self.read_plain().await?;

        if msg.msg_type != MessageType::Hi {
            return Err(SessionError::ProtocolViolation(Violation::ExpectedHi));
        }
        if msg.body.len() != 32 {
            return Err(SessionError::ProtocolViolation(Violation::BadPubkeyLength));
        }

        let mut peer_public = [0u8; 32];
        peer_public.copy_from_slice(&msg.body);
        let shared_key = self.key_exchange.derive_shared_key(&peer_public);
        Arc::get_mut(&mut self.secure_channel)
            .expect("secure_channel not yet shared with an outbox")
            .initialize(shared_key);

        log::info!("key exchange complete with {}", self.peer_addr);

        let our_public = self.key_exchange.public_bytes();
        self.send_plain(MessageType::Hi, our_public.to_vec()).await?;

        Ok(())
    }

    /// Read one encrypted `AUTH`, validate the claimed name, and either
    /// accept (registering with `fabric`) or reject.
    pub async fn authenticate(&mut self, fabric: &Fabric) -> Result<(), SessionError> {
        let msg = self.read_encrypted().await?;
        if msg.msg_type != MessageType::Auth {
            return Err(SessionError::ProtocolViolation(Violation::ExpectedAuth));
        }

        let name = String::from_utf8_lossy(&msg.body).trim().to_string();
        if name.chars().count() < MIN_USERNAME_LEN {
            self.send_encrypted(
                MessageType::AuthFail,
                b"username too short".to_vec(),
            )
            .await?;
            return Err(SessionError::ProtocolViolation(Violation::BadUsername));
        }

        self.username = Some(name.clone());
        self.authenticated = true;
        self.current_channel = GENERAL.to_string();

        self.send_encrypted(MessageType::AuthOk, b"welcome to aonet".to_vec()).await?;

        let outbox: Arc<dyn Outbox> = Arc::new(SessionOutbox::new(
            Arc::clone(&self.write),
            Arc::clone(&self.secure_channel),
        ));
        fabric.add_user(&name, outbox).await;

        let notice = format!("{name} joined");
        fabric
            .broadcast(GENERAL, Message::new(MessageType::Online, notice.into_bytes()), Some(&name))
            .await;

        log::info!("{name} authenticated from {}", self.peer_addr);
        Ok(())
    }

    /// Drive the message loop until the peer disconnects, sends
    /// `ADIOS`, or breaks a protocol rule. Always removes the user from
    /// `fabric` on the way out (which itself broadcasts an `OFFLINE`).
    pub async fn run_loop(&mut self, fabric: &Fabric) -> Result<(), SessionError> {
        let name = self.username.clone().expect("run_loop requires authentication");

        let result = self.dispatch_loop(fabric, &name).await;

        fabric.remove_user(&name).await;
        fabric
            .broadcast(
                &self.current_channel,
                Message::new(MessageType::Offline, format!("{name} left").into_bytes()),
                None,
            )
            .await;

        log::info!("{name} session ended: {:?}", result.as_ref().err());
        result
    }

    async fn dispatch_loop(&mut self, fabric: &Fabric, name: &str) -> Result<(), SessionError> {
        loop {
            let msg = self.read_encrypted().await?;

            match msg.msg_type {
                MessageType::Text => {
                    let text = String::from_utf8_lossy(&msg.body);
                    let payload = format!("[{name}] {text}");
                    fabric
                        .broadcast(
                            &self.current_channel,
                            Message::new(MessageType::Text, payload.into_bytes()),
                            Some(name),
                        )
                        .await;
                }
                MessageType::Dm => {
                    let raw = String::from_utf8_lossy(&msg.body);
                    if let Some((target, text)) = raw.split_once(':') {
                        let payload = format!("[{name}] {text}");
                        fabric
                            .direct_send(target, Message::new(MessageType::Dm, payload.into_bytes()))
                            .await;
                    }
                }
                MessageType::Sup => {
                    let channel = String::from_utf8_lossy(&msg.body).to_string();

                    fabric
                        .broadcast(
                            &self.current_channel,
                            Message::new(MessageType::Offline, format!("{name} left").into_bytes()),
                            None,
                        )
                        .await;

                    fabric.join_channel(name, &channel).await;
                    self.current_channel = channel.clone();

                    fabric
                        .broadcast(
                            &channel,
                            Message::new(MessageType::Online, format!("{name} joined").into_bytes()),
                            Some(name),
                        )
                        .await;

                    self.send_encrypted(
                        MessageType::Sup,
                        format!("Joined #{channel}").into_bytes(),
                    )
                    .await?;
                }
                MessageType::Adios => {
                    log::info!("{name} said ADIOS");
                    return Ok(());
                }
                MessageType::Image | MessageType::Typing => {
                    // Reserved; accepted on the wire, dropped here.
                }
                MessageType::Hi
                | MessageType::Auth
                | MessageType::AuthOk
                | MessageType::AuthFail
                | MessageType::Online
                | MessageType::Offline => {
                    return Err(SessionError::ProtocolViolation(Violation::UnexpectedServerType));
                }
                MessageType::Shit => {
                    // Reserved; accepted on the wire, dropped here.
                }
            }
        }
    }
}

/// Adapts a [`Session`]'s write half into the [`Outbox`] the fabric
/// holds for broadcast/direct-send, so the fabric never needs to know
/// about encryption.
pub struct SessionOutbox {
    write: Arc<tokio::sync::Mutex<OwnedWriteHalf>>,
    secure_channel: Arc<SecureChannel>,
}

impl SessionOutbox {
    pub fn new(write: Arc<tokio::sync::Mutex<OwnedWriteHalf>>, secure_channel: Arc<SecureChannel>) -> Self {
        Self { write, secure_channel }
    }
}

#[async_trait::async_trait]
impl Outbox for SessionOutbox {
    async fn deliver(&self, message: Message) -> bool {
        let encoded = protocol::encode(message.version, message.msg_type, message.msg_id, &message.body);

        let (nonce, ciphertext) = match self.secure_channel.encrypt(&encoded) {
            Ok(pair) => pair,
            Err(_) => return false,
        };
        let mut record = nonce;
        record.extend_from_slice(&ciphertext);
        let framed = protocol::framing::frame(&record);

        let mut write = self.write.lock().await;
        write.write_all(&framed).await.is_ok() && write.flush().await.is_ok()
    }

    fn close(&self) {
        // Dropping the write half on the next `lock()` would suffice, but
        // an explicit shutdown makes the peer's read loop fail promptly.
        let write = Arc::clone(&self.write);
        tokio::spawn(async move {
            let mut write = write.lock().await;
            let _ = write.shutdown().await;
        });
    }
}
