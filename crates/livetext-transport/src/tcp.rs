//! TCP transport for LiveText

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use livetext_protocol::{encode, Failure, Message, Ping, DEFAULT_MAX_FRAME_SIZE};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::error::TransportError;
use crate::handler::MessageHandler;
use crate::registry::SessionRegistry;
use crate::session::{SessionHandle, SessionId};

/// Connection settings
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// A read idle for this long triggers a `Ping`
    pub idle_timeout: Duration,
    pub max_frame_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(10),
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }
}

/// TCP Server for LiveText
pub struct TcpServer {
    registry: Arc<SessionRegistry>,
    addr: SocketAddr,
    session_counter: AtomicU64,
    config: ServerConfig,
}

impl TcpServer {
    pub fn new(registry: Arc<SessionRegistry>, addr: SocketAddr, config: ServerConfig) -> Self {
        Self {
            registry,
            addr,
            session_counter: AtomicU64::new(1),
            config,
        }
    }

    /// Bind the listening socket
    pub async fn bind(&self) -> Result<TcpListener, TransportError> {
        let listener = TcpListener::bind(self.addr).await?;
        info!(addr = %listener.local_addr()?, "LiveText TCP server listening");
        Ok(listener)
    }

    /// Start the TCP server
    pub async fn run(&self) -> Result<(), TransportError> {
        let listener = self.bind().await?;
        self.serve(listener).await
    }

    /// Accept connections until the listener fails
    pub async fn serve(&self, listener: TcpListener) -> Result<(), TransportError> {
        loop {
            match listener.accept().await {
                Ok((stream, peer_addr)) => {
                    let session_id = self.session_counter.fetch_add(1, Ordering::Relaxed);
                    let registry = self.registry.clone();
                    let config = self.config.clone();

                    tokio::spawn(async move {
                        let result =
                            Self::handle_connection(stream, peer_addr, session_id, registry, config)
                                .await;
                        if let Err(e) = result {
                            error!(session = session_id, error = %e, "Connection error");
                        }
                    });
                }
                Err(e) => {
                    error!(error = %e, "Failed to accept connection");
                }
            }
        }
    }

    async fn handle_connection(
        stream: TcpStream,
        peer_addr: SocketAddr,
        session_id: SessionId,
        registry: Arc<SessionRegistry>,
        config: ServerConfig,
    ) -> Result<(), TransportError> {
        info!(session = session_id, peer = %peer_addr, "Client connected");
        stream.set_nodelay(true)?;

        let (mut reader, mut writer) = stream.into_split();
        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();

        let writer_task = tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                let frame = match encode(&message) {
                    Ok(frame) => frame,
                    Err(e) => {
                        error!(session = session_id, error = %e, "Failed to encode message");
                        continue;
                    }
                };
                if let Err(e) = writer.write_all(&frame).await {
                    debug!(session = session_id, error = %e, "Write error");
                    break;
                }
                if matches!(message, Message::Failure(_)) {
                    break;
                }
            }
            let _ = writer.shutdown().await;
        });

        let handle = SessionHandle::new(session_id, tx);
        let mut handler = MessageHandler::new(handle, registry, config.max_frame_size);
        let mut buf = vec![0u8; 8192];

        loop {
            let read = tokio::time::timeout(config.idle_timeout, reader.read(&mut buf)).await;
            let read = match read {
                Ok(read) => read,
                Err(_) => {
                    debug!(session = session_id, "Connection idle, sending ping");
                    handler.session().handle.send(Ping);
                    continue;
                }
            };

            match read {
                Ok(0) => {
                    info!(session = session_id, "Client disconnected");
                    break;
                }
                Ok(n) => {
                    if let Err(e) = handler.process(&buf[..n]).await {
                        warn!(session = session_id, error = %e, "Closing session");
                        handler.session().handle.send(Failure { reason: e.to_string() });
                        break;
                    }
                }
                Err(e) => {
                    error!(session = session_id, error = %e, "Read error");
                    break;
                }
            }
        }

        handler.cleanup().await;
        drop(handler);
        let _ = writer_task.await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use livetext_core::{BlockFormat, CharFormat, Document, Symbol};
    use livetext_protocol::{
        AccountCreate, CharsInsert, DocumentCreate, DocumentOpen, FrameCodec, LoginRequest, Logout,
    };
    use livetext_storage::MemoryStorage;

    use crate::workspace::WorkspaceConfig;

    struct Client {
        stream: TcpStream,
        codec: FrameCodec,
    }

    impl Client {
        async fn connect(addr: SocketAddr) -> Self {
            Self {
                stream: TcpStream::connect(addr).await.unwrap(),
                codec: FrameCodec::new(),
            }
        }

        async fn send(&mut self, message: impl Into<Message>) {
            let frame = encode(&message.into()).unwrap();
            self.stream.write_all(&frame).await.unwrap();
        }

        async fn recv(&mut self) -> Message {
            let mut buf = [0u8; 4096];
            loop {
                if let Some(message) = self.codec.decode().unwrap() {
                    return message;
                }
                let n = tokio::time::timeout(Duration::from_secs(5), self.stream.read(&mut buf))
                    .await
                    .unwrap()
                    .unwrap();
                assert!(n > 0, "server closed the connection");
                self.codec.feed(&buf[..n]);
            }
        }
    }

    async fn start_server(config: ServerConfig) -> SocketAddr {
        let storage = Arc::new(MemoryStorage::new());
        let registry = SessionRegistry::new(storage, WorkspaceConfig::default());
        let server = TcpServer::new(registry, "127.0.0.1:0".parse().unwrap(), config);
        let listener = server.bind().await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { server.serve(listener).await });
        addr
    }

    fn account(username: &str) -> AccountCreate {
        AccountCreate {
            username: username.into(),
            nickname: username.into(),
            icon: vec![],
            password: "pw".into(),
        }
    }

    #[tokio::test]
    async fn test_tcp_ping_pong() {
        let addr = start_server(ServerConfig::default()).await;
        let mut client = Client::connect(addr).await;

        client.send(Ping).await;
        assert!(matches!(client.recv().await, Message::Pong(_)));
    }

    #[tokio::test]
    async fn test_idle_connection_is_pinged_not_closed() {
        let config = ServerConfig {
            idle_timeout: Duration::from_millis(50),
            ..ServerConfig::default()
        };
        let addr = start_server(config).await;
        let mut client = Client::connect(addr).await;

        assert!(matches!(client.recv().await, Message::Ping(_)));
        client.send(Ping).await;
        loop {
            if let Message::Pong(_) = client.recv().await {
                break;
            }
        }
    }

    #[tokio::test]
    async fn test_protocol_error_closes_only_offender() {
        let addr = start_server(ServerConfig::default()).await;
        let mut good = Client::connect(addr).await;
        let mut bad = Client::connect(addr).await;

        bad.stream.write_all(&[0, 0, 0, 3, 42, 0, 1]).await.unwrap();
        assert!(matches!(bad.recv().await, Message::Failure(_)));

        good.send(Ping).await;
        assert!(matches!(good.recv().await, Message::Pong(_)));
    }

    #[tokio::test]
    async fn test_two_editors_over_tcp() {
        let addr = start_server(ServerConfig::default()).await;
        let mut alice = Client::connect(addr).await;
        let mut bob = Client::connect(addr).await;

        alice.send(account("alice")).await;
        let alice_user = match alice.recv().await {
            Message::AccountConfirmed(c) => c.user,
            other => panic!("unexpected {:?}", other),
        };
        bob.send(account("bob")).await;
        assert!(matches!(bob.recv().await, Message::AccountConfirmed(_)));

        alice.send(DocumentCreate { name: "shared".into() }).await;
        let ready = match alice.recv().await {
            Message::DocumentReady(ready) => ready,
            other => panic!("unexpected {:?}", other),
        };
        let uri = ready.meta.uri.clone();
        let mut replica = Document::from_snapshot(ready.snapshot).unwrap();
        let block = replica.blocks().next().unwrap().id;

        let mut symbols = Vec::new();
        for (i, ch) in "abc".chars().enumerate() {
            let pos = replica.fractional_pos_at_index(i, alice_user.user_id).unwrap();
            let symbol = Symbol::new(ch, CharFormat::default(), alice_user.user_id, pos, block);
            replica.insert(symbol.clone()).unwrap();
            symbols.push(symbol);
        }
        alice
            .send(CharsInsert {
                symbols,
                block,
                block_format: BlockFormat::default(),
            })
            .await;

        bob.send(DocumentOpen { uri }).await;
        let joined = match bob.recv().await {
            Message::DocumentReady(ready) => Document::from_snapshot(ready.snapshot).unwrap(),
            other => panic!("unexpected {:?}", other),
        };
        assert_eq!(joined.text(), "abc");
        assert!(matches!(bob.recv().await, Message::UserJoin(_)));
        assert!(matches!(alice.recv().await, Message::UserJoin(_)));

        // Bob deletes 'b'; Alice sees the canonical delete.
        let target = joined.get(1).unwrap().position.clone();
        bob.send(livetext_protocol::CharsDelete {
            positions: vec![target.clone()],
        })
        .await;
        match alice.recv().await {
            Message::CharsDelete(delete) => {
                assert_eq!(delete.positions, vec![target.clone()]);
                replica.remove_at_position(&target);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(replica.text(), "ac");

        bob.send(Logout).await;
        assert!(matches!(bob.recv().await, Message::LogoutConfirmed(_)));
        assert!(matches!(alice.recv().await, Message::UserLeave(_)));

        // The account is free again once its session logged out.
        bob.send(LoginRequest {
            username: "bob".into(),
            password: "pw".into(),
        })
        .await;
        assert!(matches!(bob.recv().await, Message::LoginGranted(_)));
    }
}
