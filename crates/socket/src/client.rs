//! Dialing side of the socket layer.

use std::sync::Arc;

use buildfarm_protocol::constants::{CONNECT_TIMEOUT, HANDSHAKE_TIMEOUT};
use buildfarm_protocol::{FrameKind, FrameReader};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

use crate::SocketError;
use crate::connection::{self, Connection};
use crate::service::ServiceRegistry;

/// Connects to a [`SocketServer`](crate::SocketServer).
pub struct SocketClient;

impl SocketClient {
    /// Dials `addr` and waits for the `Connection` handshake.
    ///
    /// The link is only handed out once the server announced the client id;
    /// any other first frame fails the handshake.
    pub async fn connect(
        addr: &str,
        registry: Arc<ServiceRegistry>,
        cancel: &CancellationToken,
    ) -> Result<Connection, SocketError> {
        let stream = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(SocketError::Cancelled),
            result = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(addr)) => {
                result.map_err(|_| SocketError::Timeout)??
            }
        };
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!("set_nodelay failed: {e}");
        }

        let (read_half, write_half) = stream.into_split();
        let mut reader = FrameReader::new(read_half);

        let first = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(SocketError::Cancelled),
            result = tokio::time::timeout(HANDSHAKE_TIMEOUT, reader.read_frame()) => {
                result.map_err(|_| SocketError::Timeout)??
            }
        };
        let frame = first.ok_or_else(|| {
            SocketError::Handshake("server closed before handshake".into())
        })?;
        if frame.kind != FrameKind::Connection {
            return Err(SocketError::Handshake(format!(
                "expected connection frame, got {:?}",
                frame.kind
            )));
        }
        let id = frame.connection_id()?;
        tracing::info!(connection_id = id, %addr, "connected to server");

        Ok(connection::spawn_connection(
            id,
            reader,
            write_half,
            registry,
            cancel,
            None,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};
    use std::time::Duration;

    use buildfarm_protocol::{Frame, write_frame};
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;

    use crate::connection::{ConnectionId, ServiceSender};
    use crate::server::{ServerConfig, SocketServer};
    use crate::service::{HandlerFuture, Service};

    struct Echo;

    impl Service for Echo {
        fn on_string_message(&self, sender: ServiceSender, text: String) -> HandlerFuture<'_> {
            Box::pin(async move {
                let _ = sender.send_string(&format!("echo:{text}")).await;
            })
        }
    }

    struct Inbox {
        tx: mpsc::UnboundedSender<String>,
        disconnected: mpsc::UnboundedSender<ConnectionId>,
    }

    impl Service for Inbox {
        fn on_string_message(&self, _sender: ServiceSender, text: String) -> HandlerFuture<'_> {
            Box::pin(async move {
                let _ = self.tx.send(text);
            })
        }

        fn on_disconnected(&self, connection_id: ConnectionId) -> HandlerFuture<'_> {
            Box::pin(async move {
                let _ = self.disconnected.send(connection_id);
            })
        }
    }

    #[tokio::test]
    async fn client_round_trip_through_server() {
        let mut server_registry = ServiceRegistry::new();
        server_registry.register("build", Arc::new(Echo)).unwrap();
        let server = SocketServer::new(
            ServerConfig {
                bind_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
                port: 0,
            },
            server_registry,
            CancellationToken::new(),
        );
        let listener = server.bind().await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let s = Arc::clone(&server);
        tokio::spawn(async move { s.serve(listener).await });

        let (tx, mut rx) = mpsc::unbounded_channel();
        let (dtx, mut drx) = mpsc::unbounded_channel();
        let mut client_registry = ServiceRegistry::new();
        client_registry
            .register("build", Arc::new(Inbox { tx, disconnected: dtx }))
            .unwrap();

        let cancel = CancellationToken::new();
        let conn = SocketClient::connect(&addr, Arc::new(client_registry), &cancel)
            .await
            .unwrap();
        assert_eq!(conn.id(), 1);

        conn.service("build").send_string("ping").await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), "echo:ping");

        server.shutdown();
        assert_eq!(drx.recv().await.unwrap(), 1);
        conn.closed().await;
        assert!(!conn.is_connected());
    }

    #[tokio::test]
    async fn handshake_requires_connection_frame() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            write_frame(&mut stream, &Frame::string("build", "hi")).await.unwrap();
            tokio::time::sleep(Duration::from_millis(200)).await;
        });

        let err = SocketClient::connect(&addr, Arc::new(ServiceRegistry::new()), &CancellationToken::new())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, SocketError::Handshake(_)));
    }

    #[tokio::test]
    async fn connect_cancelled() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = SocketClient::connect(&addr, Arc::new(ServiceRegistry::new()), &cancel)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, SocketError::Cancelled));
        drop(listener);
    }
}
