//! Listening side of the socket layer.
//!
//! Accepts TCP connections, assigns each the next sequential id, announces
//! it in a `Connection` frame and keeps the live set for unicast/broadcast.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use buildfarm_protocol::{Frame, FrameReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::SocketError;
use crate::connection::{self, Connection, ConnectionId, FrameSender, SendError};
use crate::service::ServiceRegistry;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_address: IpAddr,
    /// TCP port to listen on (0 = OS-assigned).
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 0,
        }
    }
}

/// Multi-connection frame server.
pub struct SocketServer {
    config: ServerConfig,
    registry: Arc<ServiceRegistry>,
    connections: Mutex<HashMap<ConnectionId, Connection>>,
    next_id: AtomicU32,
    cancel: CancellationToken,
    local_addr: Mutex<Option<SocketAddr>>,
}

impl SocketServer {
    /// Creates a server whose connections dispatch through `registry`.
    ///
    /// `cancel` is the parent token: cancelling it stops the accept loop and
    /// closes every connection.
    pub fn new(
        config: ServerConfig,
        registry: ServiceRegistry,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            registry: Arc::new(registry),
            connections: Mutex::new(HashMap::new()),
            next_id: AtomicU32::new(1),
            cancel,
            local_addr: Mutex::new(None),
        })
    }

    /// Binds the configured address.
    pub async fn bind(&self) -> Result<TcpListener, SocketError> {
        let addr = SocketAddr::new(self.config.bind_address, self.config.port);
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        *self.local_addr.lock().await = Some(local_addr);
        tracing::info!("socket server listening on {local_addr}");
        Ok(listener)
    }

    /// Returns the bound address, once [`bind`](Self::bind) ran.
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock().await
    }

    /// Binds and serves until cancellation.
    pub async fn run(self: &Arc<Self>) -> Result<(), SocketError> {
        let listener = self.bind().await?;
        self.serve(listener).await
    }

    /// Accepts connections on an already bound listener until cancellation.
    pub async fn serve(self: &Arc<Self>, listener: TcpListener) -> Result<(), SocketError> {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    tracing::info!("server shutting down");
                    self.close_all().await;
                    break Ok(());
                }

                result = listener.accept() => {
                    match result {
                        Ok((stream, peer_addr)) => self.accept(stream, peer_addr).await,
                        Err(e) => tracing::error!("accept error: {e}"),
                    }
                }
            }
        }
    }

    async fn accept(self: &Arc<Self>, stream: TcpStream, peer_addr: SocketAddr) {
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!(%peer_addr, "set_nodelay failed: {e}");
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (read_half, write_half) = stream.into_split();
        let conn = connection::spawn_connection(
            id,
            FrameReader::new(read_half),
            write_half,
            Arc::clone(&self.registry),
            &self.cancel,
            Some(Frame::connection(id)),
        );
        tracing::info!(connection_id = id, %peer_addr, "client connected");

        let finished = conn.finished_token();
        self.connections.lock().await.insert(id, conn);

        let server = Arc::clone(self);
        tokio::spawn(async move {
            finished.cancelled().await;
            server.connections.lock().await.remove(&id);
            tracing::debug!(connection_id = id, "connection removed");
        });
    }

    /// Ids of every live connection, ascending.
    pub async fn connected_ids(&self) -> Vec<ConnectionId> {
        let mut ids: Vec<_> = self
            .connections
            .lock()
            .await
            .iter()
            .filter(|(_, c)| c.is_connected())
            .map(|(id, _)| *id)
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Sender for one connection, if it is still live.
    pub async fn connection(&self, id: ConnectionId) -> Option<FrameSender> {
        self.connections
            .lock()
            .await
            .get(&id)
            .filter(|c| c.is_connected())
            .map(Connection::sender)
    }

    /// Unicast: queues `frame` on connection `id`.
    pub async fn send_to(&self, id: ConnectionId, frame: Frame) -> Result<(), SendError> {
        let sender = self
            .connection(id)
            .await
            .ok_or(SendError::UnknownConnection(id))?;
        sender.send(frame).await
    }

    /// Queues `frame` on every live connection; returns how many accepted it.
    pub async fn broadcast(&self, frame: Frame) -> usize {
        let senders: Vec<FrameSender> = self
            .connections
            .lock()
            .await
            .values()
            .filter(|c| c.is_connected())
            .map(Connection::sender)
            .collect();

        let mut delivered = 0;
        for sender in senders {
            match sender.send(frame.clone()).await {
                Ok(()) => delivered += 1,
                Err(e) => {
                    tracing::warn!(connection_id = sender.connection_id(), "broadcast dropped: {e}")
                }
            }
        }
        delivered
    }

    /// Closes one connection.
    pub async fn disconnect(&self, id: ConnectionId) {
        if let Some(conn) = self.connections.lock().await.get(&id) {
            conn.close();
        }
    }

    /// Stops accepting and closes every connection.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    async fn close_all(&self) {
        let conns: Vec<Connection> = self.connections.lock().await.drain().map(|(_, c)| c).collect();
        for conn in &conns {
            conn.close();
        }
        for conn in &conns {
            conn.closed().await;
        }
    }
}
