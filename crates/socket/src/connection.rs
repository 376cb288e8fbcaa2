//! Connection lifecycle: read/write pumps, per-service dispatch, send handles.

use std::collections::HashMap;
use std::sync::Arc;

use buildfarm_protocol::constants::SEND_BUFFER_SIZE;
use buildfarm_protocol::{Frame, FrameKind, FrameReader, ProtocolError, write_frame};
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::SERVICE_QUEUE_DEPTH;
use crate::service::{Service, ServiceRegistry};

/// Process-unique connection id assigned by the listener.
pub type ConnectionId = u32;

/// Error returned when a frame cannot be queued for sending.
#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error("connection closed")]
    Closed,

    #[error("unknown connection: {0}")]
    UnknownConnection(ConnectionId),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Handle for queueing frames on a connection.
///
/// Cloneable and cheap; wraps an `mpsc::Sender` drained by the write pump.
#[derive(Clone)]
pub struct FrameSender {
    id: ConnectionId,
    tx: mpsc::Sender<Frame>,
    cancel: CancellationToken,
}

impl FrameSender {
    /// Creates a sender that is not backed by a socket.
    ///
    /// Frames are delivered to the returned receiver instead of a write pump,
    /// which lets services be driven in-process.
    pub fn detached(id: ConnectionId, buffer: usize) -> (Self, mpsc::Receiver<Frame>) {
        let (tx, rx) = mpsc::channel(buffer);
        let sender = Self {
            id,
            tx,
            cancel: CancellationToken::new(),
        };
        (sender, rx)
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.id
    }

    /// Queues a frame, waiting for room in the send buffer.
    pub async fn send(&self, frame: Frame) -> Result<(), SendError> {
        if self.cancel.is_cancelled() {
            return Err(SendError::Closed);
        }
        self.tx.send(frame).await.map_err(|_| SendError::Closed)
    }

    /// Returns `true` while the write pump is running.
    pub fn is_connected(&self) -> bool {
        !self.tx.is_closed() && !self.cancel.is_cancelled()
    }

    /// Returns a sender scoped to `service`.
    pub fn service(&self, service: impl Into<Arc<str>>) -> ServiceSender {
        ServiceSender {
            service: service.into(),
            frames: self.clone(),
        }
    }

    /// Requests the connection to close.
    pub fn close(&self) {
        self.cancel.cancel();
    }
}

/// Sender bound to one service on one connection.
#[derive(Clone)]
pub struct ServiceSender {
    service: Arc<str>,
    frames: FrameSender,
}

impl ServiceSender {
    pub fn connection_id(&self) -> ConnectionId {
        self.frames.id
    }

    pub fn service_name(&self) -> &str {
        &self.service
    }

    pub async fn send_string(&self, text: &str) -> Result<(), SendError> {
        self.frames.send(Frame::string(&*self.service, text)).await
    }

    pub async fn send_binary(&self, data: Vec<u8>) -> Result<(), SendError> {
        self.frames.send(Frame::binary(&*self.service, data)).await
    }

    pub async fn send_json<T: Serialize>(&self, value: &T) -> Result<(), SendError> {
        let frame = Frame::json(&*self.service, value)?;
        self.frames.send(frame).await
    }

    pub fn is_connected(&self) -> bool {
        self.frames.is_connected()
    }

    /// The underlying connection handle.
    pub fn frames(&self) -> &FrameSender {
        &self.frames
    }
}

/// An established connection.
///
/// Owns the pump tasks through its cancellation token; dropping the handle
/// does not close the connection, [`close`](Self::close) does.
pub struct Connection {
    id: ConnectionId,
    sender: FrameSender,
    cancel: CancellationToken,
    finished: CancellationToken,
}

impl Connection {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn sender(&self) -> FrameSender {
        self.sender.clone()
    }

    /// Returns a sender scoped to `service`.
    pub fn service(&self, service: impl Into<Arc<str>>) -> ServiceSender {
        self.sender.service(service)
    }

    pub fn is_connected(&self) -> bool {
        self.sender.is_connected()
    }

    /// Signals shutdown; a best-effort `Close` frame is sent to the peer.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    /// Resolves once the read pump exited and disconnect handlers ran.
    pub async fn closed(&self) {
        self.finished.cancelled().await;
    }

    pub(crate) fn finished_token(&self) -> CancellationToken {
        self.finished.clone()
    }
}

/// Starts the pumps for an accepted or dialed socket.
///
/// `handshake`, when given, is queued ahead of anything a service sends.
pub(crate) fn spawn_connection(
    id: ConnectionId,
    reader: FrameReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    registry: Arc<ServiceRegistry>,
    parent_cancel: &CancellationToken,
    handshake: Option<Frame>,
) -> Connection {
    let (tx, rx) = mpsc::channel::<Frame>(SEND_BUFFER_SIZE);
    let cancel = parent_cancel.child_token();
    let finished = CancellationToken::new();
    let sender = FrameSender {
        id,
        tx,
        cancel: cancel.clone(),
    };

    if let Some(frame) = handshake {
        // Channel is empty, so this cannot fail for lack of room.
        let _ = sender.tx.try_send(frame);
    }

    tokio::spawn(write_pump(id, writer, rx, cancel.clone()));

    let conn = Connection {
        id,
        sender: sender.clone(),
        cancel: cancel.clone(),
        finished: finished.clone(),
    };

    tokio::spawn(async move {
        for (name, service) in registry.iter() {
            service.on_connected(sender.service(name)).await;
        }

        read_pump(id, reader, &sender, &registry, &cancel).await;
        cancel.cancel();

        for (_, service) in registry.iter() {
            service.on_disconnected(id).await;
        }
        finished.cancel();
        info!(connection_id = id, "connection closed");
    });

    conn
}

/// Write pump: drains the send channel onto the socket.
async fn write_pump(
    id: ConnectionId,
    mut writer: OwnedWriteHalf,
    mut rx: mpsc::Receiver<Frame>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,

            frame = rx.recv() => {
                match frame {
                    Some(frame) => {
                        trace!(connection_id = id, service = %frame.service, kind = ?frame.kind, len = frame.payload.len(), "sending frame");
                        if let Err(e) = write_frame(&mut writer, &frame).await {
                            error!(connection_id = id, "write pump error: {e}");
                            break;
                        }
                    }
                    None => break,
                }
            }
        }
    }

    cancel.cancel();
    // Best-effort close frame.
    let _ = write_frame(&mut writer, &Frame::close()).await;
    let _ = writer.shutdown().await;
}

/// Read pump: decodes frames and routes them to per-service dispatch tasks.
async fn read_pump(
    id: ConnectionId,
    mut reader: FrameReader<OwnedReadHalf>,
    sender: &FrameSender,
    registry: &ServiceRegistry,
    cancel: &CancellationToken,
) {
    let mut queues: HashMap<String, mpsc::Sender<Frame>> = HashMap::new();
    let mut dispatchers = JoinSet::new();

    loop {
        let result = tokio::select! {
            _ = cancel.cancelled() => break,
            result = reader.read_frame() => result,
        };

        let frame = match result {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                debug!(connection_id = id, "peer closed the stream");
                break;
            }
            Err(e) => {
                warn!(connection_id = id, "dropping connection: {e}");
                break;
            }
        };

        match frame.kind {
            FrameKind::Close => {
                info!(connection_id = id, "received close frame");
                break;
            }
            FrameKind::Connection => {
                warn!(connection_id = id, "unexpected connection frame ignored");
                continue;
            }
            FrameKind::String | FrameKind::Binary | FrameKind::Json => {}
        }

        let Some(service) = registry.get(&frame.service) else {
            warn!(connection_id = id, service = %frame.service, "frame for unregistered service dropped");
            continue;
        };

        let queue = queues.entry(frame.service.clone()).or_insert_with(|| {
            let (tx, rx) = mpsc::channel(SERVICE_QUEUE_DEPTH);
            dispatchers.spawn(dispatch_service(
                Arc::clone(service),
                sender.service(frame.service.as_str()),
                rx,
            ));
            tx
        });

        let service_name = frame.service.clone();
        let queued = tokio::select! {
            _ = cancel.cancelled() => break,
            result = queue.send(frame) => result.is_ok(),
        };
        if !queued {
            error!(connection_id = id, service = %service_name, "service dispatcher stopped, frame dropped");
            queues.remove(&service_name);
        }
    }

    // Closing the queues lets each dispatcher finish what it already holds.
    drop(queues);
    while let Some(result) = dispatchers.join_next().await {
        if let Err(e) = result {
            error!(connection_id = id, "service dispatcher failed: {e}");
        }
    }
}

/// Runs one service's handlers in arrival order.
async fn dispatch_service(
    service: Arc<dyn Service>,
    sender: ServiceSender,
    mut rx: mpsc::Receiver<Frame>,
) {
    while let Some(frame) = rx.recv().await {
        match frame.kind {
            FrameKind::String => match String::from_utf8(frame.payload) {
                Ok(text) => service.on_string_message(sender.clone(), text).await,
                Err(_) => warn!(service = sender.service_name(), "invalid UTF-8 in string frame"),
            },
            FrameKind::Binary => service.on_data_message(sender.clone(), frame.payload).await,
            FrameKind::Json => match serde_json::from_slice(&frame.payload) {
                Ok(value) => service.on_json_message(sender.clone(), value).await,
                Err(e) => warn!(service = sender.service_name(), "invalid JSON frame: {e}"),
            },
            FrameKind::Connection | FrameKind::Close => {}
        }
    }
}
