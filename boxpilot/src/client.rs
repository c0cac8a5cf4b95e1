//! IPC client - the controller side of the channel.
//!
//! Owns at most one connection. Writes are fire-and-forget (one flushed line
//! per request); everything read from the supervisor is turned into a
//! [`ClientNotification`] on a single channel. Correlating responses with
//! requests is left to the caller.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::bridge::codec::{CodecError, DEFAULT_MAX_FRAME_LENGTH, LineJsonCodec};
use crate::bridge::protocol::{Event, LogStream, Message, Object, Request, Response};
use crate::bridge::transport::{ChannelAddr, connect};
use crate::server::MESSAGE_TOO_LARGE;

/// Everything the client observes on the channel.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientNotification {
    Response(Response),
    Status(bool),
    Log { stream: LogStream, message: String },
    Error(String),
    /// Input from the supervisor was unusable and the connection was dropped.
    ProtocolError(String),
    /// The connection with this generation is gone.
    Disconnected(u64),
}

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("not connected to manager")]
    NotConnected,
    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("connecting to {0} timed out")]
    ConnectTimeout(String),
    #[error("failed to send request: {0}")]
    Send(#[from] CodecError),
}

type Writer = FramedWrite<OwnedWriteHalf, LineJsonCodec<Message>>;

struct Connection {
    generation: u64,
    writer: Writer,
    reader: JoinHandle<()>,
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

struct Inner {
    connection: Mutex<Option<Connection>>,
    /// Generation of the live connection, 0 when disconnected.
    active: AtomicU64,
    generation: AtomicU64,
    notifications: mpsc::UnboundedSender<ClientNotification>,
    max_frame_length: usize,
}

impl Inner {
    fn notify(&self, notification: ClientNotification) {
        let _ = self.notifications.send(notification);
    }
}

#[derive(Clone)]
pub struct IpcClient {
    inner: Arc<Inner>,
}

impl IpcClient {
    /// A disconnected client and its notification stream.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ClientNotification>) {
        Self::with_max_frame_length(DEFAULT_MAX_FRAME_LENGTH)
    }

    /// Like [`IpcClient::new`] with a custom frame cap.
    pub fn with_max_frame_length(
        max_frame_length: usize,
    ) -> (Self, mpsc::UnboundedReceiver<ClientNotification>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let inner = Arc::new(Inner {
            connection: Mutex::new(None),
            active: AtomicU64::new(0),
            generation: AtomicU64::new(0),
            notifications: tx,
            max_frame_length,
        });
        (Self { inner }, rx)
    }

    pub fn is_connected(&self) -> bool {
        self.connection_generation().is_some()
    }

    /// Generation of the live connection. Each successful connect gets a new,
    /// larger one.
    pub fn connection_generation(&self) -> Option<u64> {
        match self.inner.active.load(Ordering::SeqCst) {
            0 => None,
            generation => Some(generation),
        }
    }

    /// Connect to the supervisor serving `name`. A no-op if already connected;
    /// concurrent callers wait for the attempt in progress.
    pub async fn connect(&self, name: &str, timeout: Duration) -> Result<(), ClientError> {
        let mut guard = self.inner.connection.lock().await;
        if guard.is_some() && self.is_connected() {
            return Ok(());
        }

        let addr = ChannelAddr::for_name(name);
        let stream = match tokio::time::timeout(timeout, connect(&addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(source)) => {
                return Err(ClientError::Connect {
                    addr: addr.to_string(),
                    source,
                });
            }
            Err(_) => return Err(ClientError::ConnectTimeout(addr.to_string())),
        };

        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let (read_half, write_half) = stream.into_split();
        let reader = tokio::spawn(read_loop(
            Arc::downgrade(&self.inner),
            generation,
            FramedRead::new(
                read_half,
                LineJsonCodec::<Message>::with_max_length(self.inner.max_frame_length),
            ),
        ));

        // A stale connection is closed when dropped here.
        guard.replace(Connection {
            generation,
            writer: FramedWrite::new(write_half, LineJsonCodec::new()),
            reader,
        });
        self.inner.active.store(generation, Ordering::SeqCst);
        tracing::info!(addr = %addr, "Connected to manager");
        Ok(())
    }

    /// Write one request line. Does not wait for the response. Returns the
    /// generation of the connection the request went out on.
    pub async fn send_request(
        &self,
        id: u64,
        method: &str,
        params: Object,
    ) -> Result<u64, ClientError> {
        let mut guard = self.inner.connection.lock().await;
        let conn = guard.as_mut().ok_or(ClientError::NotConnected)?;
        tracing::debug!(id, method, conn = conn.generation, "Sending request");
        conn.writer
            .send(Message::Request(Request::new(id, method, params)))
            .await?;
        Ok(conn.generation)
    }

    /// Drop the connection, if any.
    pub async fn disconnect(&self) {
        let conn = self.inner.connection.lock().await.take();
        if let Some(conn) = conn {
            self.inner.active.store(0, Ordering::SeqCst);
            tracing::info!("Disconnected from manager");
            self.inner.notify(ClientNotification::Disconnected(conn.generation));
        }
    }
}

async fn read_loop(
    inner: Weak<Inner>,
    generation: u64,
    mut reader: FramedRead<OwnedReadHalf, LineJsonCodec<Message>>,
) {
    loop {
        let notification = match reader.next().await {
            Some(Ok(Message::Response(resp))) => ClientNotification::Response(resp),
            Some(Ok(Message::Event(Event::Status { running }))) => ClientNotification::Status(running),
            Some(Ok(Message::Event(Event::Log { stream, message }))) => {
                ClientNotification::Log { stream, message }
            }
            Some(Ok(Message::Event(Event::Error { message }))) => ClientNotification::Error(message),
            Some(Ok(Message::Request(req))) => {
                tracing::trace!(id = req.id, "Ignoring request sent by manager");
                continue;
            }
            Some(Err(CodecError::MessageTooLarge { size, max })) => {
                tracing::warn!(size, max, "Manager sent an oversized message");
                if let Some(inner) = inner.upgrade() {
                    inner.notify(ClientNotification::ProtocolError(MESSAGE_TOO_LARGE.to_string()));
                }
                break;
            }
            Some(Err(e)) => {
                tracing::debug!(error = %e, "Manager connection read failed");
                break;
            }
            None => break,
        };
        let Some(inner) = inner.upgrade() else {
            return;
        };
        inner.notify(notification);
    }

    let Some(inner) = inner.upgrade() else {
        return;
    };
    let current = {
        let mut guard = inner.connection.lock().await;
        if guard.as_ref().is_some_and(|c| c.generation == generation) {
            inner.active.store(0, Ordering::SeqCst);
            guard.take()
        } else {
            None
        }
    };
    let Some(conn) = current else {
        // Superseded or explicitly disconnected; already reported.
        return;
    };
    // Dropping the connection aborts this task, so report first.
    tracing::info!("Manager connection closed");
    inner.notify(ClientNotification::Disconnected(generation));
    drop(conn);
}
