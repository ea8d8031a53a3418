use std::collections::VecDeque;
use std::path::{Path, PathBuf};

use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpStream, ToSocketAddrs, UnixStream};
use tokio_util::codec::Framed;
use tracing::{debug, warn};

use taskd_protocol::{
    Ack, Command, IpcCodec, IpcMessage, IpcOrigin, TaskCommand, TaskEvent,
};
use taskd_utils::{Result, TaskdError};

trait Transport: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> Transport for T {}

/// A connection to a taskd server.
///
/// Not internally synchronized: wrap it in your own mutex if multiple
/// tasks need to share one connection.
pub struct IpcClient {
    framed: Framed<Box<dyn Transport>, IpcCodec>,
    ack: Ack,
    next_request: u64,
    pending: VecDeque<TaskEvent>,
}

impl IpcClient {
    /// Connect over a unix domain socket and await the server's Ack.
    pub async fn connect_unix(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let stream = UnixStream::connect(path).await.map_err(|err| {
            if matches!(
                err.kind(),
                std::io::ErrorKind::NotFound | std::io::ErrorKind::ConnectionRefused
            ) {
                TaskdError::ServerNotRunning {
                    path: PathBuf::from(path),
                }
            } else {
                TaskdError::Io(err)
            }
        })?;
        Self::handshake(Box::new(stream)).await
    }

    /// Connect over TCP and await the server's Ack.
    pub async fn connect_tcp(addr: impl ToSocketAddrs) -> Result<Self> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|err| TaskdError::connection(err.to_string()))?;
        Self::handshake(Box::new(stream)).await
    }

    async fn handshake(stream: Box<dyn Transport>) -> Result<Self> {
        let mut framed = Framed::new(stream, IpcCodec::new());
        let ack = match framed.next().await {
            Some(Ok(IpcMessage::Ack { data, .. })) => data,
            Some(Ok(other)) => {
                return Err(TaskdError::protocol(format!(
                    "expected Ack as first message, got {:?}",
                    std::mem::discriminant(&other)
                )))
            }
            Some(Err(err)) => return Err(TaskdError::protocol(err.to_string())),
            None => return Err(TaskdError::ConnectionClosed),
        };
        debug!("Connected as client {}", ack.client_id);
        Ok(Self {
            framed,
            ack,
            next_request: 0,
            pending: VecDeque::new(),
        })
    }

    /// The server-assigned id for this connection.
    pub fn client_id(&self) -> &str {
        &self.ack.client_id
    }

    /// The full handshake payload (server pid and parent pid included).
    pub fn ack(&self) -> &Ack {
        &self.ack
    }

    /// Send a command without waiting for anything back.
    pub async fn send(&mut self, command: Command) -> Result<()> {
        let message = IpcMessage::command(self.ack.client_id.clone(), TaskCommand::new(command));
        self.framed
            .send(message)
            .await
            .map_err(|err| TaskdError::connection(err.to_string()))
    }

    /// Send a query command and wait for its correlated response.
    ///
    /// Events that arrive before the response are buffered for
    /// [`next_event`](Self::next_event), so an in-flight request never
    /// loses broadcasts.
    pub async fn request(&mut self, command: Command) -> Result<Value> {
        self.next_request += 1;
        let request_id = format!("{}-{}", self.ack.client_id, self.next_request);
        let message = IpcMessage::command(
            self.ack.client_id.clone(),
            TaskCommand::with_request_id(command, request_id.clone()),
        );
        self.framed
            .send(message)
            .await
            .map_err(|err| TaskdError::connection(err.to_string()))?;

        loop {
            match self.recv_event().await? {
                TaskEvent::CommandResponse(response) if response.request_id == request_id => {
                    return Ok(response.payload);
                }
                other => self.pending.push_back(other),
            }
        }
    }

    /// Receive the next event, draining buffered ones first.
    pub async fn next_event(&mut self) -> Result<TaskEvent> {
        if let Some(event) = self.pending.pop_front() {
            return Ok(event);
        }
        self.recv_event().await
    }

    async fn recv_event(&mut self) -> Result<TaskEvent> {
        loop {
            match self.framed.next().await {
                Some(Ok(IpcMessage::TaskEvent { data, .. })) => return Ok(data),
                Some(Ok(other)) => {
                    debug!(
                        "Ignoring non-event envelope {:?}",
                        std::mem::discriminant(&other)
                    );
                }
                Some(Err(err)) if err.is_recoverable() => {
                    warn!("Skipping malformed frame: {}", err);
                }
                Some(Err(err)) => return Err(TaskdError::protocol(err.to_string())),
                None => return Err(TaskdError::ConnectionClosed),
            }
        }
    }

    /// Announce departure and close the connection.
    pub async fn close(mut self) -> Result<()> {
        let goodbye = IpcMessage::Disconnect {
            origin: IpcOrigin::Client,
        };
        self.framed
            .send(goodbye)
            .await
            .map_err(|err| TaskdError::connection(err.to_string()))?;
        self.framed
            .close()
            .await
            .map_err(|err| TaskdError::connection(err.to_string()))
    }
}

impl std::fmt::Debug for IpcClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IpcClient")
            .field("client_id", &self.ack.client_id)
            .field("pending_events", &self.pending.len())
            .finish()
    }
}
