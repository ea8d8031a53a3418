//! Transport listener
//!
//! Binds the IPC endpoint (unix domain socket or TCP), accepts
//! connections, and runs one handler task per connection. The
//! acknowledgment handshake happens here: a freshly accepted client is
//! sent its `Ack` before it is registered, so the id assignment is the
//! first thing it ever reads and no broadcast can overtake it.

use std::path::PathBuf;
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, UnixListener};
use tokio::sync::{broadcast, mpsc};
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

use taskd_protocol::{Ack, IpcCodec, IpcMessage};
use taskd_utils::{Result, TaskdError};

use crate::broadcast::Broadcaster;
use crate::engine::{Lifecycle, TaskEngine};
use crate::handlers::HandlerContext;
use crate::registry::{new_client_id, ClientRegistry, CLIENT_CHANNEL_CAPACITY};
use crate::tasks::TaskRegistry;

/// Where the listener binds. Exactly one addressing mode per listener.
#[derive(Debug, Clone)]
pub enum BindTarget {
    Socket(PathBuf),
    Tcp { host: String, port: u16 },
}

impl BindTarget {
    /// Resolve a bind target from optional settings.
    ///
    /// A socket path and a TCP endpoint are mutually exclusive, and a
    /// TCP endpoint needs both host and port.
    pub fn from_options(
        socket_path: Option<PathBuf>,
        host: Option<String>,
        port: Option<u16>,
    ) -> Result<Self> {
        match (socket_path, host, port) {
            (Some(path), None, None) => Ok(BindTarget::Socket(path)),
            (None, Some(host), Some(port)) => Ok(BindTarget::Tcp { host, port }),
            (Some(_), _, _) => Err(TaskdError::config(
                "socket path and TCP endpoint are mutually exclusive",
            )),
            (None, _, _) => Err(TaskdError::config(
                "no bind target: provide a socket path, or both a TCP host and port",
            )),
        }
    }
}

impl std::fmt::Display for BindTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BindTarget::Socket(path) => write!(f, "{}", path.display()),
            BindTarget::Tcp { host, port } => write!(f, "{}:{}", host, port),
        }
    }
}

/// Shared state handed to each connection handler.
#[derive(Clone)]
struct ConnState {
    engine: Arc<dyn TaskEngine>,
    clients: Arc<ClientRegistry>,
    tasks: Arc<TaskRegistry>,
    broadcaster: Arc<Broadcaster>,
}

/// The IPC server, ready to bind.
pub struct IpcServer {
    bind: BindTarget,
    engine: Arc<dyn TaskEngine>,
    clients: Arc<ClientRegistry>,
    tasks: Arc<TaskRegistry>,
    broadcaster: Arc<Broadcaster>,
    lifecycle: mpsc::UnboundedReceiver<Lifecycle>,
}

impl IpcServer {
    /// Wire up a server around an engine and its lifecycle stream.
    pub fn new(
        bind: BindTarget,
        engine: Arc<dyn TaskEngine>,
        lifecycle: mpsc::UnboundedReceiver<Lifecycle>,
    ) -> Self {
        let clients = Arc::new(ClientRegistry::new());
        let tasks = Arc::new(TaskRegistry::new());
        let broadcaster = Arc::new(Broadcaster::new(clients.clone(), tasks.clone()));
        Self {
            bind,
            engine,
            clients,
            tasks,
            broadcaster,
            lifecycle,
        }
    }

    /// Bind the endpoint and start accepting.
    ///
    /// Spawns the broadcaster and accept loops; returns once the
    /// listener is bound, so a `ServerHandle` with a resolved address
    /// is immediately usable.
    pub async fn listen(self) -> Result<ServerHandle> {
        let (shutdown_tx, _) = broadcast::channel(1);

        let broadcaster = self.broadcaster.clone();
        let lifecycle = self.lifecycle;
        tokio::spawn(async move { broadcaster.run(lifecycle).await });

        let state = ConnState {
            engine: self.engine,
            clients: self.clients.clone(),
            tasks: self.tasks.clone(),
            broadcaster: self.broadcaster.clone(),
        };

        let mut handle = ServerHandle {
            socket_path: None,
            local_addr: None,
            clients: self.clients,
            tasks: self.tasks,
            broadcaster: self.broadcaster,
            shutdown: shutdown_tx.clone(),
        };

        match self.bind {
            BindTarget::Socket(path) => {
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                // A previous run may have left a stale socket file.
                if path.exists() {
                    std::fs::remove_file(&path)?;
                }
                let listener = UnixListener::bind(&path)?;
                info!("Listening on socket {}", path.display());
                handle.socket_path = Some(path.clone());
                tokio::spawn(accept_unix(listener, path, state, shutdown_tx));
            }
            BindTarget::Tcp { host, port } => {
                let listener = TcpListener::bind((host.as_str(), port)).await?;
                let local_addr = listener.local_addr()?;
                info!("Listening on tcp {}", local_addr);
                handle.local_addr = Some(local_addr);
                tokio::spawn(accept_tcp(listener, state, shutdown_tx));
            }
        }

        Ok(handle)
    }
}

/// Handle to a running server.
pub struct ServerHandle {
    /// Bound socket path, for socket mode.
    pub socket_path: Option<PathBuf>,
    /// Resolved address, for TCP mode (useful with port 0).
    pub local_addr: Option<std::net::SocketAddr>,
    clients: Arc<ClientRegistry>,
    tasks: Arc<TaskRegistry>,
    broadcaster: Arc<Broadcaster>,
    shutdown: broadcast::Sender<()>,
}

impl ServerHandle {
    pub fn clients(&self) -> Arc<ClientRegistry> {
        self.clients.clone()
    }

    pub fn tasks(&self) -> Arc<TaskRegistry> {
        self.tasks.clone()
    }

    pub fn broadcaster(&self) -> Arc<Broadcaster> {
        self.broadcaster.clone()
    }

    /// Stop the accept loop and tear down all connections.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(());
    }
}

async fn accept_unix(
    listener: UnixListener,
    path: PathBuf,
    state: ConnState,
    shutdown_tx: broadcast::Sender<()>,
) {
    let mut shutdown_rx = shutdown_tx.subscribe();
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, _addr)) => {
                    let state = state.clone();
                    let shutdown = shutdown_tx.subscribe();
                    tokio::spawn(handle_connection(stream, state, shutdown));
                }
                Err(err) => warn!("Accept failed: {}", err),
            },
            _ = shutdown_rx.recv() => {
                info!("Shutdown signal received, stopping socket accept loop");
                break;
            }
        }
    }
    let _ = std::fs::remove_file(&path);
}

async fn accept_tcp(listener: TcpListener, state: ConnState, shutdown_tx: broadcast::Sender<()>) {
    let mut shutdown_rx = shutdown_tx.subscribe();
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer_addr)) => {
                    debug!("New TCP connection from {}", peer_addr);
                    let state = state.clone();
                    let shutdown = shutdown_tx.subscribe();
                    tokio::spawn(handle_connection(stream, state, shutdown));
                }
                Err(err) => warn!("TCP accept error: {}", err),
            },
            _ = shutdown_rx.recv() => {
                info!("Shutdown signal received, stopping TCP accept loop");
                break;
            }
        }
    }
}

fn parent_pid() -> u32 {
    // SAFETY: getppid has no failure modes and touches no memory.
    #[cfg(unix)]
    unsafe {
        libc::getppid() as u32
    }
    #[cfg(not(unix))]
    0
}

/// Serve one connection until it closes or the server shuts down.
///
/// Inbound commands are dispatched on their own tasks so a slow
/// handler never stalls the read loop. Schema errors are logged and
/// the frame dropped; framing and IO errors end the connection.
async fn handle_connection<S>(stream: S, state: ConnState, mut shutdown: broadcast::Receiver<()>)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let client_id = new_client_id();
    let mut framed = Framed::new(stream, IpcCodec::new());

    // Acknowledge before registering: the Ack must be the first frame
    // this client reads, ahead of any broadcast.
    let ack = IpcMessage::ack(Ack {
        client_id: client_id.clone(),
        pid: std::process::id(),
        ppid: parent_pid(),
    });
    if let Err(err) = framed.send(ack).await {
        warn!("Handshake with new client failed: {}", err);
        return;
    }

    let (tx, mut outbound) = mpsc::channel::<IpcMessage>(CLIENT_CHANNEL_CAPACITY);
    state.clients.add(client_id.clone(), tx.clone());
    info!(
        "Client connected: {} ({} total)",
        client_id,
        state.clients.len()
    );

    loop {
        tokio::select! {
            queued = outbound.recv() => match queued {
                Some(message) => {
                    if let Err(err) = framed.send(message).await {
                        warn!("Write to {} failed: {}", client_id, err);
                        break;
                    }
                }
                None => break,
            },
            inbound = framed.next() => match inbound {
                Some(Ok(IpcMessage::TaskCommand { client_id: claimed, data, .. })) => {
                    if claimed != client_id {
                        debug!(
                            "Client {} sent command claiming id {}",
                            client_id, claimed
                        );
                    }
                    let ctx = HandlerContext {
                        client_id: client_id.clone(),
                        engine: state.engine.clone(),
                        clients: state.clients.clone(),
                        tasks: state.tasks.clone(),
                        broadcaster: state.broadcaster.clone(),
                    };
                    tokio::spawn(async move { ctx.dispatch(data).await });
                }
                Some(Ok(IpcMessage::Disconnect { .. })) => {
                    debug!("Client {} said goodbye", client_id);
                    break;
                }
                Some(Ok(other)) => {
                    debug!(
                        "Dropping unexpected {:?} envelope from {}",
                        std::mem::discriminant(&other),
                        client_id
                    );
                }
                Some(Err(err)) if err.is_recoverable() => {
                    warn!("Rejected malformed frame from {}: {}", client_id, err);
                }
                Some(Err(err)) => {
                    warn!("Connection {} failed: {}", client_id, err);
                    break;
                }
                None => break,
            },
            _ = shutdown.recv() => break,
        }
    }

    // Resolve the removal by handle so a replacement registration under
    // the same id is never evicted by this cleanup.
    if let Some(id) = state.clients.remove_by_handle(&tx) {
        info!(
            "Client disconnected: {} ({} remaining)",
            id,
            state.clients.len()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bind_target_socket() {
        let target =
            BindTarget::from_options(Some(PathBuf::from("/tmp/t.sock")), None, None).unwrap();
        assert!(matches!(target, BindTarget::Socket(_)));
    }

    #[test]
    fn test_bind_target_tcp() {
        let target =
            BindTarget::from_options(None, Some("127.0.0.1".into()), Some(7800)).unwrap();
        match target {
            BindTarget::Tcp { host, port } => {
                assert_eq!(host, "127.0.0.1");
                assert_eq!(port, 7800);
            }
            other => panic!("expected tcp target, got {:?}", other),
        }
    }

    #[test]
    fn test_bind_target_neither() {
        assert!(BindTarget::from_options(None, None, None).is_err());
    }

    #[test]
    fn test_bind_target_partial_tcp() {
        assert!(BindTarget::from_options(None, Some("127.0.0.1".into()), None).is_err());
        assert!(BindTarget::from_options(None, None, Some(7800)).is_err());
    }

    #[test]
    fn test_bind_target_both() {
        let result = BindTarget::from_options(
            Some(PathBuf::from("/tmp/t.sock")),
            Some("127.0.0.1".into()),
            Some(7800),
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_bind_target_display() {
        let tcp = BindTarget::Tcp {
            host: "0.0.0.0".into(),
            port: 7800,
        };
        assert_eq!(tcp.to_string(), "0.0.0.0:7800");
    }
}
