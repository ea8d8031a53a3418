//! taskd-server daemon
//!
//! Binds the IPC endpoint and serves the loopback engine until
//! interrupted. Configuration comes from the environment:
//!
//!   TASKD_SOCKET_PATH  unix socket to bind (default: runtime dir)
//!   TASKD_TCP_HOST     TCP host to bind instead of a socket
//!   TASKD_TCP_PORT     TCP port, required with TASKD_TCP_HOST
//!   TASKD_LOG          log filter (default: info)

use std::path::PathBuf;
use std::sync::Arc;

use tracing::info;

use taskd_server::{BindTarget, EngineEvents, IpcServer, LoopbackEngine};
use taskd_utils::{init_logging_with_config, LogConfig, Result, TaskdError};

fn bind_target_from_env() -> Result<BindTarget> {
    let socket_path = std::env::var_os("TASKD_SOCKET_PATH").map(PathBuf::from);
    let host = std::env::var("TASKD_TCP_HOST").ok();
    let port = match std::env::var("TASKD_TCP_PORT") {
        Ok(raw) => Some(
            raw.parse::<u16>()
                .map_err(|_| TaskdError::config(format!("Invalid TASKD_TCP_PORT: {}", raw)))?,
        ),
        Err(_) => None,
    };

    if socket_path.is_none() && host.is_none() && port.is_none() {
        return Ok(BindTarget::Socket(taskd_utils::socket_path()));
    }
    BindTarget::from_options(socket_path, host, port)
}

#[tokio::main]
async fn main() -> Result<()> {
    let mut config = LogConfig::server();
    // Daemonization is out of scope, so stderr is more useful than a file.
    config.output = taskd_utils::LogOutput::Stderr;
    init_logging_with_config(config)?;

    let bind = bind_target_from_env()?;
    let (events, lifecycle) = EngineEvents::channel();
    let engine = Arc::new(LoopbackEngine::new(events));
    let server = IpcServer::new(bind, engine, lifecycle);
    let handle = server.listen().await?;

    tokio::signal::ctrl_c().await?;
    info!("Interrupt received, shutting down");
    handle.shutdown();
    Ok(())
}
