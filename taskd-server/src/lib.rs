//! taskd server
//!
//! The host side of the taskd IPC protocol: a transport listener
//! (unix socket or TCP), a connection registry, a command router, a
//! task session registry, and an event broadcaster, all wired around a
//! pluggable [`TaskEngine`]. The bundled [`LoopbackEngine`] simulates
//! task runs so the whole stack can be driven without a real runner.

pub mod broadcast;
pub mod engine;
pub mod handlers;
pub mod listener;
pub mod loopback;
pub mod registry;
pub mod tasks;

pub use broadcast::Broadcaster;
pub use engine::{EngineEvents, Lifecycle, TaskEngine};
pub use listener::{BindTarget, IpcServer, ServerHandle};
pub use loopback::LoopbackEngine;
pub use registry::ClientRegistry;
pub use tasks::{TaskRegistry, TaskSession, TaskState};
