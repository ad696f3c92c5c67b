//! Sidecar core: namespace entry, bridge sockets, readiness and signal-driven
//! shutdown for the launcher-pod companion daemons.

pub mod anchor;
pub mod cli;
pub mod config;
pub mod daemon;
pub mod error;
pub mod handler;
pub mod lifecycle;
pub mod logging;
pub mod namespace;
pub mod readiness;
pub mod server;
pub mod socket;

pub use anchor::PathAnchor;
pub use error::{NamespaceError, Result, SidecarError};
pub use handler::{ConnectionHandler, Forward, HoldOpen};
pub use lifecycle::{LifecycleMonitor, Shutdown, ShutdownReason, ShutdownTrigger};
pub use readiness::Readiness;
pub use server::{BridgeServer, ServeSummary};
pub use socket::BridgeSocket;
