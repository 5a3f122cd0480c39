//! Local port forwarding to bound database instances.
//!
//! [`TunnelManager`] pushes a placeholder app, opens an SSH session routed
//! through it and forwards one loopback port per database.

mod forward;
mod manager;
mod ports;
mod probe;
mod ssh;

pub use forward::{BoxedStream, DuplexStream, ForwardingSession, Mapping, Transport};
pub use manager::TunnelManager;
pub use ports::{allocate_free_port, allocate_free_ports};
pub use probe::{MysqlProbe, Probe};
pub use ssh::{CfSshConnector, RouteConnector};
