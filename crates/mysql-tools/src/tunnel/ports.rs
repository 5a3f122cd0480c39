//! Ephemeral local port allocation.

use std::net::{Ipv4Addr, SocketAddr};

use tokio::net::TcpListener;

use crate::error::{Result, ToolsError};

/// Ask the OS for a free loopback port.
///
/// The listener is released before returning, so another process can take
/// the port before the forwarding session rebinds it. That window is
/// accepted and not retried.
pub async fn allocate_free_port() -> Result<u16> {
    let mut ports = allocate_free_ports(1).await?;
    Ok(ports.remove(0))
}

/// Allocate `count` distinct free loopback ports.
///
/// All listeners are held until every port is known, so the OS cannot hand
/// out the same port twice within one call.
pub async fn allocate_free_ports(count: usize) -> Result<Vec<u16>> {
    let mut listeners = Vec::with_capacity(count);
    for _ in 0..count {
        let listener = TcpListener::bind(SocketAddr::from((Ipv4Addr::LOCALHOST, 0)))
            .await
            .map_err(|e| ToolsError::Port {
                message: e.to_string(),
            })?;
        listeners.push(listener);
    }

    listeners
        .iter()
        .map(|l| {
            l.local_addr()
                .map(|addr| addr.port())
                .map_err(|e| ToolsError::Port {
                    message: e.to_string(),
                })
        })
        .collect()
}
