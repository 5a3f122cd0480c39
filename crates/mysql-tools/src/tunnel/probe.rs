//! Reachability probe for forwarded database ports.

use async_trait::async_trait;
use mysql_async::prelude::*;
use mysql_async::{Conn, Opts, OptsBuilder};
use tracing::debug;

use crate::error::{Result, ToolsError};
use crate::service::ServiceInfo;

/// Checks that a database answers through a local port.
#[async_trait]
pub trait Probe: Send + Sync {
    async fn ping(&self, info: &ServiceInfo, local_port: u16) -> Result<()>;
}

/// Opens a MySQL session on the loopback port and runs a trivial query.
#[derive(Debug, Default, Clone, Copy)]
pub struct MysqlProbe;

#[async_trait]
impl Probe for MysqlProbe {
    async fn ping(&self, info: &ServiceInfo, local_port: u16) -> Result<()> {
        let opts: Opts = OptsBuilder::default()
            .ip_or_hostname("127.0.0.1")
            .tcp_port(local_port)
            .user(Some(&info.username))
            .pass(Some(&info.password))
            .db_name(Some(&info.db_name))
            .into();

        let mut conn = Conn::new(opts).await.map_err(|e| {
            ToolsError::tunnel(format!("connect via 127.0.0.1:{}: {}", local_port, e))
        })?;

        conn.query_drop("SELECT 1").await.map_err(|e| {
            ToolsError::tunnel(format!("ping via 127.0.0.1:{}: {}", local_port, e))
        })?;

        if let Err(e) = conn.disconnect().await {
            debug!("disconnect after probe on {}: {}", local_port, e);
        }
        Ok(())
    }
}
