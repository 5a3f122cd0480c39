//! Platform SSH transport.
//!
//! Logs into the platform's SSH proxy with a one-time passcode as the
//! first instance of an app, then opens `direct-tcpip` channels through it.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::client;
use serde::Deserialize;
use tracing::{debug, info};

use super::forward::{BoxedStream, Transport};
use crate::cf::{find_app_by_name, parse_json, CommandRunner};
use crate::error::{Result, ToolsError};

/// Opens a [`Transport`] routed through a pushed application.
#[async_trait]
pub trait RouteConnector: Send + Sync {
    async fn connect(&self, app_name: &str) -> Result<Arc<dyn Transport>>;
}

#[derive(Debug, Deserialize)]
struct Info {
    #[serde(default)]
    app_ssh_endpoint: String,
    #[serde(default)]
    app_ssh_host_key_fingerprint: String,
}

/// Connects through the platform's SSH proxy.
pub struct CfSshConnector {
    runner: Arc<dyn CommandRunner>,
    space_guid: Option<String>,
}

impl CfSshConnector {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            runner,
            space_guid: None,
        }
    }

    /// Only route through apps in the given space.
    pub fn with_space_guid(mut self, space_guid: impl Into<String>) -> Self {
        self.space_guid = Some(space_guid.into());
        self
    }

    async fn endpoint(&self) -> Result<Info> {
        let output = self
            .runner
            .run_quiet(&["curl", "/v2/info"])
            .await
            .map_err(|e| ToolsError::command("failed to read platform info", e))?;
        let info: Info = parse_json(&output)?;
        if info.app_ssh_endpoint.is_empty() {
            return Err(ToolsError::tunnel("platform does not advertise an SSH endpoint"));
        }
        Ok(info)
    }

    async fn app_guid(&self, app_name: &str) -> Result<String> {
        let app =
            find_app_by_name(self.runner.as_ref(), app_name, self.space_guid.as_deref()).await?;
        Ok(app.guid)
    }

    async fn passcode(&self) -> Result<String> {
        let output = self
            .runner
            .run_quiet(&["ssh-code"])
            .await
            .map_err(|e| ToolsError::command("failed to get ssh-code", e))?;
        output
            .iter()
            .map(|l| l.trim())
            .find(|l| !l.is_empty())
            .map(str::to_string)
            .ok_or_else(|| ToolsError::tunnel("ssh-code returned no passcode"))
    }
}

#[async_trait]
impl RouteConnector for CfSshConnector {
    async fn connect(&self, app_name: &str) -> Result<Arc<dyn Transport>> {
        let info = self.endpoint().await?;
        let (host, port) = split_endpoint(&info.app_ssh_endpoint)?;
        let user = format!("cf:{}/0", self.app_guid(app_name).await?);
        let passcode = self.passcode().await?;

        let config = Arc::new(client::Config {
            keepalive_interval: Some(Duration::from_secs(30)),
            ..Default::default()
        });
        let handler = ProxyHandler {
            expected_fingerprint: info.app_ssh_host_key_fingerprint,
        };

        let mut handle = client::connect(config, (host.as_str(), port), handler)
            .await
            .map_err(|e| {
                ToolsError::tunnel(format!("SSH connection to {} failed: {}", info.app_ssh_endpoint, e))
            })?;

        let auth = handle
            .authenticate_password(user, passcode)
            .await
            .map_err(|e| ToolsError::tunnel(format!("SSH authentication failed: {}", e)))?;
        if !auth.success() {
            return Err(ToolsError::tunnel("SSH authentication rejected"));
        }

        info!("SSH session established via {}", info.app_ssh_endpoint);
        Ok(Arc::new(SshTransport { handle }))
    }
}

struct ProxyHandler {
    expected_fingerprint: String,
}

impl client::Handler for ProxyHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &russh::keys::PublicKey,
    ) -> std::result::Result<bool, Self::Error> {
        debug!(
            "Accepting SSH proxy host key (advertised fingerprint {})",
            self.expected_fingerprint
        );
        Ok(true)
    }
}

/// Channels are opened concurrently on the shared session.
struct SshTransport {
    handle: client::Handle<ProxyHandler>,
}

#[async_trait]
impl Transport for SshTransport {
    async fn dial(&self, host: &str, port: u16) -> Result<BoxedStream> {
        let channel = self
            .handle
            .channel_open_direct_tcpip(host, port as u32, "127.0.0.1", 0)
            .await
            .map_err(|e| ToolsError::tunnel(format!("direct-tcpip to {}:{}: {}", host, port, e)))?;
        Ok(Box::new(channel.into_stream()))
    }
}

fn split_endpoint(endpoint: &str) -> Result<(String, u16)> {
    let (host, port) = endpoint
        .rsplit_once(':')
        .ok_or_else(|| ToolsError::tunnel(format!("malformed SSH endpoint {:?}", endpoint)))?;
    let port = port
        .parse()
        .map_err(|_| ToolsError::tunnel(format!("malformed SSH endpoint {:?}", endpoint)))?;
    Ok((host.to_string(), port))
}
