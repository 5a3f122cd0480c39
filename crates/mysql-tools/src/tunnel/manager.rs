//! Tunnel lifecycle: push a placeholder app, forward local ports through it
//! and wait until every database answers.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::forward::{ForwardingSession, Mapping};
use super::ports::allocate_free_ports;
use super::probe::Probe;
use super::ssh::RouteConnector;
use crate::cf::CommandRunner;
use crate::config::TunnelConfig;
use crate::error::{Result, ToolsError};
use crate::service::ServiceInfo;

pub struct TunnelManager {
    runner: Arc<dyn CommandRunner>,
    connector: Arc<dyn RouteConnector>,
    probe: Arc<dyn Probe>,
    config: TunnelConfig,
    work_dir: PathBuf,
    session: Option<ForwardingSession>,
    pushed: bool,
}

impl TunnelManager {
    /// `work_dir` receives the placeholder app's files; the caller owns it.
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        connector: Arc<dyn RouteConnector>,
        probe: Arc<dyn Probe>,
        config: TunnelConfig,
        work_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            runner,
            connector,
            probe,
            config,
            work_dir: work_dir.into(),
            session: None,
            pushed: false,
        }
    }

    pub fn app_name(&self) -> &str {
        &self.config.app_name
    }

    /// Establish one forwarded port per service and wait for all of them.
    ///
    /// On success every entry of `infos` carries its `local_port`. On timeout
    /// the ports confirmed so far are still recorded.
    pub async fn start(&mut self, infos: &mut [ServiceInfo]) -> Result<()> {
        self.push_static_app().await?;

        let ports = allocate_free_ports(infos.len()).await?;
        let mappings: Vec<Mapping> = infos
            .iter()
            .zip(&ports)
            .map(|(info, port)| Mapping::new(*port, &info.hostname, self.config.remote_port))
            .collect();

        let transport = self.connector.connect(&self.config.app_name).await?;
        self.session = Some(
            ForwardingSession::open(transport, mappings, self.config.accept_backoff()).await?,
        );

        let timeout = self.config.poll_timeout();
        let mut confirmed = vec![false; infos.len()];
        let deadline = Instant::now() + timeout;
        let outcome = tokio::select! {
            _ = self.wait_for_tunnels(infos, &ports, &mut confirmed) => Ok(()),
            _ = tokio::time::sleep_until(deadline) => {
                Err(ToolsError::timeout("waiting for tunnels", timeout))
            }
        };

        for ((info, port), ok) in infos.iter_mut().zip(&ports).zip(&confirmed) {
            if *ok {
                info.local_port = Some(*port);
            }
        }
        outcome
    }

    /// Stop forwarding and delete the placeholder app. Best effort.
    pub async fn close(&mut self) {
        if let Some(session) = self.session.take() {
            session.close();
        }
        if !self.pushed {
            return;
        }
        self.pushed = false;

        if let Err(e) = self
            .runner
            .run(&["delete", &self.config.app_name, "-f"])
            .await
        {
            warn!("failed to delete application {:?}: {}", self.config.app_name, e);
        }
    }

    async fn push_static_app(&mut self) -> Result<()> {
        let app_dir = self.work_dir.join(&self.config.app_name);
        write_static_app(&app_dir).await?;

        let app_dir = app_dir.to_string_lossy().into_owned();
        self.pushed = true;
        self.runner
            .run(&[
                "push",
                &self.config.app_name,
                "--random-route",
                "-b",
                &self.config.buildpack,
                "-p",
                &app_dir,
            ])
            .await
            .map_err(|e| ToolsError::command("failed to push application", e))?;
        info!("Pushed {}", self.config.app_name);
        Ok(())
    }

    async fn wait_for_tunnels(&self, infos: &[ServiceInfo], ports: &[u16], confirmed: &mut [bool]) {
        let period = self.config.poll_interval();
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        while !confirmed.iter().all(|c| *c) {
            ticker.tick().await;
            for (i, (info, port)) in infos.iter().zip(ports).enumerate() {
                if confirmed[i] {
                    continue;
                }
                match tokio::time::timeout(period, self.probe.ping(info, *port)).await {
                    Ok(Ok(())) => {
                        info!("Tunnel to {} is up on port {}", info.hostname, port);
                        confirmed[i] = true;
                    }
                    Ok(Err(e)) => debug!("{} not reachable yet: {}", info.hostname, e),
                    Err(_) => debug!("probe of port {} timed out", port),
                }
            }
        }
    }
}

async fn write_static_app(dir: &Path) -> Result<()> {
    tokio::fs::create_dir_all(dir).await?;
    tokio::fs::write(dir.join("Staticfile"), b"").await?;
    tokio::fs::write(dir.join("index.html"), b"").await?;
    Ok(())
}
