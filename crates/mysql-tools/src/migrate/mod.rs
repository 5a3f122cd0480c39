//! Migration workflow.
//!
//! Pushes a throwaway worker app bound to both the donor and the recipient
//! instance, runs the copy as a task on it and removes the app again.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cf::{PlatformClient, Task, TaskState};
use crate::config::MigrationConfig;
use crate::error::{Result, ToolsError};
use crate::unpack::Unpacker;

/// Step the workflow is currently performing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationState {
    Idle,
    Unpacking,
    Pushing,
    BoundToDonor,
    BoundToRecipient,
    Started,
    TaskRunning,
    Succeeded,
    Failed,
}

impl fmt::Display for MigrationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

pub struct Migrator {
    client: Arc<dyn PlatformClient>,
    unpacker: Arc<dyn Unpacker>,
    config: MigrationConfig,
    cancel: CancellationToken,
    state: MigrationState,
}

impl Migrator {
    pub fn new(
        client: Arc<dyn PlatformClient>,
        unpacker: Arc<dyn Unpacker>,
        config: MigrationConfig,
    ) -> Self {
        Self {
            client,
            unpacker,
            config,
            cancel: CancellationToken::new(),
            state: MigrationState::Idle,
        }
    }

    /// Abort the workflow with [`ToolsError::Cancelled`] once `cancel` fires.
    /// The worker app is still deleted.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn state(&self) -> MigrationState {
        self.state
    }

    /// Copy all data from `donor` into `recipient`.
    pub async fn migrate_data(&mut self, donor: &str, recipient: &str) -> Result<()> {
        let cancel = self.cancel.clone();

        cancellable(&cancel, self.client.check_service_exists(donor)).await?;
        cancellable(&cancel, self.client.check_service_exists(recipient)).await?;

        self.enter(MigrationState::Unpacking);
        let tmp_dir = tempfile::Builder::new().prefix("migrate_app_").tempdir()?;
        info!("Unpacking assets for migration to {}", tmp_dir.path().display());
        cancellable(&cancel, self.unpacker.unpack(tmp_dir.path())).await?;

        self.enter(MigrationState::Pushing);
        let app_name = format!("{}{}", self.config.app_name_prefix, Uuid::new_v4());
        info!("Started to push app {}", app_name);
        // Push always runs to completion; the guard only exists once it returns.
        self.client.push_app(tmp_dir.path(), &app_name).await?;
        let mut guard = WorkerAppGuard::new(self.client.clone(), &app_name);
        info!("Successfully pushed app");

        let result = cancellable(&cancel, self.run_worker(&app_name, donor, recipient)).await;

        if result.is_err() && !self.config.cleanup {
            warn!("Leaving worker app {} in place for inspection", app_name);
            guard.disarm();
        }
        guard.release().await;
        result
    }

    /// Retire the donor's name and hand it to the recipient.
    ///
    /// The two renames are not atomic. If the second one fails the donor
    /// already carries its retired name; the error says so and nothing is
    /// rolled back.
    pub async fn rename_service_instances(&self, donor: &str, recipient: &str) -> Result<()> {
        let retired = format!("{}{}", donor, self.config.rename_suffix);

        self.client.rename_service(donor, &retired).await?;
        info!("Renamed {} to {}", donor, retired);

        if let Err(e) = self.client.rename_service(recipient, donor).await {
            warn!(
                "{} is now named {}; run 'cf rename-service {} {}' to finish",
                donor, retired, recipient, donor
            );
            return Err(e);
        }
        info!("Renamed {} to {}", recipient, donor);
        Ok(())
    }

    async fn run_worker(&mut self, app_name: &str, donor: &str, recipient: &str) -> Result<()> {
        self.enter(MigrationState::BoundToDonor);
        self.client.bind_service(app_name, donor).await?;
        info!("Successfully bound app to {}", donor);

        self.enter(MigrationState::BoundToRecipient);
        self.client.bind_service(app_name, recipient).await?;
        info!("Successfully bound app to {}", recipient);

        self.enter(MigrationState::Started);
        info!("Starting migration app");
        self.client.start_app(app_name).await?;

        self.enter(MigrationState::TaskRunning);
        info!("Started to run migration task");
        let app = self.client.get_app_by_name(app_name).await?;
        let command = self.task_command(donor, recipient);
        let task = self.client.create_task(&app, &command).await?;
        let task = self.wait_for_task(&task.guid).await?;

        match task.state {
            Some(TaskState::Succeeded) => {
                self.enter(MigrationState::Succeeded);
                info!("Migration completed successfully");
                Ok(())
            }
            state => {
                self.enter(MigrationState::Failed);
                let state = state.unwrap_or(TaskState::Unknown);
                warn!("Migration task finished in state {}", state);

                info!("Fetching log output...");
                tokio::time::sleep(self.config.log_flush_delay()).await;
                self.client.dump_logs(app_name).await;

                Err(ToolsError::TaskFailed {
                    state: state.as_str().to_string(),
                })
            }
        }
    }

    fn task_command(&self, donor: &str, recipient: &str) -> String {
        if self.config.skip_tls_validation {
            format!("./migrate -skip-tls-validation {} {}", donor, recipient)
        } else {
            format!("./migrate {} {}", donor, recipient)
        }
    }

    async fn wait_for_task(&self, guid: &str) -> Result<Task> {
        match self.config.task_timeout() {
            Some(limit) => tokio::time::timeout(limit, self.poll_task(guid))
                .await
                .map_err(|_| ToolsError::timeout(format!("task {}", guid), limit))?,
            None => self.poll_task(guid).await,
        }
    }

    async fn poll_task(&self, guid: &str) -> Result<Task> {
        let mut ticker = tokio::time::interval(self.config.task_poll_interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            let task = self.client.get_task_by_guid(guid).await?;
            debug!("Task {} is {:?}", guid, task.state);
            if task.is_terminal() {
                return Ok(task);
            }
        }
    }

    fn enter(&mut self, next: MigrationState) {
        debug!("Migration state: {} -> {}", self.state, next);
        self.state = next;
    }
}

async fn cancellable<T>(
    cancel: &CancellationToken,
    fut: impl Future<Output = Result<T>>,
) -> Result<T> {
    tokio::select! {
        _ = cancel.cancelled() => Err(ToolsError::Cancelled),
        res = fut => res,
    }
}

/// Deletes the worker app when released, or from `Drop` if the workflow
/// future is dropped before reaching the release point.
struct WorkerAppGuard {
    client: Arc<dyn PlatformClient>,
    app_name: String,
    armed: bool,
}

impl WorkerAppGuard {
    fn new(client: Arc<dyn PlatformClient>, app_name: &str) -> Self {
        Self {
            client,
            app_name: app_name.to_string(),
            armed: true,
        }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }

    async fn release(mut self) {
        if !self.armed {
            return;
        }
        self.armed = false;

        info!("Cleaning up...");
        if let Err(e) = self.client.delete_app(&self.app_name).await {
            warn!("{}", e);
        }
    }
}

impl Drop for WorkerAppGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let client = self.client.clone();
                let app_name = std::mem::take(&mut self.app_name);
                handle.spawn(async move {
                    if let Err(e) = client.delete_app(&app_name).await {
                        warn!("{}", e);
                    }
                });
            }
            Err(_) => warn!("No runtime available; worker app {} was not deleted", self.app_name),
        }
    }
}
