//! Platform operations used by the migration workflow.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};

use super::api::{parse_json, App, Resources, Task};
use super::runner::CommandRunner;
use crate::config::Config;
use crate::error::{Result, ToolsError};

/// Largest doubling applied to the task fetch backoff.
const MAX_BACKOFF_EXPONENT: u32 = 5;

/// Application and task lifecycle on the platform.
///
/// Implementations wrap every failure with the action that was being
/// attempted; callers propagate without re-wrapping.
#[async_trait]
pub trait PlatformClient: Send + Sync {
    /// Fail unless the named service instance exists in the current space.
    async fn check_service_exists(&self, service_name: &str) -> Result<()>;

    /// Push the directory at `path` as a stopped, routeless app.
    async fn push_app(&self, path: &Path, app_name: &str) -> Result<()>;

    async fn bind_service(&self, app_name: &str, service_name: &str) -> Result<()>;

    async fn start_app(&self, app_name: &str) -> Result<()>;

    async fn get_app_by_name(&self, app_name: &str) -> Result<App>;

    /// Create a task. A response carrying errors is a failure even when the
    /// request itself went through.
    async fn create_task(&self, app: &App, command: &str) -> Result<Task>;

    async fn get_task_by_guid(&self, guid: &str) -> Result<Task>;

    /// Print the app's recent logs to the terminal. Best effort.
    async fn dump_logs(&self, app_name: &str);

    async fn delete_app(&self, app_name: &str) -> Result<()>;

    async fn rename_service(&self, old_name: &str, new_name: &str) -> Result<()>;
}

/// [`PlatformClient`] that drives the platform CLI through a [`CommandRunner`].
pub struct CfClient {
    runner: Arc<dyn CommandRunner>,
    buildpack: String,
    start_command: String,
    max_attempts: u32,
    backoff_base: Duration,
    space_guid: Option<String>,
}

impl CfClient {
    pub fn new(runner: Arc<dyn CommandRunner>, config: &Config) -> Self {
        Self {
            runner,
            buildpack: config.migration.buildpack.clone(),
            start_command: config.migration.start_command.clone(),
            max_attempts: config.api.max_attempts,
            backoff_base: Duration::from_secs(1),
            space_guid: None,
        }
    }

    /// Restrict app lookups to the given space.
    pub fn with_space_guid(mut self, space_guid: impl Into<String>) -> Self {
        self.space_guid = Some(space_guid.into());
        self
    }

    async fn request_task(&self, guid: &str) -> Result<Task> {
        let path = format!("/v3/tasks/{}", guid);
        let output = self
            .runner
            .run_quiet(&["curl", &path])
            .await
            .map_err(|e| ToolsError::command("failed to retrieve task", e))?;

        let task: Task = parse_json(&output)?;
        if let Some(err) = task.errors.first() {
            return Err(err.clone().into_error("failed to retrieve task"));
        }

        Ok(task)
    }

    async fn refresh_access_token(&self) {
        if let Err(e) = self.runner.run_quiet(&["oauth-token"]).await {
            warn!("failed to refresh the access token: {}", e);
        }
    }
}

/// `base * 2^attempt`, doubling at most [`MAX_BACKOFF_EXPONENT`] times.
fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    base * (1u32 << attempt.min(MAX_BACKOFF_EXPONENT))
}

/// Look up the single app called `app_name`, optionally within one space.
pub(crate) async fn find_app_by_name(
    runner: &dyn CommandRunner,
    app_name: &str,
    space_guid: Option<&str>,
) -> Result<App> {
    let mut path = format!("/v3/apps?names={}", app_name);
    if let Some(space_guid) = space_guid {
        path.push_str("&space_guids=");
        path.push_str(space_guid);
    }

    let output = runner
        .run_quiet(&["curl", &path])
        .await
        .map_err(|e| ToolsError::command("failed to retrieve an app by name", e))?;

    let mut apps: Resources<App> = parse_json(&output)?;
    match apps.resources.len() {
        1 => Ok(apps.resources.remove(0)),
        0 => Err(ToolsError::command(
            "failed to retrieve an app by name",
            "none found",
        )),
        n => Err(ToolsError::command(
            "failed to retrieve an app by name",
            format!("expected exactly one app named {:?}, found {}", app_name, n),
        )),
    }
}

fn is_invalid_auth_token(err: &ToolsError) -> bool {
    matches!(err, ToolsError::Remote { title, .. } if title == "CF-InvalidAuthToken")
}

#[async_trait]
impl PlatformClient for CfClient {
    async fn check_service_exists(&self, service_name: &str) -> Result<()> {
        self.runner
            .run_quiet(&["service", service_name])
            .await
            .map(|_| ())
            .map_err(|e| {
                ToolsError::command(format!("service instance '{}' not found", service_name), e)
            })
    }

    async fn push_app(&self, path: &Path, app_name: &str) -> Result<()> {
        let path = path.to_string_lossy();
        self.runner
            .run_quiet(&[
                "push",
                app_name,
                "-b",
                &self.buildpack,
                "-u",
                "none",
                "-c",
                &self.start_command,
                "-p",
                &path,
                "--no-route",
                "--no-start",
            ])
            .await
            .map(|_| ())
            .map_err(|e| ToolsError::command("failed to push application", e))
    }

    async fn bind_service(&self, app_name: &str, service_name: &str) -> Result<()> {
        self.runner
            .run_quiet(&["bind-service", app_name, service_name])
            .await
            .map(|_| ())
            .map_err(|e| {
                ToolsError::command(
                    format!(
                        "failed to bind-service {:?} to application {:?}",
                        service_name, app_name
                    ),
                    e,
                )
            })
    }

    async fn start_app(&self, app_name: &str) -> Result<()> {
        self.runner
            .run_quiet(&["start", app_name])
            .await
            .map(|_| ())
            .map_err(|e| ToolsError::command(format!("failed to start application {:?}", app_name), e))
    }

    async fn get_app_by_name(&self, app_name: &str) -> Result<App> {
        find_app_by_name(self.runner.as_ref(), app_name, self.space_guid.as_deref()).await
    }

    async fn create_task(&self, app: &App, command: &str) -> Result<Task> {
        let body = serde_json::json!({ "command": command }).to_string();
        let path = format!("/v3/apps/{}/tasks", app.guid);

        let output = self
            .runner
            .run_quiet(&["curl", "-X", "POST", "-d", &body, &path])
            .await
            .map_err(|e| ToolsError::command("failed to create a task", e))?;

        let task: Task = parse_json(&output)?;
        if let Some(err) = task.errors.first() {
            return Err(err.clone().into_error("failed to create a task"));
        }

        debug!("Created task {} on {}", task.guid, app.name);
        Ok(task)
    }

    async fn get_task_by_guid(&self, guid: &str) -> Result<Task> {
        let mut last_error = None;

        for attempt in 0..self.max_attempts {
            if attempt > 0 {
                tokio::time::sleep(backoff_delay(self.backoff_base, attempt)).await;
            }

            match self.request_task(guid).await {
                Ok(task) => return Ok(task),
                Err(e) => {
                    if is_invalid_auth_token(&e) {
                        self.refresh_access_token().await;
                    }
                    warn!(
                        "Attempt {}/{}: failed to retrieve task by GUID: {}",
                        attempt + 1,
                        self.max_attempts,
                        e
                    );
                    last_error = Some(e);
                }
            }
        }

        Err(ToolsError::command(
            "failed to retrieve task by GUID",
            last_error.map(|e| e.to_string()).unwrap_or_default(),
        ))
    }

    async fn dump_logs(&self, app_name: &str) {
        if let Err(e) = self.runner.run(&["logs", "--recent", app_name]).await {
            warn!("failed to fetch logs for {}: {}", app_name, e);
        }
    }

    async fn delete_app(&self, app_name: &str) -> Result<()> {
        self.runner
            .run_quiet(&["delete", "-f", app_name])
            .await
            .map(|_| ())
            .map_err(|e| ToolsError::command(format!("failed to delete application {:?}", app_name), e))
    }

    async fn rename_service(&self, old_name: &str, new_name: &str) -> Result<()> {
        self.runner
            .run_quiet(&["rename-service", old_name, new_name])
            .await
            .map(|_| ())
            .map_err(|e| {
                ToolsError::command(
                    format!("failed to rename-service {:?} to {:?}", old_name, new_name),
                    e,
                )
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cf::TaskState;
    use crate::testing::{command_failure, lines, FakeRunner};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn client(runner: &Arc<FakeRunner>) -> CfClient {
        CfClient::new(runner.clone(), &Config::default())
    }

    #[tokio::test]
    async fn test_push_app_args() {
        let runner = Arc::new(FakeRunner::ok());
        client(&runner)
            .push_app(Path::new("/tmp/migrate_app_x"), "migrate-app-1")
            .await
            .unwrap();

        assert_eq!(
            runner.calls_to("push"),
            vec![vec![
                "push",
                "migrate-app-1",
                "-b",
                "binary_buildpack",
                "-u",
                "none",
                "-c",
                "sleep infinity",
                "-p",
                "/tmp/migrate_app_x",
                "--no-route",
                "--no-start",
            ]]
        );
        assert!(runner.calls()[0].quiet);
    }

    #[tokio::test]
    async fn test_bind_service_failure_names_both_sides() {
        let runner = Arc::new(FakeRunner::new(|_| Err(command_failure("boom"))));
        let err = client(&runner)
            .bind_service("migrate-app-1", "donor-db")
            .await
            .unwrap_err();
        assert!(err
            .to_string()
            .starts_with("failed to bind-service \"donor-db\" to application \"migrate-app-1\""));
    }

    #[tokio::test]
    async fn test_get_app_by_name_scoped_to_space() {
        let runner = Arc::new(FakeRunner::new(|_| {
            Ok(lines(r#"{"resources": [{"name": "migrate-app-1", "guid": "app-guid"}]}"#))
        }));
        let app = client(&runner)
            .with_space_guid("space-guid")
            .get_app_by_name("migrate-app-1")
            .await
            .unwrap();

        assert_eq!(app.guid, "app-guid");
        assert_eq!(
            runner.calls_to("curl"),
            vec![vec![
                "curl",
                "/v3/apps?names=migrate-app-1&space_guids=space-guid"
            ]]
        );
    }

    #[tokio::test]
    async fn test_get_app_by_name_none_found() {
        let runner = Arc::new(FakeRunner::new(|_| Ok(lines(r#"{"resources": []}"#))));
        let err = client(&runner).get_app_by_name("absent").await.unwrap_err();
        assert_eq!(err.to_string(), "failed to retrieve an app by name: none found");
    }

    #[tokio::test]
    async fn test_get_app_by_name_rejects_duplicates() {
        let runner = Arc::new(FakeRunner::new(|_| {
            Ok(lines(
                r#"{"resources": [{"name": "static-app", "guid": "a"}, {"name": "static-app", "guid": "b"}]}"#,
            ))
        }));
        let err = client(&runner).get_app_by_name("static-app").await.unwrap_err();
        assert!(err
            .to_string()
            .contains("expected exactly one app named \"static-app\", found 2"));
    }

    #[tokio::test]
    async fn test_create_task_posts_command() {
        let runner = Arc::new(FakeRunner::new(|_| {
            Ok(lines(r#"{"guid": "task-guid", "state": "PENDING"}"#))
        }));
        let app = App {
            name: "migrate-app-1".into(),
            guid: "app-guid".into(),
        };
        let task = client(&runner)
            .create_task(&app, "./migrate donor recipient")
            .await
            .unwrap();

        assert_eq!(task.guid, "task-guid");
        assert_eq!(task.state, Some(TaskState::Pending));
        assert_eq!(
            runner.calls_to("curl"),
            vec![vec![
                "curl",
                "-X",
                "POST",
                "-d",
                r#"{"command":"./migrate donor recipient"}"#,
                "/v3/apps/app-guid/tasks",
            ]]
        );
    }

    #[tokio::test]
    async fn test_create_task_with_errors_in_body_fails() {
        let runner = Arc::new(FakeRunner::new(|_| {
            Ok(lines(
                r#"{"errors": [{"detail": "app not staged", "title": "CF-UnprocessableEntity", "code": 10008}]}"#,
            ))
        }));
        let app = App {
            name: "a".into(),
            guid: "g".into(),
        };
        let err = client(&runner).create_task(&app, "./migrate a b").await.unwrap_err();

        assert!(matches!(err, ToolsError::Remote { code: 10008, .. }));
        assert_eq!(
            err.to_string(),
            "failed to create a task: 10008: CF-UnprocessableEntity - app not staged"
        );
        assert_eq!(runner.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_create_task_bad_json() {
        let runner = Arc::new(FakeRunner::new(|_| Ok(lines("not json"))));
        let app = App {
            name: "a".into(),
            guid: "g".into(),
        };
        let err = client(&runner).create_task(&app, "cmd").await.unwrap_err();
        assert!(matches!(err, ToolsError::Parse { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_get_task_retries_then_succeeds() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = attempts.clone();
        let runner = Arc::new(FakeRunner::new(move |_| {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(command_failure("connection reset"))
            } else {
                Ok(lines(r#"{"guid": "task-guid", "state": "SUCCEEDED"}"#))
            }
        }));

        let task = client(&runner).get_task_by_guid("task-guid").await.unwrap();
        assert_eq!(task.state, Some(TaskState::Succeeded));
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_get_task_gives_up_after_max_attempts() {
        let runner = Arc::new(FakeRunner::new(|_| Err(command_failure("unavailable"))));
        let err = client(&runner).get_task_by_guid("task-guid").await.unwrap_err();

        assert!(err.to_string().starts_with("failed to retrieve task by GUID"));
        assert_eq!(runner.calls_to("curl").len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_get_task_refreshes_invalid_token() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = attempts.clone();
        let runner = Arc::new(FakeRunner::new(move |args| {
            if args[0] == "oauth-token" {
                return Ok(vec!["bearer new-token".into()]);
            }
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                Ok(lines(
                    r#"{"errors": [{"detail": "Invalid Auth Token", "title": "CF-InvalidAuthToken", "code": 1000}]}"#,
                ))
            } else {
                Ok(lines(r#"{"guid": "task-guid", "state": "RUNNING"}"#))
            }
        }));

        let task = client(&runner).get_task_by_guid("task-guid").await.unwrap();
        assert_eq!(task.state, Some(TaskState::Running));
        assert_eq!(runner.calls_to("oauth-token").len(), 1);
    }

    #[test]
    fn test_backoff_delay_is_capped() {
        let base = Duration::from_secs(1);
        assert_eq!(backoff_delay(base, 1), Duration::from_secs(2));
        assert_eq!(backoff_delay(base, 2), Duration::from_secs(4));
        assert_eq!(backoff_delay(base, 5), Duration::from_secs(32));
        assert_eq!(backoff_delay(base, 32), Duration::from_secs(32));
        assert_eq!(backoff_delay(base, u32::MAX), Duration::from_secs(32));
    }

    #[tokio::test(start_paused = true)]
    async fn test_get_task_many_attempts_stay_bounded() {
        let runner = Arc::new(FakeRunner::new(|_| Err(command_failure("unavailable"))));
        let mut config = Config::default();
        config.api.max_attempts = 40;
        let client = CfClient::new(runner.clone(), &config);

        let started = tokio::time::Instant::now();
        let err = client.get_task_by_guid("g").await.unwrap_err();

        assert!(err.to_string().starts_with("failed to retrieve task by GUID"));
        assert_eq!(runner.calls_to("curl").len(), 40);
        // 2 + 4 + 8 + 16 + 32 * 35
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(1150));
        assert!(elapsed < Duration::from_secs(1151));
    }

    #[tokio::test]
    async fn test_delete_and_rename_args() {
        let runner = Arc::new(FakeRunner::ok());
        let client = client(&runner);
        client.delete_app("migrate-app-1").await.unwrap();
        client.rename_service("donor", "donor-old").await.unwrap();

        assert_eq!(runner.calls_to("delete"), vec![vec!["delete", "-f", "migrate-app-1"]]);
        assert_eq!(
            runner.calls_to("rename-service"),
            vec![vec!["rename-service", "donor", "donor-old"]]
        );
    }

    #[tokio::test]
    async fn test_dump_logs_is_echoed_and_best_effort() {
        let runner = Arc::new(FakeRunner::new(|_| Err(command_failure("no logs"))));
        client(&runner).dump_logs("migrate-app-1").await;

        let calls = runner.calls();
        assert_eq!(calls.len(), 1);
        assert!(!calls[0].quiet);
        assert_eq!(calls[0].args, vec!["logs", "--recent", "migrate-app-1"]);
    }

    #[tokio::test]
    async fn test_check_service_exists() {
        let runner = Arc::new(FakeRunner::new(|args| {
            if args[1] == "present" {
                Ok(vec![])
            } else {
                Err(command_failure("Service instance absent not found"))
            }
        }));
        let client = client(&runner);
        assert!(client.check_service_exists("present").await.is_ok());
        let err = client.check_service_exists("absent").await.unwrap_err();
        assert!(err.to_string().starts_with("service instance 'absent' not found"));
    }
}
