//! Service keys: named credential objects for a service instance.

use std::fmt;
use std::sync::Arc;

use serde::Deserialize;
use tracing::{debug, warn};

use crate::cf::CommandRunner;
use crate::error::{Result, ToolsError};

/// Lines of human-readable banner printed before the key body.
const BANNER_LINES: usize = 2;

/// Connection details extracted from a service key.
///
/// Lives only in process memory for the duration of one workflow.
#[derive(Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ServiceInfo {
    pub hostname: String,
    pub username: String,
    pub password: String,
    #[serde(rename = "name")]
    pub db_name: String,
    /// Local port forwarded to `hostname`, once a tunnel is up.
    #[serde(skip)]
    pub local_port: Option<u16>,
}

impl fmt::Debug for ServiceInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceInfo")
            .field("hostname", &self.hostname)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("db_name", &self.db_name)
            .field("local_port", &self.local_port)
            .finish()
    }
}

// Newer CLIs nest the credentials one level down.
#[derive(Deserialize)]
#[serde(untagged)]
enum KeyBody {
    Wrapped { credentials: ServiceInfo },
    Flat(ServiceInfo),
}

/// A service instance and the service key used to read its credentials.
pub struct ServiceInstance {
    runner: Arc<dyn CommandRunner>,
    instance_name: String,
    key_name: String,
}

impl ServiceInstance {
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        instance_name: impl Into<String>,
        key_name: impl Into<String>,
    ) -> Self {
        Self {
            runner,
            instance_name: instance_name.into(),
            key_name: key_name.into(),
        }
    }

    pub fn instance_name(&self) -> &str {
        &self.instance_name
    }

    /// Create the service key and read the credentials out of it.
    ///
    /// Creating a key whose name already exists is left to the platform; the
    /// subsequent fetch reads whichever key carries that name.
    pub async fn service_info(&self) -> Result<ServiceInfo> {
        self.runner
            .run_quiet(&["create-service-key", &self.instance_name, &self.key_name])
            .await
            .map_err(|e| ToolsError::command("failed to create-service-key", e))?;
        debug!(
            "Created service key {} for {}",
            self.key_name, self.instance_name
        );

        let output = self
            .runner
            .run_quiet(&["service-key", &self.instance_name, &self.key_name])
            .await
            .map_err(|e| ToolsError::command("failed to get service-key", e))?;

        parse_service_key(&output).map_err(|message| {
            ToolsError::parse(
                format!(
                    "failed to parse service-key {:?} for {:?}",
                    self.key_name, self.instance_name
                ),
                message,
            )
        })
    }

    /// Delete the service key. Errors are logged and swallowed.
    pub async fn cleanup(&self) {
        if let Err(e) = self
            .runner
            .run_quiet(&["delete-service-key", "-f", &self.instance_name, &self.key_name])
            .await
        {
            warn!(
                "failed to delete service key {} for {}: {}",
                self.key_name, self.instance_name, e
            );
        }
    }
}

fn parse_service_key(output: &[String]) -> std::result::Result<ServiceInfo, String> {
    if output.len() <= BANNER_LINES {
        return Err("service-key output is truncated".to_string());
    }

    let body = output[BANNER_LINES..].join("\n");
    match serde_json::from_str::<KeyBody>(&body) {
        Ok(KeyBody::Wrapped { credentials }) => Ok(credentials),
        Ok(KeyBody::Flat(info)) => Ok(info),
        Err(e) => Err(e.to_string()),
    }
}
