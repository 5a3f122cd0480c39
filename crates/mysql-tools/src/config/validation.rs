//! Configuration validation.

use super::Config;
use crate::error::{Result, ToolsError};

/// Upper bound on task fetch attempts.
pub const MAX_API_ATTEMPTS: u32 = 10;

/// Validate the configuration.
pub fn validate(config: &Config) -> Result<()> {
    if config.cf.binary.as_os_str().is_empty() {
        return Err(ToolsError::Config("cf.binary is required".into()));
    }

    // Migration validation
    if config.migration.app_name_prefix.is_empty() {
        return Err(ToolsError::Config(
            "migration.app_name_prefix is required".into(),
        ));
    }
    if config.migration.buildpack.is_empty() {
        return Err(ToolsError::Config("migration.buildpack is required".into()));
    }
    if config.migration.task_poll_interval_ms == 0 {
        return Err(ToolsError::Config(
            "migration.task_poll_interval_ms must be at least 1".into(),
        ));
    }
    if let Some(0) = config.migration.task_timeout_secs {
        return Err(ToolsError::Config(
            "migration.task_timeout_secs must be at least 1".into(),
        ));
    }
    if config.migration.rename_suffix.is_empty() {
        return Err(ToolsError::Config(
            "migration.rename_suffix is required".into(),
        ));
    }

    // Tunnel validation
    if config.tunnel.app_name.is_empty() {
        return Err(ToolsError::Config("tunnel.app_name is required".into()));
    }
    if config.tunnel.service_key_name.is_empty() {
        return Err(ToolsError::Config(
            "tunnel.service_key_name is required".into(),
        ));
    }
    if config.tunnel.remote_port == 0 {
        return Err(ToolsError::Config(
            "tunnel.remote_port must be a valid port".into(),
        ));
    }
    if config.tunnel.poll_timeout_secs == 0 {
        return Err(ToolsError::Config(
            "tunnel.poll_timeout_secs must be at least 1".into(),
        ));
    }
    if config.tunnel.poll_interval_ms == 0 {
        return Err(ToolsError::Config(
            "tunnel.poll_interval_ms must be at least 1".into(),
        ));
    }

    if config.api.max_attempts == 0 {
        return Err(ToolsError::Config(
            "api.max_attempts must be at least 1".into(),
        ));
    }
    if config.api.max_attempts > MAX_API_ATTEMPTS {
        return Err(ToolsError::Config(format!(
            "api.max_attempts must be at most {}",
            MAX_API_ATTEMPTS
        )));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(validate(&Config::default()).is_ok());
    }

    #[test]
    fn test_empty_app_prefix() {
        let mut config = Config::default();
        config.migration.app_name_prefix = "".to_string();
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_zero_task_timeout() {
        let mut config = Config::default();
        config.migration.task_timeout_secs = Some(0);
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_zero_remote_port() {
        let mut config = Config::default();
        config.tunnel.remote_port = 0;
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_zero_poll_interval() {
        let mut config = Config::default();
        config.tunnel.poll_interval_ms = 0;
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_zero_max_attempts() {
        let mut config = Config::default();
        config.api.max_attempts = 0;
        let err = validate(&config).unwrap_err();
        assert!(err.to_string().contains("api.max_attempts"));
    }

    #[test]
    fn test_too_many_max_attempts() {
        let mut config = Config::default();
        config.api.max_attempts = MAX_API_ATTEMPTS;
        assert!(validate(&config).is_ok());

        config.api.max_attempts = 40;
        let err = validate(&config).unwrap_err();
        assert!(err.to_string().contains("at most 10"));
    }
}
