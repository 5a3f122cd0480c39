//! Space Developer authorization check.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine;
use serde::Deserialize;
use tracing::debug;

use crate::cf::{parse_json, CommandRunner};
use crate::error::{Result, ToolsError};

pub const ROLE_SPACE_DEVELOPER: &str = "RoleSpaceDeveloper";

/// A targeted organization or space.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct Target {
    #[serde(rename = "GUID", default)]
    pub guid: String,
    #[serde(rename = "Name", default)]
    pub name: String,
}

/// A user holding at least one role in a space.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SpaceUser {
    pub guid: String,
    pub username: String,
    pub roles: Vec<String>,
}

/// Read-only view of the logged-in CLI session.
#[async_trait]
pub trait SessionInfo: Send + Sync {
    async fn current_org(&self) -> Result<Target>;
    async fn current_space(&self) -> Result<Target>;
    async fn user_guid(&self) -> Result<String>;
    async fn space_users(&self, org: &Target, space: &Target) -> Result<Vec<SpaceUser>>;
}

pub struct Reporter {
    session: Arc<dyn SessionInfo>,
}

impl Reporter {
    pub fn new(session: Arc<dyn SessionInfo>) -> Self {
        Self { session }
    }

    /// True iff the current user holds the Space Developer role in the
    /// targeted space. Any failed lookup is returned as an error.
    pub async fn is_space_developer(&self) -> Result<bool> {
        let org = self.session.current_org().await?;
        let space = self.session.current_space().await?;
        let user_guid = self.session.user_guid().await?;
        let users = self.session.space_users(&org, &space).await?;

        Ok(users.iter().any(|u| {
            u.guid == user_guid && u.roles.iter().any(|r| r == ROLE_SPACE_DEVELOPER)
        }))
    }
}

#[derive(Debug, Deserialize)]
struct CliConfig {
    #[serde(rename = "AccessToken", default)]
    access_token: String,
    #[serde(rename = "OrganizationFields", default)]
    organization: Target,
    #[serde(rename = "SpaceFields", default)]
    space: Target,
}

#[derive(Debug, Deserialize)]
struct TokenClaims {
    user_id: String,
}

#[derive(Debug, Deserialize)]
struct RolesPage {
    #[serde(default)]
    resources: Vec<Role>,
    #[serde(default)]
    included: Included,
}

#[derive(Debug, Deserialize)]
struct Role {
    #[serde(rename = "type")]
    role_type: String,
    relationships: RoleRelationships,
}

#[derive(Debug, Deserialize)]
struct RoleRelationships {
    user: Relationship,
}

#[derive(Debug, Deserialize)]
struct Relationship {
    data: Guid,
}

#[derive(Debug, Deserialize)]
struct Guid {
    guid: String,
}

#[derive(Debug, Default, Deserialize)]
struct Included {
    #[serde(default)]
    users: Vec<IncludedUser>,
}

#[derive(Debug, Deserialize)]
struct IncludedUser {
    guid: String,
    #[serde(default)]
    username: Option<String>,
}

/// [`SessionInfo`] backed by the CLI's `config.json` and the roles API.
pub struct CfSession {
    runner: Arc<dyn CommandRunner>,
    config_path: Option<PathBuf>,
}

impl CfSession {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            runner,
            config_path: None,
        }
    }

    /// Read the session from `path` instead of the default location.
    pub fn with_config_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config_path = Some(path.into());
        self
    }

    fn resolve_config_path(&self) -> Result<PathBuf> {
        if let Some(ref path) = self.config_path {
            return Ok(path.clone());
        }
        let home = std::env::var_os("CF_HOME")
            .map(PathBuf::from)
            .or_else(dirs::home_dir)
            .ok_or_else(|| ToolsError::Config("cannot locate the cf CLI home directory".into()))?;
        Ok(home.join(".cf").join("config.json"))
    }

    async fn load(&self) -> Result<CliConfig> {
        let path = self.resolve_config_path()?;
        let raw = tokio::fs::read_to_string(&path).await?;
        serde_json::from_str(&raw)
            .map_err(|e| ToolsError::parse(format!("failed to parse {}", path.display()), e))
    }
}

#[async_trait]
impl SessionInfo for CfSession {
    async fn current_org(&self) -> Result<Target> {
        let org = self.load().await?.organization;
        if org.guid.is_empty() {
            return Err(ToolsError::Usage(
                "No org targeted, use 'cf target -o ORG' to target an org".into(),
            ));
        }
        Ok(org)
    }

    async fn current_space(&self) -> Result<Target> {
        let space = self.load().await?.space;
        if space.guid.is_empty() {
            return Err(ToolsError::Usage(
                "No space targeted, use 'cf target -s SPACE' to target a space".into(),
            ));
        }
        Ok(space)
    }

    async fn user_guid(&self) -> Result<String> {
        let token = self.load().await?.access_token;
        user_id_from_token(&token)
    }

    async fn space_users(&self, _org: &Target, space: &Target) -> Result<Vec<SpaceUser>> {
        let path = format!("/v3/roles?space_guids={}&include=user&per_page=5000", space.guid);
        let output = self
            .runner
            .run_quiet(&["curl", &path])
            .await
            .map_err(|e| ToolsError::command("failed to list space users", e))?;
        let page: RolesPage = parse_json(&output)?;
        Ok(collect_space_users(page))
    }
}

fn user_id_from_token(token: &str) -> Result<String> {
    let invalid = |message: &str| ToolsError::parse("failed to read the access token", message);

    let token = token
        .strip_prefix("bearer ")
        .or_else(|| token.strip_prefix("Bearer "))
        .unwrap_or(token);
    let payload = token
        .split('.')
        .nth(1)
        .ok_or_else(|| invalid("not logged in"))?;

    let decoded = base64::engine::general_purpose::URL_SAFE_NO_PAD
        .decode(payload.trim_end_matches('='))
        .map_err(|e| invalid(&e.to_string()))?;
    let claims: TokenClaims =
        serde_json::from_slice(&decoded).map_err(|e| invalid(&e.to_string()))?;
    Ok(claims.user_id)
}

fn collect_space_users(page: RolesPage) -> Vec<SpaceUser> {
    let mut users: BTreeMap<String, SpaceUser> = BTreeMap::new();

    for role in page.resources {
        let guid = role.relationships.user.data.guid;
        let user = users.entry(guid.clone()).or_insert_with(|| SpaceUser {
            guid,
            ..Default::default()
        });
        user.roles.push(role_name(&role.role_type));
    }

    for included in page.included.users {
        if let Some(user) = users.get_mut(&included.guid) {
            user.username = included.username.unwrap_or_default();
        }
    }

    debug!("Space has {} users with roles", users.len());
    users.into_values().collect()
}

fn role_name(role_type: &str) -> String {
    match role_type {
        "space_developer" => ROLE_SPACE_DEVELOPER.to_string(),
        "space_manager" => "RoleSpaceManager".to_string(),
        "space_auditor" => "RoleSpaceAuditor".to_string(),
        "space_supporter" => "RoleSpaceSupporter".to_string(),
        other => other.to_string(),
    }
}
