//! # mysql-tools
//!
//! Data migration and tunnelling for MySQL service instances on Cloud Foundry.
//!
//! - **Migration** pushes a worker app bound to a donor and a recipient
//!   instance, runs the copy as a task and always removes the app again
//! - **Rename** hands the donor's name over to the recipient
//! - **Tunnels** forward local ports to instance databases over the
//!   platform's SSH proxy
//!
//! Every platform interaction goes through the `cf` CLI via
//! [`CommandRunner`], so the workflows can be exercised against fakes.
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use mysql_tools::{AssetUnpacker, CfCli, CfClient, Config, Migrator};
//!
//! #[tokio::main]
//! async fn main() -> mysql_tools::Result<()> {
//!     let config = Config::load("mysql-tools.yaml")?;
//!     let runner = Arc::new(CfCli::new(&config.cf));
//!     let client = Arc::new(CfClient::new(runner, &config));
//!     let unpacker = Arc::new(AssetUnpacker::new(&config.migration.assets_dir));
//!
//!     let mut migrator = Migrator::new(client, unpacker, config.migration.clone());
//!     migrator.migrate_data("donor-db", "recipient-db").await
//! }
//! ```

pub mod cf;
pub mod config;
pub mod error;
pub mod migrate;
pub mod service;
pub mod tunnel;
pub mod unpack;
pub mod user;

#[cfg(test)]
pub(crate) mod testing;

// Re-exports for convenient access
pub use cf::{App, CfCli, CfClient, CommandRunner, PlatformClient, Task, TaskState};
pub use config::{ApiConfig, CfConfig, Config, MigrationConfig, TunnelConfig};
pub use error::{Result, ToolsError};
pub use migrate::{MigrationState, Migrator};
pub use service::{ServiceInfo, ServiceInstance};
pub use tunnel::{CfSshConnector, MysqlProbe, TunnelManager};
pub use unpack::{AssetUnpacker, Unpacker};
pub use user::{CfSession, Reporter, SessionInfo, ROLE_SPACE_DEVELOPER};
