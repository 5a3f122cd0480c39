//! Platform access: CLI command execution, JSON API types and the
//! application/task lifecycle client.

mod api;
mod client;
mod runner;

pub use api::{ApiError, App, Task, TaskState};
pub(crate) use api::parse_json;
pub(crate) use client::find_app_by_name;
pub use client::{CfClient, PlatformClient};
pub use runner::{CfCli, CommandRunner};
