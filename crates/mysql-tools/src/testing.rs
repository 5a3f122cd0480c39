//! Recording fakes shared by the unit tests.

use std::sync::Mutex;

use async_trait::async_trait;

use crate::cf::CommandRunner;
use crate::error::{Result, ToolsError};

type Handler = Box<dyn Fn(&[String]) -> Result<Vec<String>> + Send + Sync>;

/// A recorded command invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Call {
    pub quiet: bool,
    pub args: Vec<String>,
}

/// [`CommandRunner`] that records every call and answers from a closure.
pub(crate) struct FakeRunner {
    calls: Mutex<Vec<Call>>,
    handler: Handler,
}

impl FakeRunner {
    pub fn new(handler: impl Fn(&[String]) -> Result<Vec<String>> + Send + Sync + 'static) -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            handler: Box::new(handler),
        }
    }

    /// Runner that succeeds with empty output for every command.
    pub fn ok() -> Self {
        Self::new(|_| Ok(Vec::new()))
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    /// Argument lists of calls whose first argument is `subcommand`.
    pub fn calls_to(&self, subcommand: &str) -> Vec<Vec<String>> {
        self.calls()
            .into_iter()
            .filter(|c| c.args.first().map(String::as_str) == Some(subcommand))
            .map(|c| c.args)
            .collect()
    }

    fn record(&self, quiet: bool, args: &[&str]) -> Result<Vec<String>> {
        let args: Vec<String> = args.iter().map(|a| a.to_string()).collect();
        self.calls.lock().unwrap().push(Call {
            quiet,
            args: args.clone(),
        });
        (self.handler)(&args)
    }
}

#[async_trait]
impl CommandRunner for FakeRunner {
    async fn run(&self, args: &[&str]) -> Result<Vec<String>> {
        self.record(false, args)
    }

    async fn run_quiet(&self, args: &[&str]) -> Result<Vec<String>> {
        self.record(true, args)
    }
}

/// Command failure as the real runner would report it.
pub(crate) fn command_failure(message: &str) -> ToolsError {
    ToolsError::command("cf exited with exit status: 1", message)
}

pub(crate) fn lines(raw: &str) -> Vec<String> {
    raw.lines().map(str::to_string).collect()
}
