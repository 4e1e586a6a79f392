use anyhow::{bail, Context};
use log::info;
use tokio::process::Command;

use crate::model::BranchDescriptor;

/// Applies pending schema migrations to a freshly created branch.
///
/// Runs at most once per session, in the creating process only.
#[async_trait::async_trait]
pub trait MigrationRunner: Send + Sync {
    async fn run(&self, branch: &BranchDescriptor) -> anyhow::Result<()>;
}

/// Runs an external command with the branch's connection string exported
#[derive(Debug, Clone)]
pub struct CommandMigration {
    program: String,
    args: Vec<String>,
    env_var: String,
}

impl CommandMigration {
    pub fn new(program: impl Into<String>, args: Vec<String>, env_var: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args,
            env_var: env_var.into(),
        }
    }

    /// Split a shell-style command line on whitespace
    pub fn parse(command: &str, env_var: &str) -> anyhow::Result<Self> {
        let mut parts = command.split_whitespace().map(str::to_string);
        let program = parts.next().context("empty migration command")?;
        Ok(Self::new(program, parts.collect(), env_var))
    }
}

#[async_trait::async_trait]
impl MigrationRunner for CommandMigration {
    async fn run(&self, branch: &BranchDescriptor) -> anyhow::Result<()> {
        info!("Running migrations: {} {}", self.program, self.args.join(" "));
        let status = Command::new(&self.program)
            .args(&self.args)
            .env(&self.env_var, &branch.connection_uri)
            .status()
            .await
            .with_context(|| format!("failed to start {}", self.program))?;

        if !status.success() {
            bail!("{} exited with {}", self.program, status);
        }
        Ok(())
    }
}
