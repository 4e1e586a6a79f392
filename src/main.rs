use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{bail, Context};
use neon_test_branches::{BranchConfig, BranchSession, CommandMigration, MigrationRunner};
use tokio::process::Command;

const USAGE: &str = "usage: neon-test-branches [--migrate <command>] -- <test command...>";

struct Invocation {
    migrate: Option<String>,
    command: Vec<String>,
}

fn parse_args(args: impl IntoIterator<Item = String>) -> anyhow::Result<Invocation> {
    let mut args = args.into_iter();
    let mut migrate = None;

    loop {
        match args.next().as_deref() {
            Some("--migrate") => {
                migrate = Some(args.next().context("--migrate needs a command")?);
            }
            Some("--") => break,
            Some("-h") | Some("--help") => bail!(USAGE),
            Some(other) => bail!("unexpected argument '{}'\n{}", other, USAGE),
            None => bail!(USAGE),
        }
    }

    let command: Vec<String> = args.collect();
    if command.is_empty() {
        bail!("missing test command\n{}", USAGE);
    }
    Ok(Invocation { migrate, command })
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    // Load environment variables from .env file if it exists
    dotenvy::dotenv().ok();

    use env_logger::Builder;
    use log::LevelFilter;

    Builder::new()
        .filter_level(LevelFilter::Info)
        .filter_module("sqlx", LevelFilter::Warn)
        .parse_default_env()
        .init();

    let invocation = parse_args(std::env::args().skip(1))?;
    let config = BranchConfig::load()?;

    let hook = match &invocation.migrate {
        Some(command) => Some(Arc::new(CommandMigration::parse(command, &config.env_var)?)
            as Arc<dyn MigrationRunner>),
        None => None,
    };

    let env_var = config.env_var.clone();
    let session = BranchSession::from_config(config, hook).await?;
    let connection_uri = session.branch().connection_uri.clone();

    let status = Command::new(&invocation.command[0])
        .args(&invocation.command[1..])
        .env(&env_var, &connection_uri)
        .status()
        .await
        .with_context(|| format!("failed to start {}", invocation.command[0]));

    session.finish().await;

    let status = status?;
    log::info!("Test command exited with {}", status);
    Ok(match status.code() {
        Some(code) => ExitCode::from(u8::try_from(code).unwrap_or(1)),
        None => ExitCode::FAILURE,
    })
}
