use crate::cli::{
    actions::{cleanup, migrate, Action},
    commands::{ARG_DSN, ARG_INTERVAL, ARG_SKEW},
    globals::GlobalArgs,
};
use crate::store::DEFAULT_SKEW_SECONDS;
use anyhow::{anyhow, Context, Result};
use secrecy::SecretString;
use std::time::Duration;

/// # Errors
/// Returns an error if required arguments are missing.
pub fn handler(matches: &clap::ArgMatches) -> Result<Action> {
    let (name, sub) = matches
        .subcommand()
        .ok_or_else(|| anyhow!("missing subcommand"))?;

    let dsn = sub
        .get_one::<String>(ARG_DSN)
        .cloned()
        .context("missing required argument: --dsn")?;
    let globals = GlobalArgs::new(SecretString::from(dsn));

    match name {
        "migrate" => Ok(Action::Migrate(migrate::Args { globals })),
        "cleanup" => Ok(Action::Cleanup(cleanup::Args {
            globals,
            interval: sub
                .get_one::<u64>(ARG_INTERVAL)
                .copied()
                .map(Duration::from_secs),
            skew: sub
                .get_one::<i64>(ARG_SKEW)
                .copied()
                .unwrap_or(DEFAULT_SKEW_SECONDS),
        })),
        other => Err(anyhow!("unknown subcommand: {other}")),
    }
}
