use crate::{cli::globals::GlobalArgs, store::PgStore};
use anyhow::{Context, Result};
use secrecy::ExposeSecret;
use sqlx::postgres::PgPoolOptions;
use tracing::info;

#[derive(Debug)]
pub struct Args {
    pub globals: GlobalArgs,
}

/// Create the association, nonce and identity tables.
/// # Errors
/// Returns an error if the database is unreachable or the schema fails to apply.
pub async fn execute(args: Args) -> Result<()> {
    let pool = PgPoolOptions::new()
        .max_connections(2)
        .connect(args.globals.dsn.expose_secret())
        .await
        .context("Failed to connect to database")?;

    PgStore::new(pool).migrate().await?;

    info!("schema is up to date");

    Ok(())
}
