use crate::{
    cli::globals::GlobalArgs,
    store::{CleanupReport, OpenIdStore, PgStore},
};
use anyhow::{Context, Result};
use rand::{rngs::StdRng, Rng, SeedableRng};
use secrecy::ExposeSecret;
use sqlx::postgres::PgPoolOptions;
use tokio::time::{sleep, Duration};
use tracing::{error, info, instrument};

#[derive(Debug)]
pub struct Args {
    pub globals: GlobalArgs,
    /// Repeat the sweep roughly this often instead of exiting after one pass.
    pub interval: Option<Duration>,
    pub skew: i64,
}

/// Scale `interval` by a random factor in `0.7..0.9`, never below one second.
fn jittered<R: Rng>(rng: &mut R, interval: Duration) -> Duration {
    let secs = (interval.as_secs() as f64 * rng.gen_range(0.7..0.9)) as u64;
    Duration::from_secs(secs.max(1))
}

#[instrument(skip(store))]
async fn sweep(store: &dyn OpenIdStore) -> Result<CleanupReport> {
    let report = store.cleanup().await?;
    info!(
        nonces = report.nonces,
        associations = report.associations,
        "removed expired rows"
    );
    Ok(report)
}

/// Purge stale nonces and expired associations.
/// # Errors
/// Returns an error if the database is unreachable or a one-shot sweep fails.
pub async fn execute(args: Args) -> Result<()> {
    let pool = PgPoolOptions::new()
        .max_connections(2)
        .connect(args.globals.dsn.expose_secret())
        .await
        .context("Failed to connect to database")?;

    let store = PgStore::new(pool).with_skew_seconds(args.skew);

    let Some(interval) = args.interval else {
        sweep(&store).await?;
        return Ok(());
    };

    let mut rng = StdRng::from_entropy();

    loop {
        // A failed pass is retried on the next tick.
        if let Err(err) = sweep(&store).await {
            error!("cleanup failed: {err:#}");
        }

        let wait = jittered(&mut rng, interval);
        info!("next cleanup in {} seconds", wait.as_secs());

        tokio::select! {
            () = sleep(wait) => {}
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down cleanup loop");
                return Ok(());
            }
        }
    }
}
