use crate::cli::actions::{cleanup, migrate, Action};
use anyhow::Result;

/// Single dispatch point for CLI actions.
/// # Errors
/// Returns an error if the action fails.
pub async fn execute(action: Action) -> Result<()> {
    match action {
        Action::Migrate(args) => migrate::execute(args).await,
        Action::Cleanup(args) => cleanup::execute(args).await,
    }
}
