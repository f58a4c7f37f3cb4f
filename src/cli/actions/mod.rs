pub mod cleanup;
pub mod migrate;

mod run;

#[derive(Debug)]
pub enum Action {
    Migrate(migrate::Args),
    Cleanup(cleanup::Args),
}

impl Action {
    /// Execute the action.
    /// # Errors
    /// Returns an error if the action fails.
    pub async fn execute(self) -> anyhow::Result<()> {
        run::execute(self).await
    }
}
