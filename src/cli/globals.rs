use secrecy::SecretString;

/// Settings shared by every subcommand.
#[derive(Clone)]
pub struct GlobalArgs {
    pub dsn: SecretString,
}

impl GlobalArgs {
    #[must_use]
    pub fn new(dsn: SecretString) -> Self {
        Self { dsn }
    }
}

impl std::fmt::Debug for GlobalArgs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GlobalArgs").field("dsn", &"***").finish()
    }
}
