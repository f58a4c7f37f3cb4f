pub mod logging;

use clap::{
    builder::styling::{AnsiColor, Effects, Styles},
    Arg, ColorChoice, Command,
};

pub const ARG_DSN: &str = "dsn";
pub const ARG_INTERVAL: &str = "interval";
pub const ARG_SKEW: &str = "skew";

fn dsn_arg() -> Arg {
    Arg::new(ARG_DSN)
        .short('d')
        .long("dsn")
        .help("Database connection string")
        .env("OPENID_RP_DSN")
        .required(true)
}

#[must_use]
pub fn new() -> Command {
    let styles = Styles::styled()
        .header(AnsiColor::Yellow.on_default() | Effects::BOLD)
        .usage(AnsiColor::Green.on_default() | Effects::BOLD)
        .literal(AnsiColor::Blue.on_default() | Effects::BOLD)
        .placeholder(AnsiColor::Green.on_default());

    let long_version: &'static str = Box::leak(
        format!("{} - {}", env!("CARGO_PKG_VERSION"), crate::GIT_COMMIT_HASH).into_boxed_str(),
    );

    let command = Command::new("openid-rp")
        .about("OpenID 2.0 relying party maintenance")
        .version(env!("CARGO_PKG_VERSION"))
        .long_version(long_version)
        .color(ColorChoice::Auto)
        .styles(styles)
        .subcommand_required(true)
        .arg_required_else_help(true)
        .subcommand(
            Command::new("migrate")
                .about("Create the association, nonce and identity tables")
                .arg(dsn_arg()),
        )
        .subcommand(
            Command::new("cleanup")
                .about("Purge expired associations and stale nonces")
                .arg(dsn_arg())
                .arg(
                    Arg::new(ARG_INTERVAL)
                        .short('i')
                        .long("interval")
                        .help("Keep running and sweep roughly every N seconds")
                        .env("OPENID_RP_CLEANUP_INTERVAL")
                        .value_parser(clap::value_parser!(u64).range(1..)),
                )
                .arg(
                    Arg::new(ARG_SKEW)
                        .long("skew")
                        .help("Nonce clock-skew window in seconds")
                        .env("OPENID_RP_NONCE_SKEW")
                        .default_value("300")
                        .value_parser(clap::value_parser!(i64).range(0..)),
                ),
        );

    logging::with_args(command)
}
