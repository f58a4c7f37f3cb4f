//! The global `--verbose` flag and the tracing level it selects.

use clap::{builder::ValueParser, Arg, ArgAction, ArgMatches, Command};
use tracing::Level;

pub const ARG_VERBOSITY: &str = "verbosity";

/// Level names accepted from `OPENID_RP_LOG_LEVEL`, quietest first. The
/// position of a name is the `-v` count it stands for.
const LEVELS: [Level; 5] = [
    Level::ERROR,
    Level::WARN,
    Level::INFO,
    Level::DEBUG,
    Level::TRACE,
];

fn parse_verbosity(value: &str) -> Result<u8, String> {
    let by_name = LEVELS
        .iter()
        .position(|level| level.as_str().eq_ignore_ascii_case(value.trim()));
    let index = match by_name {
        Some(index) => index,
        None => value
            .trim()
            .parse::<usize>()
            .ok()
            .filter(|count| *count < LEVELS.len())
            .ok_or_else(|| format!("invalid log level {value:?}, use 0-4 or error..trace"))?,
    };
    u8::try_from(index).map_err(|err| err.to_string())
}

#[must_use]
pub fn with_args(command: Command) -> Command {
    command.arg(
        Arg::new(ARG_VERBOSITY)
            .short('v')
            .long("verbose")
            .help("Verbosity level: ERROR, WARN, INFO, DEBUG, TRACE (default: ERROR)")
            .env("OPENID_RP_LOG_LEVEL")
            .global(true)
            .action(ArgAction::Count)
            .value_parser(ValueParser::new(parse_verbosity)),
    )
}

/// Tracing level for the parsed command line. Repeated `-v` beyond TRACE
/// stays at TRACE.
#[must_use]
pub fn level(matches: &ArgMatches) -> Level {
    let count = matches.get_one::<u8>(ARG_VERBOSITY).copied().unwrap_or(0);
    LEVELS
        .get(usize::from(count))
        .copied()
        .unwrap_or(Level::TRACE)
}
