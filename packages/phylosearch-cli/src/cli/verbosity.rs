use clap::builder::{PossibleValuesParser, TypedValueParser};
use clap::{ArgAction, Args};
use log::LevelFilter;

/// Log levels from quietest to loudest
const LEVELS: [LevelFilter; 6] = [
  LevelFilter::Off,
  LevelFilter::Error,
  LevelFilter::Warn,
  LevelFilter::Info,
  LevelFilter::Debug,
  LevelFilter::Trace,
];

#[derive(Args, Debug, Clone)]
pub struct Verbosity {
  /// Verbosity level of console output
  #[clap(long, global = true, value_parser = PossibleValuesParser::new(["off", "error", "warn", "info", "debug", "trace"])
      .map(|s| s.parse::<LevelFilter>().unwrap_or(LevelFilter::Info)))]
  #[clap(conflicts_with_all = ["quiet", "verbose", "silent"])]
  #[clap(default_value = "info")]
  #[clap(display_order = 95)]
  pub verbosity: LevelFilter,

  /// Disable all console output. Same as `--verbosity=off`
  #[clap(long, global = true)]
  #[clap(conflicts_with_all = ["quiet", "verbose", "verbosity"])]
  #[clap(display_order = 96)]
  pub silent: bool,

  /// More verbose console output. Repeat to increase further.
  #[clap(long, short = 'v', action = ArgAction::Count, global = true)]
  #[clap(conflicts_with_all = ["quiet", "verbosity", "silent"])]
  #[clap(display_order = 97)]
  pub verbose: u8,

  /// Quieter console output. Repeat to decrease further.
  #[clap(long, short = 'q', action = ArgAction::Count, global = true)]
  #[clap(conflicts_with_all = ["verbose", "verbosity"])]
  #[clap(display_order = 98)]
  pub quiet: u8,
}

impl Verbosity {
  /// `--silent` wins over everything, otherwise `-v` and `-q` shift the base level
  pub fn filter_level(&self) -> LevelFilter {
    if self.silent {
      return LevelFilter::Off;
    }
    let base = LEVELS.iter().position(|&level| level == self.verbosity).unwrap_or(3);
    let shifted = (base + usize::from(self.verbose)).saturating_sub(usize::from(self.quiet));
    LEVELS[shifted.min(LEVELS.len() - 1)]
  }
}
