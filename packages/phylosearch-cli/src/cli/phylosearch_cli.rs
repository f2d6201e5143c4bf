#![allow(clippy::struct_excessive_bools)]

use crate::cli::verbosity::Verbosity;
use crate::cli::workers::Workers;
use clap::{Args, Parser, Subcommand, ValueEnum, ValueHint};
use eyre::Report;
use phylosearch::engine::{Command, SearchOptions, StartTreeType};
use phylosearch::treeinfo::BrlenLinkage;
use phylosearch::utils::global_init::setup_logger;
use std::fmt::Debug;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[clap(name = "phylosearch")]
#[clap(author, version)]
#[clap(verbatim_doc_comment)]
/// Maximum-likelihood phylogenetic tree search, distributed over workers and resumable from checkpoints
pub struct PhylosearchArgs {
  #[clap(subcommand)]
  pub command: PhylosearchCommands,

  #[clap(flatten)]
  pub workers: Workers,

  #[clap(flatten)]
  pub verbosity: Verbosity,
}

#[derive(Subcommand, Debug)]
pub enum PhylosearchCommands {
  /// Searches for the maximum-likelihood tree, starting from random trees or from the trees of a file
  Search(SearchArgs),

  /// Optimizes model parameters and branch lengths of the given trees, without changing their topology
  Evaluate(SearchArgs),

  /// Infers trees of bootstrap replicates of the alignment
  Bootstrap(SearchArgs),

  /// Tree search, bootstrap replicates and support values of the best tree, in one run
  All(SearchArgs),

  /// Maps support values from a set of bootstrap trees onto a reference tree
  Support(SupportArgs),

  /// Checks that the alignment and the models can be loaded and are suitable for analysis
  Check(InputArgs),
}

impl PhylosearchCommands {
  pub const fn engine_command(&self) -> Option<Command> {
    match self {
      Self::Search(_) => Some(Command::Search),
      Self::Evaluate(_) => Some(Command::Evaluate),
      Self::Bootstrap(_) => Some(Command::Bootstrap),
      Self::All(_) => Some(Command::All),
      Self::Support(_) | Self::Check(_) => None,
    }
  }
}

#[derive(Args, Debug, Clone)]
pub struct InputArgs {
  /// Path to the FASTA file with the aligned sequences
  #[clap(long, short = 's')]
  #[clap(value_hint = ValueHint::FilePath)]
  pub msa: PathBuf,

  /// Model of an unpartitioned alignment, e.g. `GTR+G`, `HKY+I+G4`, `JC`, `BIN+ASC_LEWIS`
  #[clap(long, short = 'm', default_value = "GTR+G")]
  pub model: String,

  /// Partition file with lines like `DNA, gene1 = 1-300` or `HKY+G, codon3 = 3-900/3`. Overrides `--model`.
  #[clap(long, short = 'p')]
  #[clap(value_hint = ValueHint::FilePath)]
  pub partitions: Option<PathBuf>,

  /// Turn failed alignment and resource checks into warnings
  #[clap(long)]
  pub force: bool,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum BrlenLinkageArg {
  /// Same branch lengths in all partitions
  #[default]
  Linked,
  /// Shared branch lengths, multiplied by a scaler per partition
  Scaled,
}

impl From<BrlenLinkageArg> for BrlenLinkage {
  fn from(arg: BrlenLinkageArg) -> Self {
    match arg {
      BrlenLinkageArg::Linked => Self::Linked,
      BrlenLinkageArg::Scaled => Self::Scaled,
    }
  }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum StartTreeArg {
  #[default]
  Random,
  /// Stepwise-addition parsimony trees
  Parsimony,
}

impl From<StartTreeArg> for StartTreeType {
  fn from(arg: StartTreeArg) -> Self {
    match arg {
      StartTreeArg::Random => Self::Random,
      StartTreeArg::Parsimony => Self::Parsimony,
    }
  }
}

#[derive(Args, Debug, Clone)]
pub struct SearchArgs {
  #[clap(flatten)]
  pub input: InputArgs,

  /// Newick file with starting trees, or with the trees to evaluate
  #[clap(long, short = 't')]
  #[clap(value_hint = ValueHint::FilePath)]
  pub tree: Option<PathBuf>,

  /// Prefix of the output files and of the checkpoint. Defaults to the alignment path.
  #[clap(long, short = 'o')]
  #[clap(value_hint = ValueHint::AnyPath)]
  pub prefix: Option<PathBuf>,

  /// Number of starting trees, when no tree file is given
  #[clap(long, default_value_t = 1)]
  pub searches: usize,

  /// Kind of generated starting trees
  #[clap(long, value_enum, default_value_t = StartTreeArg::default())]
  pub start_tree: StartTreeArg,

  /// Number of bootstrap replicates
  #[clap(long, default_value_t = 100)]
  pub bs_trees: usize,

  /// Seed of the random number generator. A resumed run must use the seed of the original run.
  #[clap(long, default_value_t = 1)]
  pub seed: u64,

  /// Ignore the checkpoint and overwrite the results of a previous run with the same prefix
  #[clap(long)]
  pub redo: bool,

  #[clap(long, value_enum, default_value_t = BrlenLinkageArg::default())]
  pub brlen: BrlenLinkageArg,

  /// Log-likelihood improvement below which optimization is considered converged
  #[clap(long, default_value_t = 0.1)]
  pub lh_epsilon: f64,

  /// Radius of fast SPR rounds. 0 detects it automatically.
  #[clap(long, default_value_t = 0)]
  pub spr_radius: usize,

  /// Regraft positions losing more than this multiple of the average loss are not explored further. 0 disables.
  #[clap(long, default_value_t = 1.0)]
  pub spr_cutoff: f64,

  /// Keep the model parameters fixed
  #[clap(long)]
  pub no_opt_model: bool,

  /// Keep the branch lengths fixed
  #[clap(long)]
  pub no_opt_brlen: bool,

  /// Maximum number of optimization cycles per tree
  #[clap(long, default_value_t = 64)]
  pub max_cycles: usize,
}

impl SearchArgs {
  pub fn to_options(&self, command: Command, workers: usize) -> SearchOptions {
    SearchOptions {
      command,
      num_searches: self.searches,
      start_tree: self.start_tree.into(),
      num_bootstraps: self.bs_trees,
      workers,
      seed: self.seed,
      tree_file: self.tree.clone(),
      prefix: self.prefix.clone().unwrap_or_else(|| self.input.msa.clone()),
      redo: self.redo,
      force: self.input.force,
      linkage: self.brlen.into(),
      lh_epsilon: self.lh_epsilon,
      spr_radius: self.spr_radius,
      spr_cutoff: self.spr_cutoff,
      optimize_model: !self.no_opt_model,
      optimize_brlen: !self.no_opt_brlen,
      max_cycles: self.max_cycles,
    }
  }
}

#[derive(Args, Debug, Clone)]
pub struct SupportArgs {
  /// Newick file with the reference tree
  #[clap(long, short = 't')]
  #[clap(value_hint = ValueHint::FilePath)]
  pub tree: PathBuf,

  /// Newick file with the bootstrap trees
  #[clap(long, short = 'b')]
  #[clap(value_hint = ValueHint::FilePath)]
  pub bs_trees: PathBuf,

  /// Prefix of the output file. Defaults to the reference tree path.
  #[clap(long, short = 'o')]
  #[clap(value_hint = ValueHint::AnyPath)]
  pub prefix: Option<PathBuf>,

  /// Overwrite the result of a previous run with the same prefix
  #[clap(long)]
  pub redo: bool,
}

pub fn phylosearch_parse_cli_args() -> Result<PhylosearchArgs, Report> {
  let args = PhylosearchArgs::parse();
  setup_logger(args.verbosity.filter_level());
  Ok(args)
}
