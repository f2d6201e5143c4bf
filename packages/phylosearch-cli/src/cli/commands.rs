use crate::cli::phylosearch_cli::{InputArgs, SearchArgs, SupportArgs};
use eyre::Report;
use log::info;
use phylosearch::alignment::msa::PartitionedMsa;
use phylosearch::alignment::validate::validate_msa;
use phylosearch::engine::{run_support, Command, Engine, OutputFiles, SearchOptions};
use phylosearch::kernel::pruning::PruningKernel;
use phylosearch::utils::float_fmt::format_loglh;

pub fn load_msa(input: &InputArgs) -> Result<PartitionedMsa, Report> {
  PartitionedMsa::read(&input.msa, &input.model, input.partitions.as_deref())
}

pub fn run_engine(args: &SearchArgs, command: Command, workers: usize) -> Result<(), Report> {
  let msa = load_msa(&args.input)?;
  let options = args.to_options(command, workers);
  info!("{options:#?}");

  let result = Engine::new(&msa, &options, &PruningKernel).run()?;

  if let Some(best) = result.best_ml_tree() {
    println!("Final logLikelihood: {}", format_loglh(best.loglh));
    for (partition, model) in msa.partitions.iter().zip(&best.models) {
      println!("Partition '{}': {model}", partition.name);
    }
  }
  if !result.bootstrap_trees.is_empty() {
    println!("Bootstrap trees: {}", result.bootstrap_trees.len());
  }
  Ok(())
}

pub fn run_support_command(args: &SupportArgs) -> Result<(), Report> {
  let options = SearchOptions {
    prefix: args.prefix.clone().unwrap_or_else(|| args.tree.clone()),
    ..SearchOptions::default()
  };
  let nwk = run_support(&args.tree, &args.bs_trees, &OutputFiles::new(&options), args.redo)?;
  println!("{nwk}");
  Ok(())
}

pub fn run_check(input: &InputArgs) -> Result<(), Report> {
  let msa = load_msa(input)?;
  validate_msa(&msa, input.force)?;
  for partition in &msa.partitions {
    println!(
      "Partition '{}': {} sites, {} patterns, model {}",
      partition.name,
      partition.msa.num_sites(),
      partition.msa.num_patterns(),
      partition.model
    );
  }
  println!("Alignment can be analyzed");
  Ok(())
}
