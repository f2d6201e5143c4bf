use ctor::ctor;
use eyre::Report;
use phylosearch::utils::global_init::global_init;
use phylosearch_cli::cli::commands::{run_check, run_engine, run_support_command};
use phylosearch_cli::cli::phylosearch_cli::{phylosearch_parse_cli_args, PhylosearchCommands};

#[ctor]
fn init() {
  global_init();
}

fn main() -> Result<(), Report> {
  let args = phylosearch_parse_cli_args()?;
  let workers = args.workers.workers;

  match &args.command {
    PhylosearchCommands::Search(search_args)
    | PhylosearchCommands::Evaluate(search_args)
    | PhylosearchCommands::Bootstrap(search_args)
    | PhylosearchCommands::All(search_args) => {
      if let Some(command) = args.command.engine_command() {
        run_engine(search_args, command, workers)?;
      }
    }
    PhylosearchCommands::Support(support_args) => run_support_command(support_args)?,
    PhylosearchCommands::Check(input_args) => run_check(input_args)?,
  }

  Ok(())
}
