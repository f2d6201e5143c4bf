use clap::Args;

#[derive(Args, Debug, Clone)]
pub struct Workers {
  /// Number of workers sharing the likelihood computation of every tree. Defaults to the number of CPU threads.
  #[clap(global = true, display_order = 90, long = "workers", short = 'j', default_value_t = num_cpus::get())]
  pub workers: usize,
}
