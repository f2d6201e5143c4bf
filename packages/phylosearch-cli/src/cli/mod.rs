pub mod commands;
pub mod phylosearch_cli;
pub mod verbosity;
pub mod workers;
