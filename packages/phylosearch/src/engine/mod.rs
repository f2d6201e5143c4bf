pub mod options;
pub mod output;
pub mod resources;
pub mod run;
pub mod start_trees;
pub mod support;

pub use options::{Command, SearchOptions, StartTreeType};
pub use output::OutputFiles;
pub use run::{Engine, EngineResult, MlTreeResult, TreeResult};
pub use support::run_support;
