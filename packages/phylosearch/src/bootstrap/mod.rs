pub mod generator;
pub mod support;

pub use generator::{BootstrapGenerator, BootstrapReplicate};
pub use support::SupportTree;
