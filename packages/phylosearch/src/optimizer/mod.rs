pub mod observer;
pub mod optimizer;

pub use observer::{PhaseEvent, SearchObserver, TreeKind};
pub use optimizer::{Optimizer, OptimizerOptions};
