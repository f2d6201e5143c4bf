pub mod alignment;
pub mod bootstrap;
pub mod checkpoint;
pub mod constants;
pub mod engine;
pub mod io;
pub mod kernel;
pub mod load_balancer;
pub mod model;
pub mod optimize;
pub mod optimizer;
pub mod parallel;
pub mod tree;
pub mod treeinfo;
pub mod utils;
