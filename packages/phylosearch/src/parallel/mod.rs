pub mod barrier;
pub mod context;

pub use context::{is_remote_failure, remote_failure, Coordinator, ParallelContext, RemoteFailure, WorkerContext};
