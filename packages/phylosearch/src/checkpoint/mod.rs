pub mod manager;
pub mod state;

pub use manager::{check_resumable, CheckpointManager};
pub use state::{Checkpoint, MlTreeEntry, SearchState, SearchStep, SprMode, SprState, TreeEntry};
