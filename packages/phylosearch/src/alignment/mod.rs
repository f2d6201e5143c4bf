pub mod msa;
pub mod state;
pub mod validate;
