pub mod fasta;
pub mod file;
pub mod fs;
pub mod json;
pub mod nwk;
pub mod partition_file;
