pub mod parsimony;
pub mod random;
pub mod tree;
