pub mod model;
pub mod parse;
pub mod presets;
pub mod rate_matrix;
pub mod rates;
