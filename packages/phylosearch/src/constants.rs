//! Numeric domains of the optimized parameters

pub const MIN_BRLEN: f64 = 1e-6;
pub const MAX_BRLEN: f64 = 100.0;
pub const DEFAULT_BRLEN: f64 = 0.1;

/// Maximum number of branch-length smoothing passes, multiplied by the smoothing factor
pub const BRLEN_SMOOTHINGS: usize = 32;

pub const MIN_ALPHA: f64 = 0.02;
pub const MAX_ALPHA: f64 = 100.0;
pub const DEFAULT_ALPHA: f64 = 1.0;

pub const MIN_PINV: f64 = 0.0;
pub const MAX_PINV: f64 = 0.99;

pub const MIN_SUBST_RATE: f64 = 1e-3;
pub const MAX_SUBST_RATE: f64 = 1e6;

/// Bounds of the unnormalized frequency weights; frequencies are weights divided by their sum
pub const MIN_FREQ_WEIGHT: f64 = 1e-3;
pub const MAX_FREQ_WEIGHT: f64 = 1e3;

pub const MIN_FREE_RATE: f64 = 1e-3;
pub const MAX_FREE_RATE: f64 = 100.0;
pub const MIN_RATE_WEIGHT: f64 = 1e-3;
pub const MAX_RATE_WEIGHT: f64 = 1e3;

pub const MIN_BRLEN_SCALER: f64 = 0.01;
pub const MAX_BRLEN_SCALER: f64 = 100.0;

/// Convergence threshold of the one-dimensional parameter optimizations
pub const PARAM_EPSILON: f64 = 1e-3;

/// Tolerance used when checking that an optimization step did not decrease the likelihood
pub const LH_DECREASE_TOLERANCE: f64 = 1e-6;

/// Likelihood scaling threshold and factor (2^-256 and 2^256)
pub const SCALE_THRESHOLD: f64 = 8.636_168_555_094_445e-78;
pub const SCALE_FACTOR: f64 = 1.157_920_892_373_162e77;
pub const LOG_SCALE_FACTOR: f64 = 177.445_678_223_345_98;
