use eyre::Report;
use std::fmt::{Display, Formatter};

pub fn report_to_string(report: &Report) -> String {
  let strings: Vec<String> = report.chain().map(std::string::ToString::to_string).collect();
  strings.join(": ")
}

/// Failure signalled by the likelihood kernel or detected in its results (NaN/infinite likelihood, a
/// likelihood decrease during optimization, invalid partition construction).
///
/// Such failures leave kernel state untrustworthy, so they are never retried.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NumericalError {
  pub stage: String,
  pub message: String,
}

impl NumericalError {
  pub fn new(stage: impl AsRef<str>, message: impl AsRef<str>) -> Self {
    Self {
      stage: stage.as_ref().to_owned(),
      message: message.as_ref().to_owned(),
    }
  }
}

impl Display for NumericalError {
  fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
    write!(f, "Numerical error in {}: {}", self.stage, self.message)
  }
}

impl std::error::Error for NumericalError {}

/// Whether a report (or anything in its cause chain) originates from a `NumericalError`
pub fn is_numerical_error(report: &Report) -> bool {
  report.chain().any(|cause| cause.downcast_ref::<NumericalError>().is_some())
}

#[macro_export(local_inner_macros)]
macro_rules! make_error {
  ($($arg:tt)*) => {
    {
      Err(eyre::eyre!(std::format!($($arg)*)))
    }
  };
}

pub use make_error;

#[macro_export(local_inner_macros)]
macro_rules! make_report {
  ($($arg:tt)*) => {
    {
      eyre::eyre!($($arg)*)
    }
  };
}

pub use make_report;

#[macro_export(local_inner_macros)]
macro_rules! make_internal_error {
  ($($arg:tt)*) => {
    {
      let msg_external = std::format!($($arg)*);
      let msg = std::format!("{msg_external}. This is an internal error. Please report it to developers.");
      Err(eyre::eyre!(msg))
    }
  };
}

pub use make_internal_error;

#[macro_export(local_inner_macros)]
macro_rules! make_internal_report {
  ($($arg:tt)*) => {
    {
      let msg_external = std::format!($($arg)*);
      let msg = std::format!("{msg_external}. This is an internal error. Please report it to developers.");
      eyre::eyre!(msg)
    }
  };
}

pub use make_internal_report;

/// Creates `Err(Report)` wrapping a `NumericalError` for the given stage
#[macro_export(local_inner_macros)]
macro_rules! make_numerical_error {
  ($stage:expr, $($arg:tt)*) => {
    {
      Err(eyre::Report::new($crate::utils::error::NumericalError::new($stage, std::format!($($arg)*))))
    }
  };
}

pub use make_numerical_error;
