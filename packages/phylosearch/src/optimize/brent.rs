use argmin::core::{CostFunction, Error, Executor, State};
use argmin::solver::brent::BrentOpt;
use eyre::{eyre, Report};
use std::cell::RefCell;

const MAX_ITERATIONS: u64 = 100;

/// Adapts a fallible, stateful objective to argmin. The first error raised by the objective is stored outside of the
/// solver so that it can be returned unchanged after the solver stops.
struct CostFunctionWrapper<'e, F>
where
  F: FnMut(f64) -> Result<f64, Report>,
{
  problem: RefCell<F>,
  error: &'e RefCell<Option<Report>>,
}

impl<'e, F> CostFunctionWrapper<'e, F>
where
  F: FnMut(f64) -> Result<f64, Report>,
{
  pub const fn new(problem: F, error: &'e RefCell<Option<Report>>) -> Self {
    Self {
      problem: RefCell::new(problem),
      error,
    }
  }
}

impl<'e, F> CostFunction for CostFunctionWrapper<'e, F>
where
  F: FnMut(f64) -> Result<f64, Report>,
{
  type Param = f64;
  type Output = f64;

  fn cost(&self, x: &Self::Param) -> Result<Self::Output, Error> {
    let mut problem = self.problem.borrow_mut();
    match problem(*x) {
      Ok(cost) if cost.is_nan() => Ok(f64::INFINITY),
      Ok(cost) => Ok(cost),
      Err(report) => {
        let message = report.to_string();
        self.error.borrow_mut().get_or_insert(report);
        Err(Error::msg(message))
      }
    }
  }
}

/// Minimizes a scalar function on `bounds` with Brent's method. Returns the best parameter and its cost.
pub fn minimize_scalar_brent_bounded(
  problem: impl FnMut(f64) -> Result<f64, Report>,
  bounds: (f64, f64),
  tolerance: f64,
) -> Result<(f64, f64), Report> {
  let error = RefCell::new(None);
  let problem = CostFunctionWrapper::new(problem, &error);
  let solver = BrentOpt::new(bounds.0, bounds.1).set_tolerance(1e-8, tolerance);

  let result = Executor::new(problem, solver)
    .configure(|state| state.max_iters(MAX_ITERATIONS))
    .run()
    .map(|result| (result.state().get_best_param().copied(), result.state().get_best_cost()));

  if let Some(report) = error.take() {
    return Err(report);
  }

  let (param, cost) = result.map_err(|err| eyre!("{err}"))?;
  let param = param.ok_or_else(|| eyre!("Unable to get the best param"))?;
  Ok((param, cost))
}
