//! Switching from a Hopf point of an equilibrium branch onto the branch of
//! periodic orbits it emits.

use anyhow::{bail, Context, Result};
use log::info;
use nalgebra::DVector;
use std::sync::Arc;

use super::floquet::FloquetLinearSolver;
use super::normal_form::{hopf_normal_form, AdjointFn, HopfPredictor, JacobianFn};
use super::periodic::{
    continue_periodic_orbit, LinearizationMode, OrbitGuess, PeriodicOrbitKind, PeriodicOrbitProblem,
};
use super::problem::ContinuationProblem;
use super::results::Branch;
use super::stepper::ContinuationOptions;
use super::types::{ContinuationPar, Tangent};
use crate::error::ContinuationError;
use crate::linalg::{DenseLinearSolver, LinearSolver};
use crate::newton::{newton, DeflationOperator, Deflated, NewtonPar, NewtonSystem};
use crate::traits::HigherDerivatives;

/// Options of [`continue_from_hopf`].
pub struct HopfSwitchOptions<P> {
    /// Jacobian of the field; dual numbers when absent.
    pub jacobian: Option<JacobianFn<P>>,
    /// Adjoint action, required when `jacobian` is matrix-free.
    pub adjoint: Option<AdjointFn<P>>,
    /// Finite-difference step for parameter derivatives. Default: 1e-8.
    pub delta: f64,
    /// Parameter step of the predictor; `settings.ds` when absent.
    pub ds: Option<f64>,
    /// Default: 1.
    pub amplitude_factor: f64,
    /// Correct the orbit guess with the collapsed orbit deflated, so that
    /// Newton cannot fall back onto the equilibrium. Default: false.
    pub use_deflation: bool,
    /// Overrides `settings.nev` on the new branch.
    pub nev: Option<usize>,
    /// Default: 0.
    pub update_section_every_step: usize,
    /// Default: [`LinearizationMode::AdDense`].
    pub linearization: LinearizationMode,
    pub continuation: ContinuationOptions<P>,
}

impl<P> Default for HopfSwitchOptions<P> {
    fn default() -> Self {
        Self {
            jacobian: None,
            adjoint: None,
            delta: 1e-8,
            ds: None,
            amplitude_factor: 1.0,
            use_deflation: false,
            nev: None,
            update_section_every_step: 0,
            linearization: LinearizationMode::default(),
            continuation: ContinuationOptions::default(),
        }
    }
}

/// Samples the predictor at `m` equally spaced times over its period.
pub fn orbit_guess(predictor: &HopfPredictor, m: usize) -> OrbitGuess {
    let phase = predictor.phase();
    OrbitGuess::sample(
        |t| predictor.orbit(predictor.omega * t - phase),
        predictor.period,
        m,
    )
}

/// Newton on the orbit functional at a frozen parameter.
struct FrozenOrbit<'a, S: HigherDerivatives> {
    problem: &'a mut PeriodicOrbitProblem<S>,
    linear: FloquetLinearSolver<DenseLinearSolver>,
    p: f64,
}

impl<'a, S> NewtonSystem for FrozenOrbit<'a, S>
where
    S: HigherDerivatives + 'static,
    S::Params: 'static,
{
    fn dimension(&self) -> usize {
        self.problem.dimension()
    }

    fn residual(&mut self, x: &DVector<f64>) -> Result<DVector<f64>> {
        self.problem.residual(x, self.p)
    }

    fn newton_direction(&mut self, x: &DVector<f64>, residual: &DVector<f64>) -> Result<(DVector<f64>, usize)> {
        let jac = self.problem.jacobian(x, self.p)?;
        self.linear.solve(&jac, residual)
    }
}

/// Continues the periodic orbits born at Hopf point `index` of `branch`.
///
/// The normal form at the Hopf point gives an orbit guess at the predicted
/// parameter; it seeds a `kind` periodic-orbit problem which is then
/// continued with `settings`. The returned branch points back at the Hopf
/// point.
pub fn continue_from_hopf<S>(
    field: Arc<S>,
    branch: &Branch<S::Params>,
    index: usize,
    settings: &ContinuationPar,
    kind: PeriodicOrbitKind,
    options: HopfSwitchOptions<S::Params>,
) -> Result<(Branch<S::Params>, DVector<f64>, Tangent)>
where
    S: HigherDerivatives + 'static,
    S::Params: 'static,
{
    let point = branch
        .bifurcations
        .get(index)
        .ok_or(ContinuationError::OutOfRange {
            index,
            len: branch.bifurcations.len(),
        })?;
    let lens = branch.lens;

    let normal_form = hopf_normal_form(
        field.as_ref(),
        &branch.params,
        lens,
        point,
        options.jacobian.as_ref(),
        options.adjoint.as_ref(),
        options.delta,
    )
    .with_context(|| format!("normal form at bifurcation point {index}"))?;
    let ds = options.ds.unwrap_or(settings.ds);
    let predictor = normal_form.predictor(ds, options.amplitude_factor)?;
    info!(
        "Hopf switch: {} = {:.8} -> {:.8}, amplitude {:e}, period {:.6}",
        lens.name, normal_form.p, predictor.p, predictor.amplitude, predictor.period
    );

    let guess = orbit_guess(&predictor, kind.slices());
    let params = lens.with(&branch.params, predictor.p);
    let (problem, mut x0) = PeriodicOrbitProblem::new(Arc::clone(&field), params, lens, kind, &guess)?;
    let mut problem = problem.with_mode(options.linearization);

    if options.use_deflation {
        x0 = deflated_guess(&mut problem, &x0, &predictor, kind, &settings.newton)?;
    }

    let settings = match options.nev {
        Some(nev) => settings.with_nev(nev),
        None => *settings,
    };
    let (result, x, tangent) = continue_periodic_orbit(
        &mut problem,
        &x0,
        &settings,
        DenseLinearSolver,
        options.linearization,
        options.update_section_every_step,
        options.continuation,
    )?;
    Ok((result.with_origin(point), x, tangent))
}

/// Corrects the orbit guess with the collapsed orbit (the equilibrium on
/// every slice) deflated.
fn deflated_guess<S>(
    problem: &mut PeriodicOrbitProblem<S>,
    x0: &DVector<f64>,
    predictor: &HopfPredictor,
    kind: PeriodicOrbitKind,
    newton_settings: &NewtonPar,
) -> Result<DVector<f64>>
where
    S: HigherDerivatives + 'static,
    S::Params: 'static,
{
    let collapsed = OrbitGuess {
        states: vec![predictor.x0.clone(); kind.slices()],
        period: predictor.period,
    };
    let operator = DeflationOperator::new(2.0, 1.0, vec![problem.encode(&collapsed)?]);
    let budget = NewtonPar {
        max_iterations: 10 * newton_settings.max_iterations,
        ..*newton_settings
    };
    let mut frozen = FrozenOrbit {
        problem,
        linear: FloquetLinearSolver::new(DenseLinearSolver),
        p: predictor.p,
    };
    let mut deflated = Deflated::new(&mut frozen, &operator);
    let outcome = newton(&mut deflated, x0, &budget)?;
    if !outcome.converged {
        bail!(
            "Deflated Newton did not converge on the orbit guess (residual {:e} after {} iterations)",
            outcome.residuals.last().copied().unwrap_or(f64::NAN),
            outcome.iterations
        );
    }
    info!("deflated orbit guess converged in {} iterations", outcome.iterations);
    Ok(outcome.x)
}
