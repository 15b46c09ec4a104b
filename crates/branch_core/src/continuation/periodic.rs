//! Periodic orbits as zeros of a discretised boundary-value functional.
//!
//! Three formulations share one interface: trapezoidal finite differences,
//! standard multiple shooting and Poincaré-section shooting. Each is paired
//! with one of four [`LinearizationMode`]s and hands the stepper a
//! Floquet-wrapped jacobian so that stability comes from the monodromy.

mod poincare;
mod shooting;
mod trapezoid;

pub use poincare::PoincareShooting;
pub use shooting::Shooting;
pub use trapezoid::Trapezoid;

use anyhow::{bail, Result};
use log::warn;
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use super::floquet::{FloquetEigenSolver, FloquetLinearSolver, FloquetWrapper};
use super::problem::{ContinuationProblem, ParamLens};
use super::results::Branch;
use super::stepper::{continuation, ContinuationOptions, RecordFromSolution};
use super::types::{BranchKind, ContinuationPar, Tangent};
use crate::autodiff::{jacobian_of, jvp_of};
use crate::error::ContinuationError;
use crate::linalg::{DenseEigenSolver, Jacobian, LinearSolver, MatrixFree};
use crate::traits::{Scalar, VectorField};

/// Which discretisation of the periodic orbit to use.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum PeriodicOrbitKind {
    /// `m` time slices joined by the trapezoidal rule.
    Trapezoid { m: usize },
    /// `m` shooting segments, each integrated with `steps` RK4 steps.
    Shooting { m: usize, steps: usize },
    /// `m` hyperplane sections; `steps` RK4 steps per expected transit.
    PoincareShooting { m: usize, steps: usize },
}

impl PeriodicOrbitKind {
    /// Number of time slices (or sections).
    pub fn slices(&self) -> usize {
        match *self {
            PeriodicOrbitKind::Trapezoid { m }
            | PeriodicOrbitKind::Shooting { m, .. }
            | PeriodicOrbitKind::PoincareShooting { m, .. } => m,
        }
    }
}

/// How the jacobian of the periodic-orbit functional is formed.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub enum LinearizationMode {
    /// Matrix-free, from [`VectorField::jvp`].
    AnalyticMatrixFree,
    /// Matrix-free, from dual numbers pushed through the functional.
    AdMatrixFree,
    /// Dense, from dual numbers.
    AdDense,
    /// Dense, from forward differences with step `delta`.
    FiniteDifferenceDense { delta: f64 },
}

impl LinearizationMode {
    pub const ALLOWED: &'static [&'static str] = &[
        "analytic-matrix-free",
        "ad-matrix-free",
        "ad-dense",
        "finite-difference-dense",
    ];

    pub const DEFAULT_FD_STEP: f64 = 1e-8;
}

impl Default for LinearizationMode {
    fn default() -> Self {
        LinearizationMode::AdDense
    }
}

impl fmt::Display for LinearizationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinearizationMode::AnalyticMatrixFree => write!(f, "analytic-matrix-free"),
            LinearizationMode::AdMatrixFree => write!(f, "ad-matrix-free"),
            LinearizationMode::AdDense => write!(f, "ad-dense"),
            LinearizationMode::FiniteDifferenceDense { delta } => {
                write!(f, "finite-difference-dense:{delta:e}")
            }
        }
    }
}

/// Parses `analytic-matrix-free`, `ad-matrix-free`, `ad-dense` or
/// `finite-difference-dense[:delta]`.
impl FromStr for LinearizationMode {
    type Err = ContinuationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let unknown = || ContinuationError::UnknownLinearization {
            given: s.to_string(),
            allowed: Self::ALLOWED,
        };
        let (name, arg) = match s.trim().split_once(':') {
            Some((name, arg)) => (name, Some(arg)),
            None => (s.trim(), None),
        };
        match (name, arg) {
            ("analytic-matrix-free", None) => Ok(LinearizationMode::AnalyticMatrixFree),
            ("ad-matrix-free", None) => Ok(LinearizationMode::AdMatrixFree),
            ("ad-dense", None) => Ok(LinearizationMode::AdDense),
            ("finite-difference-dense", None) => Ok(LinearizationMode::FiniteDifferenceDense {
                delta: Self::DEFAULT_FD_STEP,
            }),
            ("finite-difference-dense", Some(arg)) => match arg.trim().parse::<f64>() {
                Ok(delta) if delta > 0.0 && delta.is_finite() => {
                    Ok(LinearizationMode::FiniteDifferenceDense { delta })
                }
                _ => Err(unknown()),
            },
            _ => Err(unknown()),
        }
    }
}

/// An orbit sampled at `m` equally spaced times over one period.
#[derive(Debug, Clone, PartialEq)]
pub struct OrbitGuess {
    pub states: Vec<DVector<f64>>,
    pub period: f64,
}

impl OrbitGuess {
    /// Samples `orbit(t)` at `t_k = k T / m`, `k = 0..m`.
    pub fn sample<F>(orbit: F, period: f64, m: usize) -> Self
    where
        F: Fn(f64) -> DVector<f64>,
    {
        let states = (0..m)
            .map(|k| orbit(period * k as f64 / m as f64))
            .collect();
        Self { states, period }
    }
}

pub(crate) fn eval_field<S: VectorField, T: Scalar>(field: &S, params: &S::Params, x: &[T]) -> Vec<T> {
    let mut out = vec![T::zero(); field.dimension()];
    field.eval(x, params, &mut out);
    out
}

pub(crate) fn eval_field_f64<S: VectorField>(field: &S, params: &S::Params, x: &[f64]) -> DVector<f64> {
    DVector::from_vec(eval_field(field, params, x))
}

pub(crate) fn field_jacobian<S: VectorField>(field: &S, params: &S::Params, x: &[f64]) -> DMatrix<f64> {
    jacobian_of(x, field.dimension(), |xd, out| field.eval(xd, params, out))
}

/// The formulation actually in use; dispatch is by variant.
#[derive(Debug, Clone)]
enum OrbitVariant {
    Trapezoid(Trapezoid),
    Shooting(Shooting),
    Poincare(PoincareShooting),
}

macro_rules! dispatch {
    ($variant:expr, $inner:ident => $body:expr) => {
        match $variant {
            OrbitVariant::Trapezoid($inner) => $body,
            OrbitVariant::Shooting($inner) => $body,
            OrbitVariant::Poincare($inner) => $body,
        }
    };
}

impl OrbitVariant {
    fn residual<S: VectorField, T: Scalar>(&self, field: &S, params: &S::Params, x: &[T]) -> Vec<T> {
        dispatch!(self, v => v.residual(field, params, x))
    }

    fn jvp<S: VectorField>(&self, field: &S, params: &S::Params, x: &[f64], dx: &[f64]) -> Vec<f64> {
        dispatch!(self, v => v.jvp(field, params, x, dx))
    }

    fn dense_jacobian<S: VectorField>(&self, field: &S, params: &S::Params, x: &[f64]) -> DMatrix<f64> {
        match self {
            OrbitVariant::Trapezoid(v) => v.assembled_jacobian(field, params, x),
            other => jacobian_of(x, x.len(), |xd, out| {
                out.copy_from_slice(&other.residual(field, params, xd))
            }),
        }
    }

    fn monodromy<S: VectorField>(&self, field: &S, params: &S::Params, x: &[f64]) -> Result<DMatrix<f64>> {
        dispatch!(self, v => v.monodromy(field, params, x))
    }

    fn period<S: VectorField>(&self, field: &S, params: &S::Params, x: &[f64]) -> f64 {
        match self {
            OrbitVariant::Trapezoid(v) => v.period(x),
            OrbitVariant::Shooting(v) => v.period(x),
            OrbitVariant::Poincare(v) => v.period(field, params, x),
        }
    }

    fn slice_states(&self, x: &[f64]) -> Vec<DVector<f64>> {
        dispatch!(self, v => v.slice_states(x))
    }

    fn has_trivial_multiplier(&self) -> bool {
        !matches!(self, OrbitVariant::Poincare(_))
    }
}

/// A periodic orbit of `field` continued in the lensed parameter.
///
/// Cloning is cheap apart from the section data; the field is shared.
pub struct PeriodicOrbitProblem<S: VectorField> {
    field: Arc<S>,
    params: S::Params,
    lens: ParamLens<S::Params>,
    kind: PeriodicOrbitKind,
    variant: OrbitVariant,
    mode: LinearizationMode,
}

impl<S: VectorField> Clone for PeriodicOrbitProblem<S> {
    fn clone(&self) -> Self {
        Self {
            field: Arc::clone(&self.field),
            params: self.params.clone(),
            lens: self.lens,
            kind: self.kind,
            variant: self.variant.clone(),
            mode: self.mode,
        }
    }
}

impl<S> PeriodicOrbitProblem<S>
where
    S: VectorField + 'static,
    S::Params: 'static,
{
    /// Builds the functional around `guess` (sampled with `kind.slices()`
    /// points) and returns it with the matching initial unknowns.
    pub fn new(
        field: Arc<S>,
        params: S::Params,
        lens: ParamLens<S::Params>,
        kind: PeriodicOrbitKind,
        guess: &OrbitGuess,
    ) -> Result<(Self, DVector<f64>)> {
        let n = field.dimension();
        if guess.states.len() != kind.slices() {
            bail!(
                "Orbit guess has {} samples, {:?} needs {}",
                guess.states.len(),
                kind,
                kind.slices()
            );
        }
        if let Some(bad) = guess.states.iter().find(|s| s.len() != n) {
            bail!("Orbit sample has dimension {}, expected {}", bad.len(), n);
        }
        if !(guess.period > 0.0) {
            bail!("Orbit period must be positive (got {})", guess.period);
        }
        let (variant, x0) = match kind {
            PeriodicOrbitKind::Trapezoid { .. } => {
                let (v, x0) = Trapezoid::from_guess(field.as_ref(), &params, guess)?;
                (OrbitVariant::Trapezoid(v), x0)
            }
            PeriodicOrbitKind::Shooting { steps, .. } => {
                let (v, x0) = Shooting::from_guess(field.as_ref(), &params, guess, steps)?;
                (OrbitVariant::Shooting(v), x0)
            }
            PeriodicOrbitKind::PoincareShooting { steps, .. } => {
                let (v, x0) = PoincareShooting::from_guess(field.as_ref(), &params, guess, steps)?;
                (OrbitVariant::Poincare(v), x0)
            }
        };
        let problem = Self {
            field,
            params,
            lens,
            kind,
            variant,
            mode: LinearizationMode::default(),
        };
        Ok((problem, x0))
    }

    pub fn with_mode(mut self, mode: LinearizationMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn kind(&self) -> PeriodicOrbitKind {
        self.kind
    }

    pub fn mode(&self) -> LinearizationMode {
        self.mode
    }

    pub fn slices(&self) -> usize {
        self.kind.slices()
    }

    pub fn field(&self) -> &Arc<S> {
        &self.field
    }

    /// Period of the orbit encoded by `x` at parameter `p`.
    pub fn period(&self, x: &DVector<f64>, p: f64) -> f64 {
        let par = self.lens.with(&self.params, p);
        self.variant.period(self.field.as_ref(), &par, x.as_slice())
    }

    /// Encodes `guess` in the unknowns of this problem, without moving the
    /// reference orbit or the sections.
    pub fn encode(&self, guess: &OrbitGuess) -> Result<DVector<f64>> {
        if guess.states.len() != self.slices() {
            bail!(
                "Orbit guess has {} samples, expected {}",
                guess.states.len(),
                self.slices()
            );
        }
        Ok(match &self.variant {
            OrbitVariant::Trapezoid(v) => v.pack(&guess.states, guess.period),
            OrbitVariant::Shooting(v) => v.pack(&guess.states, guess.period),
            OrbitVariant::Poincare(v) => v.pack(&guess.states),
        })
    }

    /// Full states at the time slices (or section points).
    pub fn slice_states(&self, x: &DVector<f64>) -> Vec<DVector<f64>> {
        self.variant.slice_states(x.as_slice())
    }

    /// Monodromy matrix of the orbit encoded by `x`.
    pub fn monodromy(&self, x: &DVector<f64>, p: f64) -> Result<DMatrix<f64>> {
        let par = self.lens.with(&self.params, p);
        self.variant.monodromy(self.field.as_ref(), &par, x.as_slice())
    }

    /// Records the period and the peak-to-peak amplitude of the first
    /// component.
    pub fn default_record(&self) -> RecordFromSolution {
        let field = Arc::clone(&self.field);
        let params = self.params.clone();
        let lens = self.lens;
        let variant = self.variant.clone();
        Box::new(move |x, p| {
            let par = lens.with(&params, p);
            let period = variant.period(field.as_ref(), &par, x.as_slice());
            let first: Vec<f64> = variant
                .slice_states(x.as_slice())
                .iter()
                .filter_map(|s| s.get(0).copied())
                .collect();
            let max = first.iter().copied().fold(f64::NEG_INFINITY, f64::max);
            let min = first.iter().copied().fold(f64::INFINITY, f64::min);
            vec![("period".to_string(), period), ("amplitude".to_string(), max - min)]
        })
    }

    fn finite_difference_jacobian(&self, x: &DVector<f64>, par: &S::Params, delta: f64) -> DMatrix<f64> {
        let n = x.len();
        let base = self.variant.residual(self.field.as_ref(), par, x.as_slice());
        let mut jac = DMatrix::zeros(base.len(), n);
        let mut shifted = x.as_slice().to_vec();
        for j in 0..n {
            shifted[j] += delta;
            let plus = self.variant.residual(self.field.as_ref(), par, &shifted);
            for i in 0..base.len() {
                jac[(i, j)] = (plus[i] - base[i]) / delta;
            }
            shifted[j] = x[j];
        }
        jac
    }
}

impl<S> ContinuationProblem for PeriodicOrbitProblem<S>
where
    S: VectorField + 'static,
    S::Params: 'static,
{
    type Params = S::Params;

    fn dimension(&self) -> usize {
        match &self.variant {
            OrbitVariant::Trapezoid(v) => v.unknowns(),
            OrbitVariant::Shooting(v) => v.unknowns(),
            OrbitVariant::Poincare(v) => v.unknowns(),
        }
    }

    fn params(&self) -> &S::Params {
        &self.params
    }

    fn lens(&self) -> ParamLens<S::Params> {
        self.lens
    }

    fn residual(&mut self, x: &DVector<f64>, p: f64) -> Result<DVector<f64>> {
        if x.len() != self.dimension() {
            bail!("Orbit unknowns have length {}, expected {}", x.len(), self.dimension());
        }
        let par = self.lens.with(&self.params, p);
        Ok(DVector::from_vec(self.variant.residual(self.field.as_ref(), &par, x.as_slice())))
    }

    fn jacobian(&mut self, x: &DVector<f64>, p: f64) -> Result<Jacobian> {
        let par = self.lens.with(&self.params, p);
        let n = x.len();
        let inner = match self.mode {
            LinearizationMode::AnalyticMatrixFree => {
                let (field, variant, par, x0) =
                    (Arc::clone(&self.field), self.variant.clone(), par.clone(), x.clone());
                Jacobian::MatrixFree(MatrixFree::new(n, move |dx| {
                    Ok(DVector::from_vec(variant.jvp(
                        field.as_ref(),
                        &par,
                        x0.as_slice(),
                        dx.as_slice(),
                    )))
                }))
            }
            LinearizationMode::AdMatrixFree => {
                let (field, variant, par, x0) =
                    (Arc::clone(&self.field), self.variant.clone(), par.clone(), x.clone());
                Jacobian::MatrixFree(MatrixFree::new(n, move |dx| {
                    Ok(DVector::from_vec(jvp_of(x0.as_slice(), dx.as_slice(), n, |xd, out| {
                        out.copy_from_slice(&variant.residual(field.as_ref(), &par, xd))
                    })))
                }))
            }
            LinearizationMode::AdDense => {
                Jacobian::Dense(self.variant.dense_jacobian(self.field.as_ref(), &par, x.as_slice()))
            }
            LinearizationMode::FiniteDifferenceDense { delta } => {
                Jacobian::Dense(self.finite_difference_jacobian(x, &par, delta))
            }
        };

        let (field, variant, x0) = (Arc::clone(&self.field), self.variant.clone(), x.clone());
        let trivial = variant.has_trivial_multiplier();
        Ok(Jacobian::Floquet(Box::new(FloquetWrapper::deferred(
            inner,
            x.clone(),
            p,
            trivial,
            move || variant.monodromy(field.as_ref(), &par, x0.as_slice()),
        ))))
    }

    fn branch_kind(&self) -> BranchKind {
        BranchKind::PeriodicOrbit
    }

    fn update_section(&mut self, x: &DVector<f64>, p: f64) -> Result<bool> {
        let par = self.lens.with(&self.params, p);
        let field = self.field.as_ref();
        match &mut self.variant {
            OrbitVariant::Trapezoid(_) => {
                warn!("update_section is not implemented for the trapezoid formulation; ignoring");
                Ok(true)
            }
            OrbitVariant::Shooting(v) => v.update_section(field, &par, x.as_slice()),
            OrbitVariant::Poincare(v) => v.update_section(field, &par, x.as_slice()),
        }
    }

    fn functional(&self) -> Option<Arc<dyn Any + Send + Sync>> {
        Some(Arc::new(self.clone()))
    }
}

/// Continues a periodic orbit, installing the Floquet-aware linear and eigen
/// solvers and the requested linearization.
///
/// `linear_solver` sees the jacobian of the functional without its Floquet
/// wrapper, so matrix-free modes reach it as operators.
/// [`DenseLinearSolver`](crate::linalg::DenseLinearSolver)
/// materialises them column by column.
pub fn continue_periodic_orbit<S, L>(
    problem: &mut PeriodicOrbitProblem<S>,
    x0: &DVector<f64>,
    settings: &ContinuationPar,
    linear_solver: L,
    mode: LinearizationMode,
    update_section_every_step: usize,
    mut options: ContinuationOptions<S::Params>,
) -> Result<(Branch<S::Params>, DVector<f64>, Tangent)>
where
    S: VectorField + 'static,
    S::Params: 'static,
    L: LinearSolver,
{
    problem.mode = mode;
    options.update_section_every_step = update_section_every_step;
    let inner = std::mem::replace(&mut options.eigen_solver, Box::new(DenseEigenSolver));
    options.eigen_solver = Box::new(FloquetEigenSolver::new(inner));
    if options.record_from_solution.is_none() {
        options.record_from_solution = Some(problem.default_record());
    }
    let solver = FloquetLinearSolver::new(linear_solver);
    continuation(problem, x0, settings, &solver, options)
}
