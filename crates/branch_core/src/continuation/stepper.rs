//! Pseudo-arclength predictor-corrector stepper.
//!
//! Each step predicts along the current tangent, corrects with Newton on the
//! bordered system `[F(x, p); dotθ(z - z0, τ0) - ds]`, adapts `ds` to the
//! Newton effort, and then hands the spectrum of the new point to the
//! detector.

use anyhow::{anyhow, bail, Context, Result};
use log::{debug, info, warn};
use nalgebra::DVector;
use std::sync::Arc;

use super::detection::{
    bisect, classify, kernel_dimension, Bracket, Crossing, Probe, SpectralProbe, SpectralSummary,
};
use super::problem::ContinuationProblem;
use super::results::{Branch, ContResult, SolutionSample};
use super::types::{
    spectral_counts, ContinuationPar, CriticalKind, CriticalPoint, CriticalStatus, EigenRecord,
    KernelDimension, StepRecord, StopReason, Tangent,
};
use super::util::{
    bordered_solution, bordered_tangent, dot_theta, join_augmented, split_augmented,
    tangent_angle,
};
use crate::error::ContinuationError;
use crate::linalg::{DenseEigenSolver, EigenOutcome, EigenSolver, Jacobian, LinearSolver};
use crate::newton::{newton, NewtonSystem};

/// Called after every accepted step with `(x, tangent, step, result so far)`;
/// returning `false` stops the stepper.
pub type FinaliseStep<P> = Box<dyn FnMut(&DVector<f64>, &Tangent, usize, &ContResult<P>) -> bool>;

/// Named scalar projections of a solution `(x, p)` stored in every step record.
pub type RecordFromSolution = Box<dyn Fn(&DVector<f64>, f64) -> Vec<(String, f64)>>;

/// Optional behaviour of [`continuation`].
pub struct ContinuationOptions<P> {
    /// Default: none.
    pub finalise_step: Option<FinaliseStep<P>>,
    /// Default: the euclidean norm of `x`, recorded as `"norm"`.
    pub record_from_solution: Option<RecordFromSolution>,
    /// Default: [`DenseEigenSolver`].
    pub eigen_solver: Box<dyn EigenSolver>,
    /// Also continue in the `-ds` direction from the start point; the branch
    /// then has two segments. Default: false.
    pub both_sides: bool,
    /// Call [`ContinuationProblem::update_section`] every that many steps
    /// (0 = never). Default: 0.
    pub update_section_every_step: usize,
}

impl<P> Default for ContinuationOptions<P> {
    fn default() -> Self {
        Self {
            finalise_step: None,
            record_from_solution: None,
            eigen_solver: Box::new(DenseEigenSolver),
            both_sides: false,
            update_section_every_step: 0,
        }
    }
}

/// Continues the solution `x0` of `problem` in its lensed parameter.
///
/// `x0` is first corrected at the starting parameter. Returns the branch
/// together with the last accepted state and tangent (of the last segment
/// when `both_sides` is set).
pub fn continuation<Pr, L>(
    problem: &mut Pr,
    x0: &DVector<f64>,
    settings: &ContinuationPar,
    linear_solver: &L,
    options: ContinuationOptions<Pr::Params>,
) -> Result<(Branch<Pr::Params>, DVector<f64>, Tangent)>
where
    Pr: ContinuationProblem + ?Sized,
    L: LinearSolver + ?Sized,
{
    settings.validate()?;
    if x0.len() != problem.dimension() {
        bail!(
            "Initial guess dimension mismatch. Expected {}, got {}.",
            problem.dimension(),
            x0.len()
        );
    }
    let p0 = problem.parameter();
    if !(settings.p_min..=settings.p_max).contains(&p0) {
        return Err(ContinuationError::InvalidConfig(format!(
            "starting parameter {p0} lies outside [{}, {}]",
            settings.p_min, settings.p_max
        ))
        .into());
    }

    let start = {
        let mut system = FixedParameter {
            problem: &mut *problem,
            linear: linear_solver,
            p: p0,
        };
        let outcome = newton(&mut system, x0, &settings.newton)?;
        if !outcome.converged {
            bail!(
                "Initial guess did not converge at p = {p0} (residual {:e} after {} iterations)",
                outcome.residuals.last().copied().unwrap_or(f64::NAN),
                outcome.iterations
            );
        }
        outcome.x
    };

    let ContinuationOptions {
        mut finalise_step,
        record_from_solution,
        eigen_solver,
        both_sides,
        update_section_every_step,
    } = options;
    let record: RecordFromSolution =
        record_from_solution.unwrap_or_else(|| Box::new(|x, _| vec![("norm".to_string(), x.norm())]));

    let directions: &[f64] = if both_sides { &[1.0, -1.0] } else { &[1.0] };
    let mut segments = Vec::with_capacity(directions.len());
    let mut last = None;
    for &side in directions {
        let direction = side * settings.ds.signum();
        let mut stepper = Stepper {
            problem: &mut *problem,
            linear: linear_solver,
            eigen: eigen_solver.as_ref(),
            settings,
            linear_iterations: 0,
        };
        let hooks = Hooks {
            record: &record,
            finalise: finalise_step.as_mut(),
            update_section_every_step,
        };
        let (result, x, tangent) = stepper.run(&start, p0, direction, hooks)?;
        info!("{result}");
        segments.push(result);
        last = Some((x, tangent));
    }

    let (x, tangent) = last.ok_or_else(|| anyhow!("no continuation segment was run"))?;
    Ok((Branch::from_segments(segments)?, x, tangent))
}

/// Newton at a frozen parameter, used to polish the starting point.
struct FixedParameter<'a, Pr: ?Sized, L: ?Sized> {
    problem: &'a mut Pr,
    linear: &'a L,
    p: f64,
}

impl<'a, Pr, L> NewtonSystem for FixedParameter<'a, Pr, L>
where
    Pr: ContinuationProblem + ?Sized,
    L: LinearSolver + ?Sized,
{
    fn dimension(&self) -> usize {
        self.problem.dimension()
    }

    fn residual(&mut self, x: &DVector<f64>) -> Result<DVector<f64>> {
        self.problem.residual(x, self.p)
    }

    fn newton_direction(
        &mut self,
        x: &DVector<f64>,
        residual: &DVector<f64>,
    ) -> Result<(DVector<f64>, usize)> {
        let jac = self.problem.jacobian(x, self.p)?;
        self.linear.solve(&jac, residual)
    }
}

/// The bordered pseudo-arclength system on `z = [x; p]`.
struct PalcSystem<'a, Pr: ?Sized, L: ?Sized> {
    problem: &'a mut Pr,
    linear: &'a L,
    x0: &'a DVector<f64>,
    p0: f64,
    tangent: &'a Tangent,
    ds: f64,
    theta: f64,
}

impl<'a, Pr, L> NewtonSystem for PalcSystem<'a, Pr, L>
where
    Pr: ContinuationProblem + ?Sized,
    L: LinearSolver + ?Sized,
{
    fn dimension(&self) -> usize {
        self.problem.dimension() + 1
    }

    fn residual(&mut self, z: &DVector<f64>) -> Result<DVector<f64>> {
        let (x, p) = split_augmented(z);
        let f = self.problem.residual(&x, p)?;
        let arclength = dot_theta(&(&x - self.x0), p - self.p0, &self.tangent.x, self.tangent.p, self.theta);
        Ok(join_augmented(&f, arclength - self.ds))
    }

    fn newton_direction(
        &mut self,
        z: &DVector<f64>,
        residual: &DVector<f64>,
    ) -> Result<(DVector<f64>, usize)> {
        let (x, p) = split_augmented(z);
        let (rx, rn) = split_augmented(residual);
        let jac = self.problem.jacobian(&x, p)?;
        let dfdp = self.problem.param_derivative(&x, p)?;
        let (u1, u2, its) = self.linear.solve2(&jac, &rx, &dfdp)?;
        let (dx, dp) = bordered_solution(&u1, &u2, rn, self.tangent, self.theta)?;
        Ok((join_augmented(&dx, dp), its))
    }
}

struct Hooks<'h, P> {
    record: &'h RecordFromSolution,
    finalise: Option<&'h mut FinaliseStep<P>>,
    update_section_every_step: usize,
}

struct Stepper<'a, Pr: ?Sized, L: ?Sized> {
    problem: &'a mut Pr,
    linear: &'a L,
    eigen: &'a dyn EigenSolver,
    settings: &'a ContinuationPar,
    linear_iterations: usize,
}

/// An accepted point with the data needed to record it.
struct Accepted {
    x: DVector<f64>,
    p: f64,
    tangent: Tangent,
    jacobian: Jacobian,
    newton_iterations: usize,
    ds: f64,
}

impl<'a, Pr, L> Stepper<'a, Pr, L>
where
    Pr: ContinuationProblem + ?Sized,
    L: LinearSolver + ?Sized,
{
    /// Tangent at the start point, oriented so that its parameter component
    /// has the sign of `direction`. The jacobian is handed back for the
    /// spectrum of the same point.
    fn initial_tangent(&mut self, x: &DVector<f64>, p: f64, direction: f64) -> Result<(Tangent, Jacobian)> {
        let jac = self.problem.jacobian(x, p)?;
        let dfdp = self.problem.param_derivative(x, p)?;
        let (u2, its) = self.linear.solve(&jac, &dfdp)?;
        self.linear_iterations += its;
        let tangent = Tangent { x: -u2, p: 1.0 }.normalize(self.settings.theta)?;
        Ok((if direction < 0.0 { tangent.negate() } else { tangent }, jac))
    }

    fn next_tangent(&mut self, x: &DVector<f64>, p: f64, previous: &Tangent) -> Result<(Tangent, Jacobian)> {
        let jac = self.problem.jacobian(x, p)?;
        let dfdp = self.problem.param_derivative(x, p)?;
        let (u2, its) = self.linear.solve(&jac, &dfdp)?;
        self.linear_iterations += its;
        Ok((bordered_tangent(&u2, previous, self.settings.theta)?, jac))
    }

    /// Corrects the point at arclength `ds` from `(x0, p0)` along `tangent`.
    fn correct(
        &mut self,
        x0: &DVector<f64>,
        p0: f64,
        tangent: &Tangent,
        ds: f64,
    ) -> Result<Option<(DVector<f64>, f64, usize)>> {
        let predicted = join_augmented(&(x0 + &tangent.x * ds), p0 + tangent.p * ds);
        let mut system = PalcSystem {
            problem: &mut *self.problem,
            linear: self.linear,
            x0,
            p0,
            tangent,
            ds,
            theta: self.settings.theta,
        };
        let outcome = newton(&mut system, &predicted, &self.settings.newton)?;
        self.linear_iterations += outcome.linear_iterations;
        if !outcome.converged {
            return Ok(None);
        }
        let (x, p) = split_augmented(&outcome.x);
        Ok(Some((x, p, outcome.iterations)))
    }

    fn spectrum(&self, jac: &Jacobian, p: f64) -> Result<EigenOutcome> {
        self.eigen
            .eigen(jac, self.settings.nev, self.settings.save_eigenvectors)
            .with_context(|| format!("eigen solve failed at p = {p}"))
    }

    /// Predict-correct with step halving; `None` once the step is stalled.
    fn advance(&mut self, x: &DVector<f64>, p: f64, tangent: &Tangent, ds: f64) -> Result<Option<Accepted>> {
        let settings = self.settings;
        let direction = ds.signum();
        let mut ds_abs = ds.abs();
        let mut retries = 0usize;
        loop {
            let attempt = ds_abs * direction;
            if let Some((x_new, p_new, its)) = self.correct(x, p, tangent, attempt)? {
                match self.next_tangent(&x_new, p_new, tangent) {
                    Ok((tangent_new, jacobian)) => {
                        return Ok(Some(Accepted {
                            x: x_new,
                            p: p_new,
                            tangent: tangent_new,
                            jacobian,
                            newton_iterations: its,
                            ds: attempt,
                        }))
                    }
                    Err(err) => debug!("tangent failed at p = {p_new}: {err:#}"),
                }
            }
            if ds_abs <= settings.dsmin || retries >= settings.max_corrector_retries {
                return Ok(None);
            }
            retries += 1;
            ds_abs = (0.5 * ds_abs).max(settings.dsmin);
            debug!("corrector failed, retrying with ds = {:e} ({retries})", ds_abs * direction);
        }
    }

    /// Next step size from the Newton effort of the last step.
    fn adapt(&self, ds: f64, newton_iterations: usize) -> f64 {
        let settings = self.settings;
        let target = settings.newton.max_iterations / 2;
        let factor = 1.0 + settings.a;
        let ds_abs = ds.abs();
        let next = if newton_iterations < target {
            (ds_abs * factor).min(settings.dsmax)
        } else if newton_iterations > target {
            (ds_abs / factor).max(settings.dsmin)
        } else {
            ds_abs
        };
        next * ds.signum()
    }

    fn eigen_record(&self, jac: &Jacobian, p: f64, step: usize) -> Result<(EigenRecord, Option<SpectralSummary>)> {
        if !self.settings.computes_eigenvalues() {
            return Ok((
                EigenRecord {
                    eigenvalues: Vec::new(),
                    eigenvectors: None,
                    step,
                },
                None,
            ));
        }
        let eig = self.spectrum(jac, p)?;
        let (n_unstable, n_imag) = spectral_counts(&eig.values, self.settings.tol_stability);
        Ok((
            EigenRecord {
                eigenvalues: eig.values,
                eigenvectors: eig.vectors,
                step,
            },
            Some(SpectralSummary { n_unstable, n_imag }),
        ))
    }

    fn run(
        &mut self,
        x0: &DVector<f64>,
        p0: f64,
        direction: f64,
        mut hooks: Hooks<'_, Pr::Params>,
    ) -> Result<(ContResult<Pr::Params>, DVector<f64>, Tangent)> {
        let settings = self.settings;
        let theta = settings.theta;

        let projection = (hooks.record)(x0, p0);
        let mut result = ContResult::new(
            *settings,
            self.problem.branch_kind(),
            self.problem.params().clone(),
            self.problem.lens(),
            projection.iter().map(|(name, _)| name.clone()).collect(),
        );
        let mut x = x0.clone();
        let mut p = p0;
        let ds0 = settings.ds.abs();
        let (mut tangent, jac) = self
            .initial_tangent(&x, p, direction)
            .context("failed to compute the initial tangent")?;
        let (eig, mut summary) = self.eigen_record(&jac, p, 0)?;
        result.push_step(
            StepRecord {
                projection: projection.into_iter().map(|(_, v)| v).collect(),
                param: p,
                newton_iterations: 0,
                linear_iterations: self.linear_iterations,
                ds: ds0,
                theta: 0.0,
                n_unstable: summary.map(|s| s.n_unstable),
                n_imag: summary.map(|s| s.n_imag),
                step: 0,
            },
            eig,
        );
        if settings.save_sol_every_step > 0 {
            result.solutions.push(SolutionSample {
                x: x.clone(),
                p,
                step: 0,
            });
        }

        let mut ds = ds0;
        let mut step = 0usize;
        result.stop_reason = loop {
            if step >= settings.max_steps {
                break StopReason::MaxSteps;
            }
            let Some(accepted) = self.advance(&x, p, &tangent, ds)? else {
                warn!("continuation stalled at p = {p} (|ds| reached {:e})", settings.dsmin);
                break StopReason::Stalled;
            };
            if accepted.p < settings.p_min || accepted.p > settings.p_max {
                info!("parameter left [{}, {}] at step {}", settings.p_min, settings.p_max, step + 1);
                break StopReason::ParameterBounds;
            }
            step += 1;

            let (eig, next_summary) = self.eigen_record(&accepted.jacobian, accepted.p, step)?;
            let projection = (hooks.record)(&accepted.x, accepted.p);
            let record = StepRecord {
                projection: projection.iter().map(|(_, v)| *v).collect(),
                param: accepted.p,
                newton_iterations: accepted.newton_iterations,
                linear_iterations: self.linear_iterations,
                ds: accepted.ds,
                theta: tangent_angle(&tangent, &accepted.tangent, theta),
                n_unstable: next_summary.map(|s| s.n_unstable),
                n_imag: next_summary.map(|s| s.n_imag),
                step,
            };
            debug!(
                "step {step}: p = {:.8}, ds = {:e}, newton = {}, n_unstable = {:?}",
                record.param, record.ds, record.newton_iterations, record.n_unstable
            );

            let fold = settings.detect_fold && tangent.p * accepted.tangent.p < 0.0;
            if fold {
                let delta = match (summary, next_summary) {
                    (Some(before), Some(after)) => kernel_dimension(before, after),
                    _ => KernelDimension::new(1, 0),
                };
                let cp = CriticalPoint {
                    kind: CriticalKind::Fold,
                    index: step,
                    param: accepted.p,
                    norm: accepted.x.norm(),
                    projection: record.projection.clone(),
                    x: accepted.x.clone(),
                    tangent: accepted.tangent.clone(),
                    ind_ev: next_summary.map_or(0, |s| s.n_unstable.saturating_sub(1)),
                    step,
                    status: CriticalStatus::Guess,
                    delta,
                    precision: -1.0,
                    interval: (p.min(accepted.p), p.max(accepted.p)),
                };
                info!("fold detected near {} = {:.8} (step {step})", result.lens.name, cp.param);
                result.folds.push(Arc::new(cp));
            }

            if settings.detect_bifurcation >= ContinuationPar::DETECT {
                if let (Some(before), Some(after)) = (summary, next_summary) {
                    if let Some(crossing) = classify(before, after) {
                        let is_fold = fold && crossing.kind == CriticalKind::BranchPoint;
                        if !is_fold {
                            let cp = self.locate(
                                hooks.record,
                                (&x, p, before),
                                (&accepted, after),
                                &tangent,
                                crossing,
                                step,
                            )?;
                            info!(
                                "{:?} detected near {} = {:.8} (step {step}, {:?}, δ = ({}, {}))",
                                cp.kind,
                                result.lens.name,
                                cp.param,
                                cp.status,
                                cp.delta.real,
                                cp.delta.complex_pairs
                            );
                            result.bifurcations.push(Arc::new(cp));
                        }
                    }
                }
            }

            result.push_step(record, eig);
            if settings.save_sol_every_step > 0 && step % settings.save_sol_every_step == 0 {
                result.solutions.push(SolutionSample {
                    x: accepted.x.clone(),
                    p: accepted.p,
                    step,
                });
            }

            ds = self.adapt(accepted.ds, accepted.newton_iterations);
            x = accepted.x;
            p = accepted.p;
            tangent = accepted.tangent;
            summary = next_summary;

            if hooks.update_section_every_step > 0 && step % hooks.update_section_every_step == 0 {
                debug!("updating section at step {step}");
                if !self.problem.update_section(&x, p)? {
                    break StopReason::Callback;
                }
            }
            if let Some(finalise) = hooks.finalise.as_mut() {
                if !finalise(&x, &tangent, step, &result) {
                    info!("finalise_step stopped continuation at step {step}");
                    break StopReason::Callback;
                }
            }
        };

        result.functional = self.problem.functional();
        Ok((result, x, tangent))
    }

    /// Builds the critical point for a spectral crossing, bisecting when
    /// asked to.
    fn locate(
        &mut self,
        record: &RecordFromSolution,
        before: (&DVector<f64>, f64, SpectralSummary),
        after: (&Accepted, SpectralSummary),
        tangent: &Tangent,
        crossing: Crossing,
        step: usize,
    ) -> Result<CriticalPoint> {
        let (x_a, p_a, summary_a) = before;
        let (accepted, summary_b) = after;
        let mut cp = CriticalPoint {
            kind: crossing.kind,
            index: step,
            param: accepted.p,
            norm: accepted.x.norm(),
            projection: Vec::new(),
            x: accepted.x.clone(),
            tangent: accepted.tangent.clone(),
            ind_ev: crossing.ind_ev,
            step,
            status: CriticalStatus::Guess,
            delta: crossing.delta,
            precision: -1.0,
            interval: (p_a.min(accepted.p), p_a.max(accepted.p)),
        };

        let settings = self.settings;
        if settings.detect_bifurcation >= ContinuationPar::BISECT {
            let outcome = bisect(
                self,
                settings,
                Bracket {
                    x: x_a,
                    p: p_a,
                    summary: summary_a,
                },
                Bracket {
                    x: &accepted.x,
                    p: accepted.p,
                    summary: summary_b,
                },
                tangent,
                accepted.ds,
            )?;
            cp.norm = outcome.x.norm();
            cp.x = outcome.x;
            cp.param = outcome.p;
            cp.tangent = tangent.clone();
            cp.status = outcome.status;
            cp.precision = outcome.precision;
            cp.interval = outcome.interval;
        }

        cp.projection = record(&cp.x, cp.param).into_iter().map(|(_, v)| v).collect();
        Ok(cp)
    }
}

impl<'a, Pr, L> SpectralProbe for Stepper<'a, Pr, L>
where
    Pr: ContinuationProblem + ?Sized,
    L: LinearSolver + ?Sized,
{
    fn probe(
        &mut self,
        x0: &DVector<f64>,
        p0: f64,
        tangent: &Tangent,
        s: f64,
    ) -> Result<Option<Probe>> {
        let Some((x, p, _)) = self.correct(x0, p0, tangent, s)? else {
            return Ok(None);
        };
        let jac = self.problem.jacobian(&x, p)?;
        let eig = self.spectrum(&jac, p)?;
        let (n_unstable, n_imag) = spectral_counts(&eig.values, self.settings.tol_stability);
        Ok(Some(Probe {
            x,
            p,
            summary: SpectralSummary { n_unstable, n_imag },
        }))
    }
}
