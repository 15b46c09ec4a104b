//! End-to-end runs of the stepper, the detector and Hopf branch switching on
//! small models with known bifurcation structure.

use approx::assert_abs_diff_eq;
use nalgebra::{DMatrix, DVector};
use std::cell::Cell;
use std::f64::consts::PI;
use std::rc::Rc;
use std::sync::Arc;

use super::*;
use crate::error::ContinuationError;
use crate::linalg::DenseLinearSolver;
use crate::traits::{lift, HigherDerivatives, Scalar, VectorField};

/// `F(u, p) = -u (p + u (2 - 5u)) (p - 0.15 - u (2 + 20u))`; the trivial
/// branch has branch points at `p = 0` and `p = 0.15`.
struct Cubic;

impl VectorField for Cubic {
    type Params = f64;

    fn dimension(&self) -> usize {
        1
    }

    fn eval<T: Scalar>(&self, x: &[T], p: &f64, out: &mut [T]) {
        let (u, p): (T, T) = (x[0], lift(*p));
        let two: T = lift(2.0);
        out[0] = -u * (p + u * (two - lift::<T>(5.0) * u)) * (p - lift(0.15) - u * (two + lift::<T>(20.0) * u));
    }
}

impl HigherDerivatives for Cubic {}

/// Stuart-Landau oscillator `z' = (p + i) z - (1 + i q) |z|² z`.
struct Landau {
    q: f64,
}

impl VectorField for Landau {
    type Params = f64;

    fn dimension(&self) -> usize {
        2
    }

    fn eval<T: Scalar>(&self, x: &[T], p: &f64, out: &mut [T]) {
        let (p, q): (T, T) = (lift(*p), lift(self.q));
        let r2 = x[0] * x[0] + x[1] * x[1];
        out[0] = p * x[0] - x[1] - (x[0] - q * x[1]) * r2;
        out[1] = x[0] + p * x[1] - (x[1] + q * x[0]) * r2;
    }
}

impl HigherDerivatives for Landau {}

#[derive(Debug, Clone, PartialEq)]
struct D6Pars {
    mu: f64,
    a: f64,
    b: f64,
    c: f64,
}

/// Cubic system with the symmetry group of the triangle; at `mu = 0` the
/// whole jacobian vanishes on the trivial branch.
fn d6_problem() -> EquilibriumProblem<D6Pars> {
    let others = |i: usize| ((i + 1) % 3, (i + 2) % 3);
    EquilibriumProblem::new(
        3,
        D6Pars {
            mu: -0.2,
            a: 0.3,
            b: 1.5,
            c: 2.9,
        },
        ParamLens::new("mu", |p: &D6Pars| p.mu, |p: &mut D6Pars, v| p.mu = v),
        move |x, p| {
            DVector::from_fn(3, |i, _| {
                let (j, k) = others(i);
                p.mu * x[i] + p.a * x[j] * x[k] - p.b * x[i].powi(3) - p.c * (x[j] * x[j] + x[k] * x[k]) * x[i]
            })
        },
        move |x, p| {
            let mut jac = DMatrix::zeros(3, 3);
            for i in 0..3 {
                let (j, k) = others(i);
                jac[(i, i)] = p.mu - 3.0 * p.b * x[i] * x[i] - p.c * (x[j] * x[j] + x[k] * x[k]);
                jac[(i, j)] = p.a * x[k] - 2.0 * p.c * x[i] * x[j];
                jac[(i, k)] = p.a * x[j] - 2.0 * p.c * x[i] * x[k];
            }
            jac
        },
    )
}

fn p_lens() -> ParamLens<f64> {
    ParamLens::new("p", |p| *p, |p, v| *p = v)
}

fn cubic_settings() -> ContinuationPar {
    ContinuationPar::default()
        .with_ds(0.01)
        .with_step_bounds(1e-4, 0.05)
        .with_param_bounds(-0.5, 0.4)
}

fn cubic_branch(options: ContinuationOptions<f64>) -> Branch<f64> {
    let mut problem = FieldProblem::new(Arc::new(Cubic), -0.2, p_lens());
    let (branch, _, _) = continuation(
        &mut problem,
        &DVector::zeros(1),
        &cubic_settings(),
        &DenseLinearSolver,
        options,
    )
    .unwrap();
    branch
}

fn hopf_branch(q: f64) -> Branch<f64> {
    let settings = ContinuationPar::default()
        .with_ds(0.01)
        .with_step_bounds(1e-4, 0.05)
        .with_param_bounds(-0.5, 0.3);
    let mut problem = FieldProblem::new(Arc::new(Landau { q }), -0.2, p_lens());
    let (branch, _, _) = continuation(
        &mut problem,
        &DVector::zeros(2),
        &settings,
        &DenseLinearSolver,
        ContinuationOptions::default(),
    )
    .unwrap();
    branch
}

fn orbit_settings() -> ContinuationPar {
    ContinuationPar::default()
        .with_ds(0.01)
        .with_step_bounds(1e-4, 0.04)
        .with_param_bounds(0.0, 0.3)
        .with_max_steps(5)
        .with_detect_bifurcation(ContinuationPar::COMPUTE_EIGENVALUES)
}

#[test]
fn cubic_map_has_two_simple_branch_points() {
    let branch = cubic_branch(ContinuationOptions::default());
    assert_eq!(branch.stop_reason, StopReason::ParameterBounds);
    assert!(branch.folds.is_empty());
    assert_eq!(branch.bifurcations.len(), 2, "{branch}");

    let expected = [0.0, 0.15];
    for (cp, p) in branch.bifurcations.iter().zip(expected) {
        assert_eq!(cp.kind, CriticalKind::BranchPoint);
        assert_eq!(cp.delta, KernelDimension::new(1, 0));
        assert_eq!(cp.status, CriticalStatus::Converged);
        assert_abs_diff_eq!(cp.param, p, epsilon = 1e-4);
        assert!(cp.interval.0 <= cp.param && cp.param <= cp.interval.1);
    }
}

#[test]
fn detected_kernel_matches_change_in_unstable_count() {
    let branch = cubic_branch(ContinuationOptions::default());
    assert_eq!(branch.branch.len(), branch.eig.len());
    for cp in &branch.bifurcations {
        let after = branch.branch[cp.step].n_unstable.unwrap();
        let before = branch.branch[cp.step - 1].n_unstable.unwrap();
        assert_eq!(cp.delta.unstable_change(), before.abs_diff(after));
    }
    for record in &branch.branch {
        assert_eq!(record.stable(), record.n_unstable.map(|n| n == 0));
    }
}

#[test]
fn step_sizes_stay_within_bounds() {
    let branch = cubic_branch(ContinuationOptions::default());
    let settings = cubic_settings();
    for ds in branch.column("ds").unwrap() {
        assert!(ds.abs() >= settings.dsmin && ds.abs() <= settings.dsmax, "ds = {ds}");
    }
    let params = branch.column("param").unwrap();
    assert!(params.windows(2).all(|w| w[1] > w[0]));
}

#[test]
fn rerun_reproduces_parameter_sequence() {
    let first = cubic_branch(ContinuationOptions::default()).column("param").unwrap();
    let second = cubic_branch(ContinuationOptions::default()).column("param").unwrap();
    assert_eq!(first.len(), second.len());
    for (a, b) in first.iter().zip(&second) {
        assert_abs_diff_eq!(*a, *b, epsilon = 1e-12);
    }
}

#[test]
fn both_sides_runs_two_segments() {
    let branch = cubic_branch(ContinuationOptions {
        both_sides: true,
        ..ContinuationOptions::default()
    });
    let segments = branch.segments();
    assert_eq!(segments.len(), 2);
    assert_eq!(segments[0].bifurcations.len(), 2);
    let backward = segments[1].column("param").unwrap();
    assert!(backward.windows(2).all(|w| w[1] < w[0]));
    assert!(segments[1].bifurcations.is_empty());
    assert_eq!(segments[1].stop_reason, StopReason::ParameterBounds);
}

#[test]
fn negative_step_walks_through_fold() {
    // p = u², started at u = -1 and heading for smaller p.
    let mut problem = EquilibriumProblem::new(
        1,
        1.0,
        p_lens(),
        |x, p| DVector::from_element(1, *p - x[0] * x[0]),
        |x, _| DMatrix::from_element(1, 1, -2.0 * x[0]),
    );
    let settings = ContinuationPar::default()
        .with_ds(-0.02)
        .with_step_bounds(1e-4, 0.05)
        .with_param_bounds(-0.5, 1.5)
        .with_max_steps(400);
    let (branch, x, _) = continuation(
        &mut problem,
        &DVector::from_element(1, -1.0),
        &settings,
        &DenseLinearSolver,
        ContinuationOptions::default(),
    )
    .unwrap();
    assert_eq!(branch.stop_reason, StopReason::ParameterBounds);
    assert!(x[0] > 1.0);

    assert_eq!(branch.folds.len(), 1, "{branch}");
    let fold = &branch.folds[0];
    assert_eq!(fold.kind, CriticalKind::Fold);
    assert_eq!(fold.delta, KernelDimension::new(1, 0));
    assert!(fold.interval.0 >= 0.0 && fold.interval.0 <= fold.param && fold.param <= fold.interval.1);
    assert!(fold.interval.1 < 0.01, "fold interval {:?}", fold.interval);
    assert!(fold.x[0] > 0.0 && fold.x[0] < 0.08);
    // The stability change at the fold is not reported again as a branch point.
    assert!(branch.bifurcations.is_empty());

    let params = branch.column("param").unwrap();
    let turn = fold.step;
    assert!(params[..turn].windows(2).all(|w| w[1] < w[0]));
    assert!(params[turn..].windows(2).all(|w| w[1] > w[0]));
}

/// `F(x, p) = x - p`, undefined from `p = 0.1` on; `calls` counts jacobians.
fn line_problem(calls: Rc<Cell<usize>>) -> EquilibriumProblem<f64> {
    EquilibriumProblem::new(
        1,
        -0.2,
        p_lens(),
        |x, p| DVector::from_element(1, if *p >= 0.1 { f64::NAN } else { x[0] - *p }),
        move |_, _| {
            calls.set(calls.get() + 1);
            DMatrix::identity(1, 1)
        },
    )
}

#[test]
fn one_jacobian_per_recorded_point() {
    let calls = Rc::new(Cell::new(0usize));
    let mut problem = line_problem(Rc::clone(&calls));
    let settings = ContinuationPar::default().with_max_steps(5);
    let (branch, _, _) = continuation(
        &mut problem,
        &DVector::from_element(1, -0.2),
        &settings,
        &DenseLinearSolver,
        ContinuationOptions::default(),
    )
    .unwrap();
    assert_eq!(branch.stop_reason, StopReason::MaxSteps);
    assert_eq!(branch.len(), 6);
    assert!(branch.branch.iter().all(|r| r.newton_iterations == 0 && r.n_unstable == Some(1)));
    assert_eq!(calls.get(), branch.len());
}

#[test]
fn failing_corrector_stalls_and_keeps_branch() {
    let mut problem = line_problem(Rc::new(Cell::new(0)));
    let settings = cubic_settings();
    let (branch, x, _) = continuation(
        &mut problem,
        &DVector::from_element(1, -0.2),
        &settings,
        &DenseLinearSolver,
        ContinuationOptions::default(),
    )
    .unwrap();
    assert_eq!(branch.stop_reason, StopReason::Stalled);
    let params = branch.column("param").unwrap();
    let last = params[params.len() - 1];
    assert!(last < 0.1 && last > 0.099, "last p = {last}");
    assert_abs_diff_eq!(x[0], last, epsilon = 1e-12);
    for ds in branch.column("ds").unwrap() {
        assert!(ds.abs() >= settings.dsmin && ds.abs() <= settings.dsmax, "ds = {ds}");
    }
}

#[test]
fn finalise_step_can_stop_the_run() {
    let calls = Rc::new(Cell::new(0usize));
    let seen = Rc::clone(&calls);
    let branch = cubic_branch(ContinuationOptions {
        finalise_step: Some(Box::new(move |x: &DVector<f64>, tangent: &Tangent, step: usize, partial: &ContResult<f64>| {
            seen.set(seen.get() + 1);
            assert_eq!(x.len(), 1);
            assert!(tangent.p > 0.0);
            assert_eq!(partial.len(), step + 1);
            step < 3
        })),
        ..ContinuationOptions::default()
    });
    assert_eq!(branch.stop_reason, StopReason::Callback);
    assert_eq!(branch.len(), 4);
    assert_eq!(calls.get(), 3);
}

#[test]
fn symmetric_system_has_non_simple_point() {
    let mut problem = d6_problem();
    let settings = ContinuationPar::default()
        .with_ds(0.01)
        .with_step_bounds(1e-4, 0.05)
        .with_param_bounds(-0.25, 0.4);
    let (branch, _, _) = continuation(
        &mut problem,
        &DVector::zeros(3),
        &settings,
        &DenseLinearSolver,
        ContinuationOptions::default(),
    )
    .unwrap();
    let cp = branch
        .bifurcations
        .iter()
        .find(|cp| !cp.delta.is_simple())
        .expect("a non-simple critical point");
    assert_eq!(cp.kind, CriticalKind::Other);
    assert_eq!(cp.delta, KernelDimension::new(3, 0));
    assert_abs_diff_eq!(cp.param, 0.0, epsilon = 1e-4);
    assert_eq!(cp.ind_ev, 2);
    assert!(format!("{branch}").contains("δ = (3, 0)"));
}

#[test]
fn stuart_landau_equilibrium_loses_stability_at_hopf() {
    let branch = hopf_branch(0.0);
    assert_eq!(branch.bifurcations.len(), 1);
    let cp = &branch.bifurcations[0];
    assert_eq!(cp.kind, CriticalKind::Hopf);
    assert_eq!(cp.delta, KernelDimension::new(0, 1));
    assert_abs_diff_eq!(cp.param, 0.0, epsilon = 1e-4);

    let eigenvalues = branch.eigenvals_at_critical_point(0).unwrap();
    assert!(eigenvalues.iter().all(|l| l.re > 0.0));
    assert_abs_diff_eq!(eigenvalues[0].im.abs(), 1.0, epsilon = 1e-10);
}

#[test]
fn orbit_guess_starts_at_leading_order_correction() {
    let branch = hopf_branch(0.0);
    let cp = &branch.bifurcations[0];
    let nf = hopf_normal_form(&Landau { q: 0.0 }, &branch.params, branch.lens, cp, None, None, 1e-8).unwrap();
    let ds = 0.01;
    let predictor = nf.predictor(ds, 1.0).unwrap();
    let guess = orbit_guess(&predictor, 8);

    assert_eq!(guess.states.len(), 8);
    assert_abs_diff_eq!(guess.period, 2.0 * PI, epsilon = 1e-4);
    // Phase 0 of the sample is x0 + 2 r Re(ζ e^{-iϕ}).
    let correction = &guess.states[0] - &nf.x0;
    assert_abs_diff_eq!(correction.norm(), ds.sqrt(), epsilon = 1e-4);
    let expected = predictor.orbit(-predictor.phase());
    assert!((&guess.states[0] - expected).amax() < 1e-12);
}

#[test]
fn hopf_switch_continues_emanating_orbits() {
    let branch = hopf_branch(0.0);
    let kind = PeriodicOrbitKind::Shooting { m: 4, steps: 40 };
    let (orbits, _, _) = continue_from_hopf(
        Arc::new(Landau { q: 0.0 }),
        &branch,
        0,
        &orbit_settings(),
        kind,
        HopfSwitchOptions::default(),
    )
    .unwrap();

    assert_eq!(orbits.kind, BranchKind::PeriodicOrbit);
    let functional = orbits
        .functional_as::<PeriodicOrbitProblem<Landau>>()
        .expect("orbit functional");
    assert_eq!(functional.kind(), kind);
    assert_eq!(functional.field().q, 0.0);
    let origin = orbits.origin().expect("origin is the Hopf point");
    assert!(Arc::ptr_eq(&origin, &branch.bifurcations[0]));
    assert!(orbits.len() > 1);

    let params = orbits.column("param").unwrap();
    let amplitudes = orbits.column("amplitude").unwrap();
    let periods = orbits.column("period").unwrap();
    for ((p, a), period) in params.iter().zip(&amplitudes).zip(&periods) {
        assert!(*p > 0.0);
        // Four samples span between √2 and 2 radii of the circle.
        let r = p.sqrt();
        assert!(*a > 1.3 * r && *a < 2.05 * r, "p = {p}, amplitude = {a}");
        assert_abs_diff_eq!(*period, 2.0 * PI, epsilon = 1e-3);
    }
    assert!(orbits.branch.iter().all(|r| r.stable() == Some(true)));
}

#[test]
fn deflated_switch_avoids_collapsed_orbit() {
    let branch = hopf_branch(0.0);
    let options = HopfSwitchOptions {
        use_deflation: true,
        ds: Some(0.02),
        nev: Some(1),
        ..HopfSwitchOptions::default()
    };
    let settings = orbit_settings().with_save_sol_every_step(1);
    let (orbits, x, _) = continue_from_hopf(
        Arc::new(Landau { q: 0.0 }),
        &branch,
        0,
        &settings,
        PeriodicOrbitKind::Shooting { m: 2, steps: 60 },
        options,
    )
    .unwrap();
    assert_eq!(orbits.settings.nev, 1);
    assert!(orbits.eig.iter().all(|e| e.eigenvalues.len() == 1));
    assert_eq!(orbits.solutions.len(), orbits.len());
    // The first shooting node stays on the circle of radius sqrt(p).
    for sample in &orbits.solutions {
        assert_abs_diff_eq!(sample.x.rows(0, 2).norm(), sample.p.sqrt(), epsilon = 1e-3);
    }
    assert!(x.rows(0, 2).norm() > 0.1);
}

#[test]
fn switching_needs_a_hopf_point() {
    let branch = cubic_branch(ContinuationOptions::default());
    let err = continue_from_hopf(
        Arc::new(Cubic),
        &branch,
        0,
        &orbit_settings(),
        PeriodicOrbitKind::Shooting { m: 4, steps: 40 },
        HopfSwitchOptions::default(),
    )
    .err()
    .expect("the first point is a branch point");
    assert_eq!(
        err.downcast_ref::<ContinuationError>(),
        Some(&ContinuationError::KindMismatch {
            expected: CriticalKind::Hopf,
            found: CriticalKind::BranchPoint
        })
    );

    let err = continue_from_hopf(
        Arc::new(Cubic),
        &branch,
        7,
        &orbit_settings(),
        PeriodicOrbitKind::Shooting { m: 4, steps: 40 },
        HopfSwitchOptions::default(),
    )
    .err()
    .expect("there are only two points");
    assert_eq!(
        err.downcast_ref::<ContinuationError>(),
        Some(&ContinuationError::OutOfRange { index: 7, len: 2 })
    );
}
