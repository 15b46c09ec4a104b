//! Core types for continuation analysis.
//!
//! This module contains the settings and the per-step records shared by the
//! stepper, the bifurcation detector and the branch results.

use nalgebra::{DMatrix, DVector};
use num_complex::Complex;
use serde::{Deserialize, Serialize};

use crate::error::ContinuationError;
use crate::newton::NewtonPar;

/// Settings controlling pseudo-arclength continuation and bifurcation detection.
///
/// This is a plain value: derived settings are built with the `with_*`
/// methods, which return a modified copy.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct ContinuationPar {
    /// Initial arclength step; its sign picks the direction.
    pub ds: f64,
    pub dsmin: f64,
    pub dsmax: f64,
    pub p_min: f64,
    pub p_max: f64,
    pub max_steps: usize,
    /// Weight of the state part in the arclength dot product.
    pub theta: f64,
    /// Step adaptation aggressiveness: `ds` grows/shrinks by `1 + a`.
    pub a: f64,
    /// Halvings of `ds` tried after a failed correction before stalling.
    pub max_corrector_retries: usize,
    pub newton: NewtonPar,
    /// 0: off, 1: eigenvalues only, 2: detection, 3: detection + bisection.
    pub detect_bifurcation: u8,
    /// Record folds from sign changes of the parameter component of the tangent.
    pub detect_fold: bool,
    /// Number of eigenvalues to track (0 = all).
    pub nev: usize,
    /// Spectral inversions required before a bisection is declared converged.
    pub n_inversion: usize,
    pub tol_bisection_eigenvalue: f64,
    pub dsmin_bisection: f64,
    pub max_bisection_steps: usize,
    /// Real parts above this count as unstable.
    pub tol_stability: f64,
    /// Store the full solution every that many steps (0 = never).
    pub save_sol_every_step: usize,
    pub save_eigenvectors: bool,
}

impl Default for ContinuationPar {
    fn default() -> Self {
        Self {
            ds: 0.01,
            dsmin: 1e-4,
            dsmax: 0.1,
            p_min: -1.0,
            p_max: 1.0,
            max_steps: 100,
            theta: 0.5,
            a: 0.5,
            max_corrector_retries: 10,
            newton: NewtonPar::default(),
            detect_bifurcation: 3,
            detect_fold: true,
            nev: 0,
            n_inversion: 2,
            tol_bisection_eigenvalue: 1e-6,
            dsmin_bisection: 1e-10,
            max_bisection_steps: 30,
            tol_stability: 1e-10,
            save_sol_every_step: 0,
            save_eigenvectors: false,
        }
    }
}

impl ContinuationPar {
    /// Detection level at which eigenvalues are computed at all.
    pub const COMPUTE_EIGENVALUES: u8 = 1;
    /// Detection level at which spectral changes are flagged.
    pub const DETECT: u8 = 2;
    /// Detection level at which flagged points are located by bisection.
    pub const BISECT: u8 = 3;

    pub fn validate(&self) -> Result<(), ContinuationError> {
        let bad = |msg: String| Err(ContinuationError::InvalidConfig(msg));
        if !(self.dsmin > 0.0) {
            return bad(format!("dsmin must be positive (got {})", self.dsmin));
        }
        if self.dsmin > self.dsmax {
            return bad(format!("dsmin {} exceeds dsmax {}", self.dsmin, self.dsmax));
        }
        if self.ds.abs() < self.dsmin || self.ds.abs() > self.dsmax {
            return bad(format!(
                "|ds| = {} must lie in [dsmin, dsmax] = [{}, {}]",
                self.ds.abs(),
                self.dsmin,
                self.dsmax
            ));
        }
        if self.p_min >= self.p_max {
            return bad(format!("p_min {} must be below p_max {}", self.p_min, self.p_max));
        }
        if !(0.0..=1.0).contains(&self.theta) {
            return bad(format!("theta must lie in [0, 1] (got {})", self.theta));
        }
        if self.a < 0.0 {
            return bad(format!("a must be non-negative (got {})", self.a));
        }
        if self.newton.max_iterations == 0 {
            return bad("newton.max_iterations must be positive".into());
        }
        if self.detect_bifurcation > Self::BISECT {
            return bad(format!(
                "detect_bifurcation must be at most {} (got {})",
                Self::BISECT,
                self.detect_bifurcation
            ));
        }
        if self.tol_bisection_eigenvalue <= 0.0 {
            return bad("tol_bisection_eigenvalue must be positive".into());
        }
        Ok(())
    }

    pub fn computes_eigenvalues(&self) -> bool {
        self.detect_bifurcation >= Self::COMPUTE_EIGENVALUES
    }

    pub fn with_ds(self, ds: f64) -> Self {
        Self { ds, ..self }
    }

    pub fn with_step_bounds(self, dsmin: f64, dsmax: f64) -> Self {
        Self { dsmin, dsmax, ..self }
    }

    pub fn with_param_bounds(self, p_min: f64, p_max: f64) -> Self {
        Self { p_min, p_max, ..self }
    }

    pub fn with_max_steps(self, max_steps: usize) -> Self {
        Self { max_steps, ..self }
    }

    pub fn with_newton(self, newton: NewtonPar) -> Self {
        Self { newton, ..self }
    }

    pub fn with_detect_bifurcation(self, detect_bifurcation: u8) -> Self {
        Self {
            detect_bifurcation,
            ..self
        }
    }

    pub fn with_detect_fold(self, detect_fold: bool) -> Self {
        Self { detect_fold, ..self }
    }

    pub fn with_nev(self, nev: usize) -> Self {
        Self { nev, ..self }
    }

    pub fn with_bisection(self, n_inversion: usize, tol: f64, max_steps: usize) -> Self {
        Self {
            n_inversion,
            tol_bisection_eigenvalue: tol,
            max_bisection_steps: max_steps,
            ..self
        }
    }

    pub fn with_save_sol_every_step(self, save_sol_every_step: usize) -> Self {
        Self {
            save_sol_every_step,
            ..self
        }
    }

    pub fn with_save_eigenvectors(self, save_eigenvectors: bool) -> Self {
        Self {
            save_eigenvectors,
            ..self
        }
    }
}

/// What kind of object the branch is made of.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum BranchKind {
    Equilibrium,
    PeriodicOrbit,
    Other,
}

impl Default for BranchKind {
    fn default() -> Self {
        BranchKind::Equilibrium
    }
}

/// Classification of a critical point.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum CriticalKind {
    Fold,
    BranchPoint,
    Hopf,
    /// Spectral change that fits neither simple pattern.
    Other,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum CriticalStatus {
    Guess,
    Converged,
    FailedToConverge,
}

/// Number of crossing eigenvalues: real ones and complex-conjugate pairs.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct KernelDimension {
    pub real: usize,
    pub complex_pairs: usize,
}

impl KernelDimension {
    pub fn new(real: usize, complex_pairs: usize) -> Self {
        Self { real, complex_pairs }
    }

    /// Change in the unstable count this kernel accounts for.
    pub fn unstable_change(&self) -> usize {
        self.real + 2 * self.complex_pairs
    }

    /// Number of critical modes; a conjugate pair counts once.
    pub fn dimension(&self) -> usize {
        self.real + self.complex_pairs
    }

    pub fn is_simple(&self) -> bool {
        self.dimension() == 1
    }
}

/// Tangent to the branch in `(x, p)` space.
#[derive(Debug, Clone, PartialEq)]
pub struct Tangent {
    pub x: DVector<f64>,
    pub p: f64,
}

/// Diagnostics of one accepted continuation step. Stored column-wise by
/// [`ContResult`](super::results::ContResult); the projection values line up
/// with `ContResult::projection_names`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepRecord {
    pub projection: Vec<f64>,
    pub param: f64,
    pub newton_iterations: usize,
    /// Cumulative over the whole branch.
    pub linear_iterations: usize,
    pub ds: f64,
    /// Angle (radians) between this step's tangent and the previous one.
    pub theta: f64,
    /// `None` when eigenvalues are not computed.
    pub n_unstable: Option<usize>,
    pub n_imag: Option<usize>,
    pub step: usize,
}

impl StepRecord {
    /// Stability is derived from `n_unstable`, never stored separately.
    pub fn stable(&self) -> Option<bool> {
        self.n_unstable.map(|n| n == 0)
    }
}

/// Eigen-elements at one step.
#[derive(Debug, Clone, PartialEq)]
pub struct EigenRecord {
    pub eigenvalues: Vec<Complex<f64>>,
    /// Present only when `save_eigenvectors` is set.
    pub eigenvectors: Option<DMatrix<Complex<f64>>>,
    pub step: usize,
}

/// Counts of unstable eigenvalues, and of those with a nonzero imaginary part.
pub fn spectral_counts(eigenvalues: &[Complex<f64>], tol_stability: f64) -> (usize, usize) {
    let imag_tol = 1e-10;
    eigenvalues
        .iter()
        .filter(|ev| ev.re > tol_stability)
        .fold((0, 0), |(n_unstable, n_imag), ev| {
            let imag = usize::from(ev.im.abs() > imag_tol);
            (n_unstable + 1, n_imag + imag)
        })
}

/// A fold or bifurcation point found along a branch.
#[derive(Debug, Clone, PartialEq)]
pub struct CriticalPoint {
    pub kind: CriticalKind,
    /// Index into the branch array of the first step past the crossing.
    pub index: usize,
    pub param: f64,
    pub norm: f64,
    pub projection: Vec<f64>,
    pub x: DVector<f64>,
    pub tangent: Tangent,
    /// Index of the crossing eigenvalue within the eigen record at `step`.
    pub ind_ev: usize,
    pub step: usize,
    pub status: CriticalStatus,
    pub delta: KernelDimension,
    /// Final bracket width of the bisection, -1 when unrefined.
    pub precision: f64,
    pub interval: (f64, f64),
}

/// Why the stepper stopped.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum StopReason {
    /// Still running (only visible to callbacks).
    Running,
    ParameterBounds,
    MaxSteps,
    /// Corrector kept failing down to `dsmin`.
    Stalled,
    /// A callback asked to stop.
    Callback,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_settings_validate() {
        assert!(ContinuationPar::default().validate().is_ok());
    }

    #[test]
    fn validate_rejects_step_outside_bounds() {
        let settings = ContinuationPar::default().with_ds(1.0);
        let err = settings.validate().expect_err("ds above dsmax");
        assert!(matches!(err, ContinuationError::InvalidConfig(_)));
        assert!(format!("{err}").contains("dsmin, dsmax"));
    }

    #[test]
    fn builders_copy_without_mutating() {
        let base = ContinuationPar::default();
        let derived = base.with_max_steps(7).with_save_eigenvectors(true);
        assert_eq!(base.max_steps, 100);
        assert!(!base.save_eigenvectors);
        assert_eq!(derived.max_steps, 7);
        assert!(derived.save_eigenvectors);
    }

    #[test]
    fn spectral_counts_track_complex_pairs() {
        let values = vec![
            Complex::new(0.3, 1.0),
            Complex::new(0.3, -1.0),
            Complex::new(0.1, 0.0),
            Complex::new(-2.0, 0.0),
        ];
        assert_eq!(spectral_counts(&values, 1e-10), (3, 2));
    }

    #[test]
    fn stability_is_derived_from_unstable_count() {
        let mut record = StepRecord {
            projection: vec![],
            param: 0.0,
            newton_iterations: 0,
            linear_iterations: 0,
            ds: 0.1,
            theta: 0.0,
            n_unstable: Some(0),
            n_imag: Some(0),
            step: 0,
        };
        assert_eq!(record.stable(), Some(true));
        record.n_unstable = Some(2);
        assert_eq!(record.stable(), Some(false));
        record.n_unstable = None;
        assert_eq!(record.stable(), None);
    }

    #[test]
    fn kernel_dimension_counts_pairs_twice() {
        assert_eq!(KernelDimension::new(1, 1).unstable_change(), 3);
        assert!(KernelDimension::new(0, 1).is_simple());
        assert!(!KernelDimension::new(2, 0).is_simple());
    }
}
