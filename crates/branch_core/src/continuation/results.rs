//! Branch results: per-step records, eigen records and critical points.

use anyhow::{bail, Result};
use nalgebra::{DMatrix, DVector};
use num_complex::Complex;
use std::any::Any;
use std::fmt;
use std::ops::Deref;
use std::sync::{Arc, Weak};

use super::problem::ParamLens;
use super::types::{
    BranchKind, ContinuationPar, CriticalKind, CriticalPoint, CriticalStatus, EigenRecord,
    StepRecord, StopReason,
};
use crate::error::ContinuationError;

/// Full solution stored every `save_sol_every_step` steps.
#[derive(Debug, Clone, PartialEq)]
pub struct SolutionSample {
    pub x: DVector<f64>,
    pub p: f64,
    pub step: usize,
}

/// Everything recorded along one continuation run.
///
/// `branch` and `eig` always have the same length and are indexed by step.
/// The stepper is the only writer; once it returns the result is read-only.
pub struct ContResult<P> {
    pub branch: Vec<StepRecord>,
    pub eig: Vec<EigenRecord>,
    pub bifurcations: Vec<Arc<CriticalPoint>>,
    pub folds: Vec<Arc<CriticalPoint>>,
    pub solutions: Vec<SolutionSample>,
    pub settings: ContinuationPar,
    pub kind: BranchKind,
    pub functional: Option<Arc<dyn Any + Send + Sync>>,
    pub params: P,
    pub lens: ParamLens<P>,
    /// Names of the entries of `StepRecord::projection`.
    pub projection_names: Vec<String>,
    pub stop_reason: StopReason,
}

/// One step of a branch together with its eigen-elements.
#[derive(Debug, Clone, Copy)]
pub struct StepView<'a> {
    pub record: &'a StepRecord,
    pub eigenvalues: &'a [Complex<f64>],
    pub eigenvectors: Option<&'a DMatrix<Complex<f64>>>,
}

impl<'a> Deref for StepView<'a> {
    type Target = StepRecord;

    fn deref(&self) -> &StepRecord {
        self.record
    }
}

const FIXED_COLUMNS: &[&str] = &[
    "param",
    "newton_iterations",
    "linear_iterations",
    "ds",
    "theta",
    "n_unstable",
    "n_imag",
    "stable",
    "step",
];

impl<P: Clone> ContResult<P> {
    pub fn new(
        settings: ContinuationPar,
        kind: BranchKind,
        params: P,
        lens: ParamLens<P>,
        projection_names: Vec<String>,
    ) -> Self {
        Self {
            branch: Vec::new(),
            eig: Vec::new(),
            bifurcations: Vec::new(),
            folds: Vec::new(),
            solutions: Vec::new(),
            settings,
            kind,
            functional: None,
            params,
            lens,
            projection_names,
            stop_reason: StopReason::Running,
        }
    }

    pub(crate) fn push_step(&mut self, record: StepRecord, eig: EigenRecord) {
        debug_assert_eq!(record.step, eig.step);
        debug_assert!(self.branch.last().map_or(true, |last| last.step < record.step));
        self.branch.push(record);
        self.eig.push(eig);
    }

    pub fn len(&self) -> usize {
        self.branch.len()
    }

    pub fn is_empty(&self) -> bool {
        self.branch.is_empty()
    }

    fn check_step(&self, step: usize) -> Result<()> {
        if step >= self.branch.len() {
            return Err(ContinuationError::OutOfRange {
                index: step,
                len: self.branch.len(),
            }
            .into());
        }
        Ok(())
    }

    pub fn point(&self, step: usize) -> Result<StepView<'_>> {
        self.check_step(step)?;
        let eig = &self.eig[step];
        Ok(StepView {
            record: &self.branch[step],
            eigenvalues: &eig.eigenvalues,
            eigenvectors: eig.eigenvectors.as_ref(),
        })
    }

    pub fn eigenvals_at(&self, step: usize) -> Result<&[Complex<f64>]> {
        self.check_step(step)?;
        Ok(&self.eig[step].eigenvalues)
    }

    /// Eigenvalues at the step where bifurcation point `i` was recorded.
    ///
    /// The critical point is assumed to belong to this result.
    pub fn eigenvals_at_critical_point(&self, i: usize) -> Result<&[Complex<f64>]> {
        let cp = self
            .bifurcations
            .get(i)
            .ok_or(ContinuationError::OutOfRange {
                index: i,
                len: self.bifurcations.len(),
            })?;
        self.eigenvals_at(cp.step)
    }

    pub fn eigenvector_at(&self, step: usize, k: usize) -> Result<DVector<Complex<f64>>> {
        self.check_step(step)?;
        let vectors = self.eig[step]
            .eigenvectors
            .as_ref()
            .ok_or(ContinuationError::EigenvectorsNotSaved(step))?;
        if k >= vectors.ncols() {
            return Err(ContinuationError::OutOfRange {
                index: k,
                len: vectors.ncols(),
            }
            .into());
        }
        Ok(vectors.column(k).into_owned())
    }

    /// Column of the step records by name: one of the fixed diagnostics or a
    /// projection name. Missing eigen counts read as NaN.
    pub fn column(&self, name: &str) -> Option<Vec<f64>> {
        let count = |v: Option<usize>| v.map_or(f64::NAN, |n| n as f64);
        let extract: Box<dyn Fn(&StepRecord) -> f64> = match name {
            "param" => Box::new(|r| r.param),
            "newton_iterations" => Box::new(|r| r.newton_iterations as f64),
            "linear_iterations" => Box::new(|r| r.linear_iterations as f64),
            "ds" => Box::new(|r| r.ds),
            "theta" => Box::new(|r| r.theta),
            "n_unstable" => Box::new(move |r| count(r.n_unstable)),
            "n_imag" => Box::new(move |r| count(r.n_imag)),
            "stable" => Box::new(|r| r.stable().map_or(f64::NAN, |s| f64::from(u8::from(s)))),
            "step" => Box::new(|r| r.step as f64),
            other => {
                let idx = self.projection_names.iter().position(|n| n == other)?;
                Box::new(move |r| r.projection[idx])
            }
        };
        Some(self.branch.iter().map(|r| extract(r)).collect())
    }

    pub fn column_names(&self) -> Vec<String> {
        FIXED_COLUMNS
            .iter()
            .map(|s| s.to_string())
            .chain(self.projection_names.iter().cloned())
            .collect()
    }

    pub fn param_range(&self) -> Option<(f64, f64)> {
        self.branch.iter().map(|r| r.param).fold(None, |acc, p| {
            Some(match acc {
                None => (p, p),
                Some((lo, hi)) => (lo.min(p), hi.max(p)),
            })
        })
    }

    /// The functional that produced this branch, if it is a `T`.
    pub fn functional_as<T: Any + Send + Sync>(&self) -> Option<&T> {
        self.functional.as_deref()?.downcast_ref::<T>()
    }

    /// Parameter object with the lensed field set to the value at `step`.
    pub fn params_at(&self, step: usize) -> Result<P> {
        self.check_step(step)?;
        Ok(self.lens.with(&self.params, self.branch[step].param))
    }

    pub fn critical_points(&self) -> impl Iterator<Item = &Arc<CriticalPoint>> {
        self.bifurcations.iter().chain(self.folds.iter())
    }
}

fn kind_label(kind: CriticalKind) -> &'static str {
    match kind {
        CriticalKind::Fold => "fold",
        CriticalKind::BranchPoint => "bp",
        CriticalKind::Hopf => "hopf",
        CriticalKind::Other => "nd",
    }
}

fn status_label(status: CriticalStatus) -> &'static str {
    match status {
        CriticalStatus::Guess => "guess",
        CriticalStatus::Converged => "converged",
        CriticalStatus::FailedToConverge => "failed",
    }
}

impl<P: Clone> fmt::Display for ContResult<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Branch of {:?} with {} steps ({:?})",
            self.kind,
            self.len(),
            self.stop_reason
        )?;
        if let Some((lo, hi)) = self.param_range() {
            writeln!(f, "  parameter {} from {lo:.6} to {hi:.6}", self.lens.name)?;
        }
        let points: Vec<_> = self.critical_points().collect();
        if points.is_empty() {
            return Ok(());
        }
        writeln!(f, "  special points:")?;
        for (i, cp) in points.iter().enumerate() {
            writeln!(
                f,
                "  #{:>3} {:>5} at {} ≈ {:+.8} step {:>4}, ind_ev {:>2}, [{}], δ = ({}, {})",
                i + 1,
                kind_label(cp.kind),
                self.lens.name,
                cp.param,
                cp.step,
                cp.ind_ev,
                status_label(cp.status),
                cp.delta.real,
                cp.delta.complex_pairs
            )?;
        }
        Ok(())
    }
}

/// A branch: one or more continuation results plus the critical point it
/// was switched from (none for a root branch). Derefs to the first segment.
pub struct Branch<P> {
    segments: Vec<ContResult<P>>,
    origin: Weak<CriticalPoint>,
}

impl<P: Clone> Branch<P> {
    pub fn new(result: ContResult<P>) -> Self {
        Self {
            segments: vec![result],
            origin: Weak::new(),
        }
    }

    pub fn from_segments(segments: Vec<ContResult<P>>) -> Result<Self> {
        if segments.is_empty() {
            bail!("A branch needs at least one segment");
        }
        Ok(Self {
            segments,
            origin: Weak::new(),
        })
    }

    pub fn with_origin(mut self, origin: &Arc<CriticalPoint>) -> Self {
        self.origin = Arc::downgrade(origin);
        self
    }

    /// The critical point this branch emanates from, while it is alive.
    pub fn origin(&self) -> Option<Arc<CriticalPoint>> {
        self.origin.upgrade()
    }

    pub fn segments(&self) -> &[ContResult<P>] {
        &self.segments
    }

    pub fn into_segments(self) -> Vec<ContResult<P>> {
        self.segments
    }
}

impl<P> Deref for Branch<P> {
    type Target = ContResult<P>;

    fn deref(&self) -> &ContResult<P> {
        &self.segments[0]
    }
}

impl<P: Clone> fmt::Display for Branch<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, segment) in self.segments.iter().enumerate() {
            if self.segments.len() > 1 {
                writeln!(f, "segment {}:", i + 1)?;
            }
            write!(f, "{segment}")?;
        }
        Ok(())
    }
}
