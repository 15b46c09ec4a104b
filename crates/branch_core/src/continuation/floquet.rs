//! Jacobian/monodromy split for periodic orbits.
//!
//! A periodic-orbit problem hands the stepper a [`Jacobian::Floquet`]: the
//! Newton jacobian of the shooting functional together with the monodromy
//! operator of the orbit. [`FloquetLinearSolver`] unwraps the former for the
//! corrector; [`FloquetEigenSolver`] reads the latter for stability.

use anyhow::{anyhow, Result};
use nalgebra::{DMatrix, DVector};
use num_complex::Complex;
use std::cell::OnceCell;

use crate::linalg::{EigenOutcome, EigenSolver, Jacobian, LinearSolver};

type MonodromyFn = Box<dyn Fn() -> Result<DMatrix<f64>>>;

/// Newton jacobian of a periodic-orbit functional at `(x, p)`, bundled with
/// the monodromy of the orbit it represents.
pub struct FloquetWrapper {
    jacobian: Jacobian,
    x: DVector<f64>,
    p: f64,
    monodromy: OnceCell<DMatrix<f64>>,
    compute: Option<MonodromyFn>,
    /// Whether the spectrum contains the multiplier 1 of the time shift.
    trivial_multiplier: bool,
}

impl FloquetWrapper {
    /// The monodromy is built on first use and cached.
    pub fn deferred<F>(
        jacobian: Jacobian,
        x: DVector<f64>,
        p: f64,
        trivial_multiplier: bool,
        monodromy: F,
    ) -> Self
    where
        F: Fn() -> Result<DMatrix<f64>> + 'static,
    {
        Self {
            jacobian,
            x,
            p,
            monodromy: OnceCell::new(),
            compute: Some(Box::new(monodromy)),
            trivial_multiplier,
        }
    }

    pub fn ready(
        jacobian: Jacobian,
        x: DVector<f64>,
        p: f64,
        trivial_multiplier: bool,
        monodromy: DMatrix<f64>,
    ) -> Self {
        Self {
            jacobian,
            x,
            p,
            monodromy: OnceCell::from(monodromy),
            compute: None,
            trivial_multiplier,
        }
    }

    pub fn jacobian(&self) -> &Jacobian {
        &self.jacobian
    }

    pub fn state(&self) -> &DVector<f64> {
        &self.x
    }

    pub fn parameter(&self) -> f64 {
        self.p
    }

    pub fn has_trivial_multiplier(&self) -> bool {
        self.trivial_multiplier
    }

    pub fn monodromy(&self) -> Result<&DMatrix<f64>> {
        if let Some(m) = self.monodromy.get() {
            return Ok(m);
        }
        let compute = self
            .compute
            .as_ref()
            .ok_or_else(|| anyhow!("no monodromy available"))?;
        let m = compute()?;
        Ok(self.monodromy.get_or_init(|| m))
    }
}

/// Linear solver that sees through [`Jacobian::Floquet`].
#[derive(Debug, Clone, Copy, Default)]
pub struct FloquetLinearSolver<L> {
    pub inner: L,
}

impl<L> FloquetLinearSolver<L> {
    pub fn new(inner: L) -> Self {
        Self { inner }
    }
}

fn unwrap_floquet(op: &Jacobian) -> &Jacobian {
    match op {
        Jacobian::Floquet(wrapper) => wrapper.jacobian(),
        other => other,
    }
}

impl<L: LinearSolver> LinearSolver for FloquetLinearSolver<L> {
    fn solve(&self, op: &Jacobian, rhs: &DVector<f64>) -> Result<(DVector<f64>, usize)> {
        self.inner.solve(unwrap_floquet(op), rhs)
    }

    fn solve2(
        &self,
        op: &Jacobian,
        rhs1: &DVector<f64>,
        rhs2: &DVector<f64>,
    ) -> Result<(DVector<f64>, DVector<f64>, usize)> {
        self.inner.solve2(unwrap_floquet(op), rhs1, rhs2)
    }
}

/// Eigen solver returning Floquet exponents `ln μ` of the monodromy for
/// wrapped operators, and delegating anything else.
pub struct FloquetEigenSolver<E> {
    pub inner: E,
}

impl<E> FloquetEigenSolver<E> {
    pub fn new(inner: E) -> Self {
        Self { inner }
    }
}

impl<E: EigenSolver> EigenSolver for FloquetEigenSolver<E> {
    fn eigen(&self, op: &Jacobian, nev: usize, with_vectors: bool) -> Result<EigenOutcome> {
        let Jacobian::Floquet(wrapper) = op else {
            return self.inner.eigen(op, nev, with_vectors);
        };
        let monodromy = Jacobian::Dense(wrapper.monodromy()?.clone());
        let multipliers = self.inner.eigen(&monodromy, 0, with_vectors)?;

        let mut indexed: Vec<(usize, Complex<f64>)> =
            multipliers.values.iter().copied().enumerate().collect();
        if wrapper.has_trivial_multiplier() && !indexed.is_empty() {
            let one = Complex::new(1.0, 0.0);
            let trivial = indexed
                .iter()
                .enumerate()
                .min_by(|(_, a), (_, b)| {
                    (a.1 - one)
                        .norm()
                        .partial_cmp(&(b.1 - one).norm())
                        .unwrap_or(std::cmp::Ordering::Equal)
                })
                .map(|(pos, _)| pos);
            if let Some(pos) = trivial {
                indexed.remove(pos);
            }
        }

        let mut exponents: Vec<(usize, Complex<f64>)> =
            indexed.into_iter().map(|(i, mu)| (i, mu.ln())).collect();
        exponents.sort_by(|a, b| {
            b.1.re
                .partial_cmp(&a.1.re)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(b.1.im.partial_cmp(&a.1.im).unwrap_or(std::cmp::Ordering::Equal))
        });
        let keep = if nev == 0 { exponents.len() } else { nev.min(exponents.len()) };
        exponents.truncate(keep);
        let values = exponents.iter().map(|(_, v)| *v).collect();

        let vectors = multipliers.vectors.map(|vecs| {
            let mut out = DMatrix::zeros(vecs.nrows(), exponents.len());
            for (col, (src, _)) in exponents.iter().enumerate() {
                out.set_column(col, &vecs.column(*src));
            }
            out
        });
        Ok(EigenOutcome { values, vectors })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::linalg::{DenseEigenSolver, DenseLinearSolver};
    use std::cell::Cell;
    use std::rc::Rc;

    fn sample_jacobian() -> DMatrix<f64> {
        DMatrix::from_row_slice(3, 3, &[4.0, 1.0, 0.0, 1.0, 3.0, 1.0, 0.0, 1.0, 2.0])
    }

    #[test]
    fn wrapped_and_plain_solves_agree() {
        let rhs1 = DVector::from_vec(vec![1.0, 2.0, 3.0]);
        let rhs2 = DVector::from_vec(vec![-1.0, 0.5, 0.0]);
        let plain = Jacobian::Dense(sample_jacobian());
        let wrapped = Jacobian::Floquet(Box::new(FloquetWrapper::ready(
            Jacobian::Dense(sample_jacobian()),
            DVector::zeros(3),
            0.0,
            false,
            DMatrix::identity(3, 3),
        )));
        let solver = FloquetLinearSolver::new(DenseLinearSolver);

        let (direct, _) = DenseLinearSolver.solve(&plain, &rhs1).unwrap();
        let (through, _) = solver.solve(&wrapped, &rhs1).unwrap();
        assert!((&direct - &through).norm() < 1e-12);

        let (d1, d2, _) = DenseLinearSolver.solve2(&plain, &rhs1, &rhs2).unwrap();
        let (w1, w2, _) = solver.solve2(&wrapped, &rhs1, &rhs2).unwrap();
        assert!((d1 - w1).norm() < 1e-12);
        assert!((d2 - w2).norm() < 1e-12);

        let (passed, _) = solver.solve(&plain, &rhs1).unwrap();
        assert!((passed - through).norm() < 1e-12);
    }

    #[test]
    fn dense_solver_refuses_wrapped_operator() {
        let wrapped = Jacobian::Floquet(Box::new(FloquetWrapper::ready(
            Jacobian::Dense(sample_jacobian()),
            DVector::zeros(3),
            0.0,
            false,
            DMatrix::identity(3, 3),
        )));
        let err = DenseLinearSolver
            .solve(&wrapped, &DVector::zeros(3))
            .expect_err("refused");
        assert!(matches!(
            err.downcast_ref::<crate::error::ContinuationError>(),
            Some(crate::error::ContinuationError::UnsupportedOperator(_))
        ));
    }

    #[test]
    fn exponents_drop_trivial_multiplier() {
        let monodromy = DMatrix::from_diagonal(&DVector::from_vec(vec![0.5, 1.0 + 1e-9, 2.0]));
        let wrapped = Jacobian::Floquet(Box::new(FloquetWrapper::ready(
            Jacobian::Dense(DMatrix::identity(3, 3)),
            DVector::zeros(3),
            0.0,
            true,
            monodromy,
        )));
        let out = FloquetEigenSolver::new(DenseEigenSolver)
            .eigen(&wrapped, 0, true)
            .unwrap();
        assert_eq!(out.values.len(), 2);
        assert!((out.values[0].re - 2f64.ln()).abs() < 1e-12);
        assert!((out.values[1].re - 0.5f64.ln()).abs() < 1e-12);
        let vectors = out.vectors.unwrap();
        assert_eq!(vectors.ncols(), 2);
        assert!((vectors[(2, 0)].norm() - 1.0).abs() < 1e-10);
    }

    #[test]
    fn plain_operators_pass_through_eigen_solver() {
        let op = Jacobian::Dense(DMatrix::from_diagonal(&DVector::from_vec(vec![-1.0, 3.0])));
        let out = FloquetEigenSolver::new(DenseEigenSolver).eigen(&op, 0, false).unwrap();
        assert!((out.values[0].re - 3.0).abs() < 1e-12);
        assert!((out.values[1].re + 1.0).abs() < 1e-12);
    }

    #[test]
    fn deferred_monodromy_is_computed_once() {
        let calls = Rc::new(Cell::new(0));
        let counter = Rc::clone(&calls);
        let wrapper = FloquetWrapper::deferred(
            Jacobian::Dense(DMatrix::identity(2, 2)),
            DVector::zeros(2),
            0.3,
            false,
            move || {
                counter.set(counter.get() + 1);
                Ok(DMatrix::identity(2, 2) * 2.0)
            },
        );
        assert_eq!(wrapper.monodromy().unwrap()[(0, 0)], 2.0);
        assert_eq!(wrapper.monodromy().unwrap()[(1, 1)], 2.0);
        assert_eq!(calls.get(), 1);
        assert_eq!(wrapper.parameter(), 0.3);
    }
}
