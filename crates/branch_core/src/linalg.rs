//! Linear operators, linear solvers and eigen solvers.
//!
//! The continuation machinery only ever talks to the [`LinearSolver`] and
//! [`EigenSolver`] traits, so a different backend can be swapped in without
//! touching the stepper.

use anyhow::{anyhow, bail, Result};
use nalgebra::linalg::SVD;
use nalgebra::{DMatrix, DVector};
use num_complex::Complex;
use std::cmp::Ordering;

use crate::continuation::floquet::FloquetWrapper;
use crate::error::ContinuationError;

/// Action-only linear operator of known dimension.
pub struct MatrixFree {
    dim: usize,
    action: Box<dyn Fn(&DVector<f64>) -> Result<DVector<f64>>>,
}

impl MatrixFree {
    pub fn new<F>(dim: usize, action: F) -> Self
    where
        F: Fn(&DVector<f64>) -> Result<DVector<f64>> + 'static,
    {
        Self {
            dim,
            action: Box::new(action),
        }
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn apply(&self, v: &DVector<f64>) -> Result<DVector<f64>> {
        (self.action)(v)
    }

    /// Builds the dense matrix by applying the operator to each unit vector.
    pub fn materialize(&self) -> Result<DMatrix<f64>> {
        let mut mat = DMatrix::zeros(self.dim, self.dim);
        let mut unit = DVector::zeros(self.dim);
        for j in 0..self.dim {
            unit[j] = 1.0;
            let col = self.apply(&unit)?;
            if col.len() != self.dim {
                bail!(
                    "Matrix-free operator returned {} entries, expected {}",
                    col.len(),
                    self.dim
                );
            }
            mat.set_column(j, &col);
            unit[j] = 0.0;
        }
        Ok(mat)
    }
}

/// The linearization of a residual at a point.
pub enum Jacobian {
    Dense(DMatrix<f64>),
    MatrixFree(MatrixFree),
    /// Periodic-orbit jacobian carrying its monodromy operator.
    Floquet(Box<FloquetWrapper>),
}

impl Jacobian {
    pub fn dim(&self) -> usize {
        match self {
            Jacobian::Dense(m) => m.nrows(),
            Jacobian::MatrixFree(op) => op.dim(),
            Jacobian::Floquet(w) => w.jacobian().dim(),
        }
    }

    pub fn apply(&self, v: &DVector<f64>) -> Result<DVector<f64>> {
        match self {
            Jacobian::Dense(m) => Ok(m * v),
            Jacobian::MatrixFree(op) => op.apply(v),
            Jacobian::Floquet(w) => w.jacobian().apply(v),
        }
    }

    /// Dense view of a plain operator. Floquet-wrapped operators must be
    /// unwrapped first; they are refused here.
    pub fn to_dense(&self) -> Result<DMatrix<f64>> {
        match self {
            Jacobian::Dense(m) => Ok(m.clone()),
            Jacobian::MatrixFree(op) => op.materialize(),
            Jacobian::Floquet(_) => Err(ContinuationError::UnsupportedOperator(
                "Floquet-wrapped jacobian; use FloquetLinearSolver / FloquetEigenSolver",
            )
            .into()),
        }
    }
}

/// Solves `J x = rhs`. Implementations report the number of linear
/// iterations they spent (1 for direct solvers).
pub trait LinearSolver {
    fn solve(&self, op: &Jacobian, rhs: &DVector<f64>) -> Result<(DVector<f64>, usize)>;

    /// Solves the same operator against two right-hand sides.
    fn solve2(
        &self,
        op: &Jacobian,
        rhs1: &DVector<f64>,
        rhs2: &DVector<f64>,
    ) -> Result<(DVector<f64>, DVector<f64>, usize)> {
        let (x1, it1) = self.solve(op, rhs1)?;
        let (x2, it2) = self.solve(op, rhs2)?;
        Ok((x1, x2, it1 + it2))
    }
}

impl<L: LinearSolver + ?Sized> LinearSolver for &L {
    fn solve(&self, op: &Jacobian, rhs: &DVector<f64>) -> Result<(DVector<f64>, usize)> {
        (**self).solve(op, rhs)
    }

    fn solve2(
        &self,
        op: &Jacobian,
        rhs1: &DVector<f64>,
        rhs2: &DVector<f64>,
    ) -> Result<(DVector<f64>, DVector<f64>, usize)> {
        (**self).solve2(op, rhs1, rhs2)
    }
}

/// LU-based direct solver.
#[derive(Debug, Clone, Copy, Default)]
pub struct DenseLinearSolver;

impl LinearSolver for DenseLinearSolver {
    fn solve(&self, op: &Jacobian, rhs: &DVector<f64>) -> Result<(DVector<f64>, usize)> {
        let mat = op.to_dense()?;
        let x = mat
            .lu()
            .solve(rhs)
            .ok_or_else(|| anyhow!("Jacobian is singular."))?;
        Ok((x, 1))
    }

    fn solve2(
        &self,
        op: &Jacobian,
        rhs1: &DVector<f64>,
        rhs2: &DVector<f64>,
    ) -> Result<(DVector<f64>, DVector<f64>, usize)> {
        let lu = op.to_dense()?.lu();
        let x1 = lu
            .solve(rhs1)
            .ok_or_else(|| anyhow!("Jacobian is singular."))?;
        let x2 = lu
            .solve(rhs2)
            .ok_or_else(|| anyhow!("Jacobian is singular."))?;
        Ok((x1, x2, 1))
    }
}

/// Eigen-elements of an operator, sorted by decreasing real part.
#[derive(Debug, Clone)]
pub struct EigenOutcome {
    pub values: Vec<Complex<f64>>,
    /// One eigenvector per column, matching `values`.
    pub vectors: Option<DMatrix<Complex<f64>>>,
}

pub trait EigenSolver {
    /// Computes (up to) `nev` eigenvalues; `nev == 0` asks for all of them.
    fn eigen(&self, op: &Jacobian, nev: usize, with_vectors: bool) -> Result<EigenOutcome>;
}

impl<E: EigenSolver + ?Sized> EigenSolver for Box<E> {
    fn eigen(&self, op: &Jacobian, nev: usize, with_vectors: bool) -> Result<EigenOutcome> {
        (**self).eigen(op, nev, with_vectors)
    }
}

/// Full dense eigen decomposition through nalgebra.
#[derive(Debug, Clone, Copy, Default)]
pub struct DenseEigenSolver;

impl EigenSolver for DenseEigenSolver {
    fn eigen(&self, op: &Jacobian, nev: usize, with_vectors: bool) -> Result<EigenOutcome> {
        let mat = op.to_dense()?;
        dense_eigen(&mat, nev, with_vectors)
    }
}

pub(crate) fn dense_eigen(
    mat: &DMatrix<f64>,
    nev: usize,
    with_vectors: bool,
) -> Result<EigenOutcome> {
    if mat.nrows() == 0 {
        return Ok(EigenOutcome {
            values: Vec::new(),
            vectors: None,
        });
    }
    if mat.iter().any(|v| !v.is_finite()) {
        return Err(ContinuationError::EigenSolver("non-finite matrix entries".into()).into());
    }

    let mut values: Vec<Complex<f64>> = mat.clone().complex_eigenvalues().iter().cloned().collect();
    sort_by_real_part(&mut values);
    let keep = if nev == 0 { values.len() } else { nev.min(values.len()) };
    values.truncate(keep);

    let vectors = if with_vectors {
        let n = mat.nrows();
        let complex_mat = mat.map(|v| Complex::new(v, 0.0));
        let mut vecs = DMatrix::zeros(n, values.len());
        for (k, &lambda) in values.iter().enumerate() {
            let v = eigenvector_for(&complex_mat, lambda)?;
            vecs.set_column(k, &v);
        }
        Some(vecs)
    } else {
        None
    };

    Ok(EigenOutcome { values, vectors })
}

/// Sorts eigenvalues by decreasing real part, then by decreasing imaginary
/// part so that `+iω` precedes `-iω` within a conjugate pair.
pub fn sort_by_real_part(values: &mut [Complex<f64>]) {
    values.sort_by(|a, b| {
        b.re.partial_cmp(&a.re)
            .unwrap_or(Ordering::Equal)
            .then(b.im.partial_cmp(&a.im).unwrap_or(Ordering::Equal))
    });
}

/// Unit-norm null vector of `mat - lambda I`, via the last right singular vector.
pub(crate) fn eigenvector_for(
    mat: &DMatrix<Complex<f64>>,
    lambda: Complex<f64>,
) -> Result<DVector<Complex<f64>>> {
    let n = mat.nrows();
    let mut shifted = mat.clone();
    for i in 0..n {
        shifted[(i, i)] -= lambda;
    }
    let svd = SVD::new(shifted, true, true);
    let v_t = svd
        .v_t
        .ok_or_else(|| ContinuationError::EigenSolver(format!("no eigenvector for {lambda}")))?;
    // nalgebra sorts singular values in decreasing order.
    let (min_idx, _) = svd.singular_values.iter().enumerate().fold(
        (0usize, f64::INFINITY),
        |(idx_min, val_min), (idx, &val)| {
            if val < val_min {
                (idx, val)
            } else {
                (idx_min, val_min)
            }
        },
    );
    let mut vector: DVector<Complex<f64>> =
        DVector::from_iterator(n, v_t.row(min_idx).iter().map(|c| c.conj()));
    let norm = vector.iter().map(|c| c.norm_sqr()).sum::<f64>().sqrt();
    if norm == 0.0 || !norm.is_finite() {
        return Err(ContinuationError::EigenSolver(format!("degenerate eigenvector for {lambda}")).into());
    }
    vector /= Complex::new(norm, 0.0);
    Ok(vector)
}
