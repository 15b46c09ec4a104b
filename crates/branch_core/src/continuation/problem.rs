use anyhow::{bail, Result};
use log::warn;
use nalgebra::{DMatrix, DVector};
use std::any::Any;
use std::fmt;
use std::rc::Rc;
use std::sync::Arc;

use super::types::BranchKind;
use crate::autodiff::jacobian_of;
use crate::linalg::{Jacobian, MatrixFree};
use crate::traits::VectorField;

/// Reads and writes the continuation parameter inside an opaque parameter
/// object.
pub struct ParamLens<P> {
    pub name: &'static str,
    get: fn(&P) -> f64,
    set: fn(&mut P, f64),
}

impl<P> Clone for ParamLens<P> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<P> Copy for ParamLens<P> {}

impl<P> fmt::Debug for ParamLens<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ParamLens").field("name", &self.name).finish()
    }
}

impl<P: Clone> ParamLens<P> {
    pub fn new(name: &'static str, get: fn(&P) -> f64, set: fn(&mut P, f64)) -> Self {
        Self { name, get, set }
    }

    pub fn get(&self, params: &P) -> f64 {
        (self.get)(params)
    }

    pub fn set(&self, params: &mut P, value: f64) {
        (self.set)(params, value)
    }

    /// Copy of `params` with the lensed field replaced.
    pub fn with(&self, params: &P, value: f64) -> P {
        let mut out = params.clone();
        (self.set)(&mut out, value);
        out
    }
}

/// Core interface implemented by anything that can be continued in one
/// parameter: a residual `F(x, p)` and its linearization in `x`.
pub trait ContinuationProblem {
    type Params: Clone;

    /// Number of unknowns (excluding the continuation parameter).
    fn dimension(&self) -> usize;

    /// Parameter object the branch starts from.
    fn params(&self) -> &Self::Params;

    fn lens(&self) -> ParamLens<Self::Params>;

    fn residual(&mut self, x: &DVector<f64>, p: f64) -> Result<DVector<f64>>;

    fn jacobian(&mut self, x: &DVector<f64>, p: f64) -> Result<Jacobian>;

    /// `dF/dp`, by central differences unless overridden.
    fn param_derivative(&mut self, x: &DVector<f64>, p: f64) -> Result<DVector<f64>> {
        let delta = 1e-7 * (1.0 + p.abs());
        let plus = self.residual(x, p + delta)?;
        let minus = self.residual(x, p - delta)?;
        Ok((plus - minus) / (2.0 * delta))
    }

    fn branch_kind(&self) -> BranchKind {
        BranchKind::Equilibrium
    }

    /// Re-anchors a shooting section on the current solution. Returning
    /// `Ok(false)` asks the stepper to stop.
    fn update_section(&mut self, _x: &DVector<f64>, _p: f64) -> Result<bool> {
        warn!("update_section is not implemented for this problem; ignoring");
        Ok(true)
    }

    /// Handle on the functional that produced the branch, kept in the
    /// branch result for later branch switching.
    fn functional(&self) -> Option<Arc<dyn Any + Send + Sync>> {
        None
    }

    fn parameter(&self) -> f64 {
        self.lens().get(self.params())
    }
}

type ResidualFn<P> = Rc<dyn Fn(&DVector<f64>, &P) -> DVector<f64>>;
type JacobianFn<P> = Rc<dyn Fn(&DVector<f64>, &P) -> Jacobian>;

/// Equilibria of a user-supplied residual `F(x, p)` with user-supplied
/// jacobian.
pub struct EquilibriumProblem<P> {
    dim: usize,
    params: P,
    lens: ParamLens<P>,
    f: ResidualFn<P>,
    j: JacobianFn<P>,
}

impl<P: Clone + 'static> EquilibriumProblem<P> {
    /// Dense jacobian supplied as a matrix.
    pub fn new<F, J>(dim: usize, params: P, lens: ParamLens<P>, f: F, j: J) -> Self
    where
        F: Fn(&DVector<f64>, &P) -> DVector<f64> + 'static,
        J: Fn(&DVector<f64>, &P) -> DMatrix<f64> + 'static,
    {
        Self {
            dim,
            params,
            lens,
            f: Rc::new(f),
            j: Rc::new(move |x, p| Jacobian::Dense(j(x, p))),
        }
    }

    /// Jacobian supplied only through its action `jv(x, p, dx)`.
    pub fn matrix_free<F, JV>(dim: usize, params: P, lens: ParamLens<P>, f: F, jv: JV) -> Self
    where
        F: Fn(&DVector<f64>, &P) -> DVector<f64> + 'static,
        JV: Fn(&DVector<f64>, &P, &DVector<f64>) -> DVector<f64> + 'static,
    {
        let jv = Rc::new(jv);
        Self {
            dim,
            params,
            lens,
            f: Rc::new(f),
            j: Rc::new(move |x, p| {
                let (x, p, jv) = (x.clone(), p.clone(), Rc::clone(&jv));
                Jacobian::MatrixFree(MatrixFree::new(x.len(), move |dx| Ok(jv(&x, &p, dx))))
            }),
        }
    }
}

impl<P: Clone> ContinuationProblem for EquilibriumProblem<P> {
    type Params = P;

    fn dimension(&self) -> usize {
        self.dim
    }

    fn params(&self) -> &P {
        &self.params
    }

    fn lens(&self) -> ParamLens<P> {
        self.lens
    }

    fn residual(&mut self, x: &DVector<f64>, p: f64) -> Result<DVector<f64>> {
        if x.len() != self.dim {
            bail!("State has dimension {}, expected {}", x.len(), self.dim);
        }
        let par = self.lens.with(&self.params, p);
        Ok((self.f)(x, &par))
    }

    fn jacobian(&mut self, x: &DVector<f64>, p: f64) -> Result<Jacobian> {
        let par = self.lens.with(&self.params, p);
        Ok((self.j)(x, &par))
    }
}

/// Equilibria of a [`VectorField`], with the jacobian from dual numbers.
pub struct FieldProblem<S: VectorField> {
    field: Arc<S>,
    params: S::Params,
    lens: ParamLens<S::Params>,
}

impl<S: VectorField> FieldProblem<S> {
    pub fn new(field: Arc<S>, params: S::Params, lens: ParamLens<S::Params>) -> Self {
        Self { field, params, lens }
    }

    pub fn field(&self) -> &Arc<S> {
        &self.field
    }
}

impl<S: VectorField> ContinuationProblem for FieldProblem<S> {
    type Params = S::Params;

    fn dimension(&self) -> usize {
        self.field.dimension()
    }

    fn params(&self) -> &S::Params {
        &self.params
    }

    fn lens(&self) -> ParamLens<S::Params> {
        self.lens
    }

    fn residual(&mut self, x: &DVector<f64>, p: f64) -> Result<DVector<f64>> {
        let n = self.dimension();
        if x.len() != n {
            bail!("State has dimension {}, expected {}", x.len(), n);
        }
        let par = self.lens.with(&self.params, p);
        let mut out = DVector::zeros(n);
        self.field.eval(x.as_slice(), &par, out.as_mut_slice());
        Ok(out)
    }

    fn jacobian(&mut self, x: &DVector<f64>, p: f64) -> Result<Jacobian> {
        let par = self.lens.with(&self.params, p);
        let field = &self.field;
        let jac = jacobian_of(x.as_slice(), field.dimension(), |xd, out| {
            field.eval(xd, &par, out)
        });
        Ok(Jacobian::Dense(jac))
    }
}
