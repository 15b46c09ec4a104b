//! Damped Newton corrector and deflation.
//!
//! The continuation stepper treats this as a black box: it hands over a
//! [`NewtonSystem`] (residual plus Newton direction) and gets back a
//! [`NewtonOutcome`]. Deflation wraps any such system so that already known
//! roots repel the iteration.

use anyhow::{bail, Result};
use log::debug;
use nalgebra::DVector;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct NewtonPar {
    /// Absolute tolerance on the residual norm.
    pub tol: f64,
    pub max_iterations: usize,
    pub damping: f64,
}

impl Default for NewtonPar {
    fn default() -> Self {
        Self {
            tol: 1e-10,
            max_iterations: 10,
            damping: 1.0,
        }
    }
}

/// What the corrector needs from a nonlinear system.
pub trait NewtonSystem {
    fn dimension(&self) -> usize;

    fn residual(&mut self, x: &DVector<f64>) -> Result<DVector<f64>>;

    /// Solves `J(x) dx = residual` and returns `(dx, linear iterations)`.
    fn newton_direction(
        &mut self,
        x: &DVector<f64>,
        residual: &DVector<f64>,
    ) -> Result<(DVector<f64>, usize)>;
}

#[derive(Debug, Clone)]
pub struct NewtonOutcome {
    pub x: DVector<f64>,
    /// Residual norms, starting with the initial guess.
    pub residuals: Vec<f64>,
    pub converged: bool,
    pub iterations: usize,
    pub linear_iterations: usize,
}

/// Runs Newton from `x0`. A singular or non-finite iteration ends the run
/// with `converged = false` rather than an error; only failures of the
/// residual evaluation itself are propagated.
pub fn newton<S: NewtonSystem + ?Sized>(
    system: &mut S,
    x0: &DVector<f64>,
    settings: &NewtonPar,
) -> Result<NewtonOutcome> {
    if x0.len() != system.dimension() {
        bail!(
            "Initial guess dimension mismatch. Expected {}, got {}.",
            system.dimension(),
            x0.len()
        );
    }
    if settings.damping <= 0.0 {
        bail!("damping must be positive.");
    }

    let mut x = x0.clone();
    let mut residual = system.residual(&x)?;
    let mut residuals = vec![residual.norm()];
    let mut iterations = 0usize;
    let mut linear_iterations = 0usize;

    loop {
        let norm = *residuals.last().unwrap_or(&f64::INFINITY);
        if !norm.is_finite() {
            break;
        }
        if norm <= settings.tol {
            return Ok(NewtonOutcome {
                x,
                residuals,
                converged: true,
                iterations,
                linear_iterations,
            });
        }
        if iterations >= settings.max_iterations {
            break;
        }

        let (dx, lin_its) = match system.newton_direction(&x, &residual) {
            Ok(step) => step,
            Err(err) => {
                debug!("newton: linear solve failed at iteration {iterations}: {err:#}");
                break;
            }
        };
        linear_iterations += lin_its;
        x.axpy(-settings.damping, &dx, 1.0);
        iterations += 1;

        residual = system.residual(&x)?;
        residuals.push(residual.norm());
        debug!("newton: iteration {iterations}, |F| = {:e}", residuals[iterations]);
    }

    Ok(NewtonOutcome {
        x,
        residuals,
        converged: false,
        iterations,
        linear_iterations,
    })
}

/// Deflation operator `M(x) = Π_i (‖x - r_i‖^{-power} + shift)`.
#[derive(Debug, Clone)]
pub struct DeflationOperator {
    pub power: f64,
    pub shift: f64,
    pub roots: Vec<DVector<f64>>,
}

impl DeflationOperator {
    pub fn new(power: f64, shift: f64, roots: Vec<DVector<f64>>) -> Self {
        Self { power, shift, roots }
    }

    pub fn push(&mut self, root: DVector<f64>) {
        self.roots.push(root);
    }

    pub fn value(&self, x: &DVector<f64>) -> f64 {
        self.roots
            .iter()
            .map(|r| (x - r).norm().powf(-self.power) + self.shift)
            .product()
    }

    /// `∇M(x) / M(x)`.
    pub fn log_gradient(&self, x: &DVector<f64>) -> DVector<f64> {
        let mut grad = DVector::zeros(x.len());
        for root in &self.roots {
            let e = x - root;
            let dist = e.norm();
            let factor = dist.powf(-self.power) + self.shift;
            let scale = -self.power * dist.powf(-self.power - 2.0) / factor;
            grad.axpy(scale, &e, 1.0);
        }
        grad
    }
}

/// `G(x) = M(x) F(x)` for an inner system `F`.
pub struct Deflated<'a, S: NewtonSystem + ?Sized> {
    inner: &'a mut S,
    operator: &'a DeflationOperator,
}

impl<'a, S: NewtonSystem + ?Sized> Deflated<'a, S> {
    pub fn new(inner: &'a mut S, operator: &'a DeflationOperator) -> Self {
        Self { inner, operator }
    }
}

impl<'a, S: NewtonSystem + ?Sized> NewtonSystem for Deflated<'a, S> {
    fn dimension(&self) -> usize {
        self.inner.dimension()
    }

    fn residual(&mut self, x: &DVector<f64>) -> Result<DVector<f64>> {
        Ok(self.inner.residual(x)? * self.operator.value(x))
    }

    fn newton_direction(
        &mut self,
        x: &DVector<f64>,
        residual: &DVector<f64>,
    ) -> Result<(DVector<f64>, usize)> {
        // The undeflated step is rescaled: dx_G = dx_F / (1 + (∇M/M)·dx_F).
        let m = self.operator.value(x);
        let undeflated_rhs = residual / m;
        let (dx, its) = self.inner.newton_direction(x, &undeflated_rhs)?;
        let denom = 1.0 + self.operator.log_gradient(x).dot(&dx);
        if denom.abs() < f64::EPSILON {
            bail!("Deflated Newton step is singular");
        }
        Ok((dx / denom, its))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// f(x) = (x - 1)(x + 2), roots 1 and -2.
    struct Quadratic;

    impl NewtonSystem for Quadratic {
        fn dimension(&self) -> usize {
            1
        }

        fn residual(&mut self, x: &DVector<f64>) -> Result<DVector<f64>> {
            Ok(DVector::from_element(1, (x[0] - 1.0) * (x[0] + 2.0)))
        }

        fn newton_direction(
            &mut self,
            x: &DVector<f64>,
            residual: &DVector<f64>,
        ) -> Result<(DVector<f64>, usize)> {
            let d = 2.0 * x[0] + 1.0;
            Ok((DVector::from_element(1, residual[0] / d), 1))
        }
    }

    #[test]
    fn newton_converges_to_nearest_root() {
        let out = newton(&mut Quadratic, &DVector::from_element(1, 2.0), &NewtonPar::default())
            .expect("newton");
        assert!(out.converged);
        assert!((out.x[0] - 1.0).abs() < 1e-9);
        assert_eq!(out.residuals.len(), out.iterations + 1);
        assert_eq!(out.linear_iterations, out.iterations);
    }

    #[test]
    fn newton_reports_non_convergence_without_error() {
        let settings = NewtonPar {
            max_iterations: 1,
            ..NewtonPar::default()
        };
        let out = newton(&mut Quadratic, &DVector::from_element(1, 50.0), &settings).expect("newton");
        assert!(!out.converged);
        assert_eq!(out.iterations, 1);
    }

    #[test]
    fn deflation_finds_second_root() {
        let op = DeflationOperator::new(2.0, 1.0, vec![DVector::from_element(1, 1.0)]);
        let mut quad = Quadratic;
        let mut deflated = Deflated::new(&mut quad, &op);
        let settings = NewtonPar {
            max_iterations: 50,
            ..NewtonPar::default()
        };
        let out = newton(&mut deflated, &DVector::from_element(1, 2.0), &settings).expect("newton");
        assert!(out.converged);
        assert!((out.x[0] + 2.0).abs() < 1e-6, "converged to {}", out.x[0]);
    }

    #[test]
    fn log_gradient_matches_finite_difference() {
        let op = DeflationOperator::new(2.0, 0.5, vec![DVector::from_vec(vec![1.0, 0.0])]);
        let x = DVector::from_vec(vec![0.3, 0.4]);
        let g = op.log_gradient(&x);
        let h = 1e-6;
        for i in 0..2 {
            let mut xp = x.clone();
            xp[i] += h;
            let mut xm = x.clone();
            xm[i] -= h;
            let fd = (op.value(&xp).ln() - op.value(&xm).ln()) / (2.0 * h);
            assert!((fd - g[i]).abs() < 1e-6);
        }
    }
}
