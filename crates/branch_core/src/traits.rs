use num_traits::{Float, FromPrimitive};
use std::fmt::Debug;

use crate::autodiff::Dual;

/// A trait for types that can be used as scalars in vector fields and flows.
/// Must support basic arithmetic, debug printing, and conversion from f64.
pub trait Scalar: Float + FromPrimitive + Debug + 'static {}

impl<T: Float + FromPrimitive + Debug + 'static> Scalar for T {}

/// Lifts an `f64` constant (typically a model parameter) into a generic scalar.
pub fn lift<T: Scalar>(value: f64) -> T {
    T::from_f64(value).unwrap_or_else(T::nan)
}

/// Represents an autonomous or time-dependent right-hand side frozen at fixed
/// parameters. This is what the integrators in [`crate::solvers`] step.
pub trait DynamicalSystem<T: Scalar> {
    /// Returns the dimension of the state space.
    fn dimension(&self) -> usize;

    /// Evaluates the vector field.
    /// x: current state
    /// t: current time
    /// out: buffer to write dx/dt
    fn apply(&self, t: T, x: &[T], out: &mut [T]);
}

/// A trait for solvers that can step a system forward.
pub trait Steppable<T: Scalar> {
    /// Performs one step of size dt.
    fn step(&mut self, system: &impl DynamicalSystem<T>, t: &mut T, state: &mut [T], dt: T);
}

/// A parametrized vector field `dx/dt = f(x, p)`.
///
/// `eval` is generic over the scalar type so that the same model serves plain
/// evaluation (`f64`) and forward-mode differentiation ([`Dual`]).
pub trait VectorField: Send + Sync {
    type Params: Clone + Send + Sync;

    fn dimension(&self) -> usize;

    fn eval<T: Scalar>(&self, x: &[T], params: &Self::Params, out: &mut [T]);

    /// Directional derivative `df/dx(x, p) · dx`.
    ///
    /// Override this with an analytic expression to use the
    /// analytic matrix-free linearization; the default differentiates `eval`.
    fn jvp(&self, x: &[f64], params: &Self::Params, dx: &[f64], out: &mut [f64]) {
        let seeded: Vec<Dual> = x
            .iter()
            .zip(dx.iter())
            .map(|(&v, &d)| Dual::new(v, d))
            .collect();
        let mut dual_out = vec![Dual::new(0.0, 0.0); out.len()];
        self.eval(&seeded, params, &mut dual_out);
        for (o, d) in out.iter_mut().zip(dual_out.iter()) {
            *o = d.eps;
        }
    }
}

/// Second and third differentials of a vector field, needed by the Hopf
/// normal form. Defaults use central differences of [`VectorField::jvp`].
pub trait HigherDerivatives: VectorField {
    /// `d²f(x, p)[dx1, dx2]`
    fn d2f(&self, x: &[f64], params: &Self::Params, dx1: &[f64], dx2: &[f64], out: &mut [f64]) {
        let h = 1e-4;
        let n = x.len();
        let mut plus = vec![0.0; n];
        let mut minus = vec![0.0; n];
        let xp: Vec<f64> = x.iter().zip(dx2).map(|(a, b)| a + h * b).collect();
        let xm: Vec<f64> = x.iter().zip(dx2).map(|(a, b)| a - h * b).collect();
        self.jvp(&xp, params, dx1, &mut plus);
        self.jvp(&xm, params, dx1, &mut minus);
        for i in 0..n {
            out[i] = (plus[i] - minus[i]) / (2.0 * h);
        }
    }

    /// `d³f(x, p)[dx1, dx2, dx3]`
    fn d3f(
        &self,
        x: &[f64],
        params: &Self::Params,
        dx1: &[f64],
        dx2: &[f64],
        dx3: &[f64],
        out: &mut [f64],
    ) {
        let h = 1e-3;
        let n = x.len();
        let mut plus = vec![0.0; n];
        let mut minus = vec![0.0; n];
        let xp: Vec<f64> = x.iter().zip(dx3).map(|(a, b)| a + h * b).collect();
        let xm: Vec<f64> = x.iter().zip(dx3).map(|(a, b)| a - h * b).collect();
        self.d2f(&xp, params, dx1, dx2, &mut plus);
        self.d2f(&xm, params, dx1, dx2, &mut minus);
        for i in 0..n {
            out[i] = (plus[i] - minus[i]) / (2.0 * h);
        }
    }
}

/// A [`VectorField`] frozen at one parameter value, seen as a [`DynamicalSystem`].
pub struct Frozen<'a, S: VectorField> {
    pub field: &'a S,
    pub params: &'a S::Params,
}

impl<'a, S: VectorField> Frozen<'a, S> {
    pub fn new(field: &'a S, params: &'a S::Params) -> Self {
        Self { field, params }
    }
}

impl<'a, S: VectorField, T: Scalar> DynamicalSystem<T> for Frozen<'a, S> {
    fn dimension(&self) -> usize {
        self.field.dimension()
    }

    fn apply(&self, _t: T, x: &[T], out: &mut [T]) {
        self.field.eval(x, self.params, out);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Cubic;

    impl VectorField for Cubic {
        type Params = f64;

        fn dimension(&self) -> usize {
            1
        }

        fn eval<T: Scalar>(&self, x: &[T], p: &f64, out: &mut [T]) {
            out[0] = lift::<T>(*p) * x[0] - x[0] * x[0] * x[0];
        }
    }

    impl HigherDerivatives for Cubic {}

    #[test]
    fn default_jvp_matches_derivative() {
        let mut out = [0.0];
        Cubic.jvp(&[2.0], &0.5, &[1.0], &mut out);
        assert!((out[0] - (0.5 - 12.0)).abs() < 1e-12);
    }

    #[test]
    fn default_higher_derivatives_match_closed_form() {
        let mut d2 = [0.0];
        Cubic.d2f(&[2.0], &0.5, &[1.0], &[1.0], &mut d2);
        assert!((d2[0] + 12.0).abs() < 1e-6, "d2f = {}", d2[0]);

        let mut d3 = [0.0];
        Cubic.d3f(&[2.0], &0.5, &[1.0], &[1.0], &[1.0], &mut d3);
        assert!((d3[0] + 6.0).abs() < 1e-4, "d3f = {}", d3[0]);
    }

    #[test]
    fn frozen_field_is_a_dynamical_system() {
        let p = 1.0;
        let frozen = Frozen::new(&Cubic, &p);
        let mut out = [0.0];
        frozen.apply(0.0, &[0.5], &mut out);
        assert!((out[0] - (0.5 - 0.125)).abs() < 1e-15);
        assert_eq!(DynamicalSystem::<f64>::dimension(&frozen), 1);
    }
}
