//! Trapezoidal finite differences on a uniform mesh of `m` time slices.
//!
//! Unknowns are `[u_0, .., u_{m-1}, T]`. Slice `i` is tied to its
//! predecessor by `u_i - u_{i-1} - h/2 (F(u_i) + F(u_{i-1})) = 0` with
//! `h = T/m` (indices cyclic), and the phase is fixed by an integral
//! condition against the reference orbit.

use anyhow::{anyhow, bail, Result};
use nalgebra::{DMatrix, DVector};
use nalgebra_sparse::convert::serial::convert_coo_dense;
use nalgebra_sparse::CooMatrix;

use super::{eval_field, eval_field_f64, field_jacobian, OrbitGuess};
use crate::traits::{lift, Scalar, VectorField};

#[derive(Debug, Clone)]
pub struct Trapezoid {
    m: usize,
    n: usize,
    /// Reference slices `ϕ_i` of the phase condition.
    reference: Vec<DVector<f64>>,
    /// `F(ϕ_i)`.
    reference_field: Vec<DVector<f64>>,
}

fn slice<T>(x: &[T], i: usize, n: usize) -> &[T] {
    &x[i * n..(i + 1) * n]
}

impl Trapezoid {
    pub fn from_guess<S: VectorField>(
        field: &S,
        params: &S::Params,
        guess: &OrbitGuess,
    ) -> Result<(Self, DVector<f64>)> {
        let m = guess.states.len();
        if m < 2 {
            bail!("The trapezoid formulation needs at least two slices (got {m})");
        }
        let n = field.dimension();
        let reference_field: Vec<DVector<f64>> = guess
            .states
            .iter()
            .map(|s| eval_field_f64(field, params, s.as_slice()))
            .collect();
        let problem = Self {
            m,
            n,
            reference: guess.states.clone(),
            reference_field,
        };
        let x0 = problem.pack(&guess.states, guess.period);
        Ok((problem, x0))
    }

    /// Unknowns for the given slices and period.
    pub fn pack(&self, states: &[DVector<f64>], period: f64) -> DVector<f64> {
        let mut x = Vec::with_capacity(self.unknowns());
        for state in states {
            x.extend_from_slice(state.as_slice());
        }
        x.push(period);
        DVector::from_vec(x)
    }

    pub fn unknowns(&self) -> usize {
        self.m * self.n + 1
    }

    pub fn period(&self, x: &[f64]) -> f64 {
        x[self.m * self.n]
    }

    pub fn slice_states(&self, x: &[f64]) -> Vec<DVector<f64>> {
        (0..self.m)
            .map(|i| DVector::from_column_slice(slice(x, i, self.n)))
            .collect()
    }

    pub fn residual<S: VectorField, T: Scalar>(&self, field: &S, params: &S::Params, x: &[T]) -> Vec<T> {
        let (m, n) = (self.m, self.n);
        let half_step = x[m * n] / lift(2.0 * m as f64);
        let rates: Vec<Vec<T>> = (0..m)
            .map(|i| eval_field(field, params, slice(x, i, n)))
            .collect();

        let mut out = Vec::with_capacity(m * n + 1);
        for i in 0..m {
            let prev = (i + m - 1) % m;
            let (ui, up) = (slice(x, i, n), slice(x, prev, n));
            for k in 0..n {
                out.push(ui[k] - up[k] - half_step * (rates[i][k] + rates[prev][k]));
            }
        }

        let mut phase = T::zero();
        for i in 0..m {
            let ui = slice(x, i, n);
            for k in 0..n {
                phase = phase + (ui[k] - lift(self.reference[i][k])) * lift(self.reference_field[i][k]);
            }
        }
        out.push(phase / lift(m as f64));
        out
    }

    /// `dR(x) · dx` from the field's own `jvp`.
    pub fn jvp<S: VectorField>(&self, field: &S, params: &S::Params, x: &[f64], dx: &[f64]) -> Vec<f64> {
        let (m, n) = (self.m, self.n);
        let half_step = x[m * n] / (2.0 * m as f64);
        let d_half_step = dx[m * n] / (2.0 * m as f64);

        let mut rates = Vec::with_capacity(m);
        let mut actions = Vec::with_capacity(m);
        for i in 0..m {
            rates.push(eval_field(field, params, slice(x, i, n)));
            let mut jv = vec![0.0; n];
            field.jvp(slice(x, i, n), params, slice(dx, i, n), &mut jv);
            actions.push(jv);
        }

        let mut out = Vec::with_capacity(m * n + 1);
        for i in 0..m {
            let prev = (i + m - 1) % m;
            let (di, dp) = (slice(dx, i, n), slice(dx, prev, n));
            for k in 0..n {
                out.push(
                    di[k] - dp[k]
                        - half_step * (actions[i][k] + actions[prev][k])
                        - d_half_step * (rates[i][k] + rates[prev][k]),
                );
            }
        }
        let phase: f64 = (0..m)
            .map(|i| {
                slice(dx, i, n)
                    .iter()
                    .zip(self.reference_field[i].iter())
                    .map(|(a, b)| a * b)
                    .sum::<f64>()
            })
            .sum();
        out.push(phase / m as f64);
        out
    }

    /// Dense jacobian assembled block by block from the slice jacobians.
    pub fn assembled_jacobian<S: VectorField>(&self, field: &S, params: &S::Params, x: &[f64]) -> DMatrix<f64> {
        let (m, n) = (self.m, self.n);
        let size = m * n + 1;
        let half_step = x[m * n] / (2.0 * m as f64);
        let jacobians: Vec<DMatrix<f64>> = (0..m)
            .map(|i| field_jacobian(field, params, slice(x, i, n)))
            .collect();
        let rates: Vec<Vec<f64>> = (0..m)
            .map(|i| eval_field(field, params, slice(x, i, n)))
            .collect();

        let mut coo = CooMatrix::new(size, size);
        for i in 0..m {
            let prev = (i + m - 1) % m;
            for r in 0..n {
                let row = i * n + r;
                for c in 0..n {
                    let identity = if r == c { 1.0 } else { 0.0 };
                    coo.push(row, i * n + c, identity - half_step * jacobians[i][(r, c)]);
                    coo.push(row, prev * n + c, -identity - half_step * jacobians[prev][(r, c)]);
                }
                coo.push(row, m * n, -(rates[i][r] + rates[prev][r]) / (2.0 * m as f64));
            }
        }
        for i in 0..m {
            for c in 0..n {
                coo.push(m * n, i * n + c, self.reference_field[i][c] / m as f64);
            }
        }
        convert_coo_dense(&coo)
    }

    /// Product of the one-step trapezoid maps around the orbit.
    pub fn monodromy<S: VectorField>(&self, field: &S, params: &S::Params, x: &[f64]) -> Result<DMatrix<f64>> {
        let (m, n) = (self.m, self.n);
        let h = self.period(x) / m as f64;
        let jacobians: Vec<DMatrix<f64>> = (0..m)
            .map(|i| field_jacobian(field, params, slice(x, i, n)))
            .collect();

        let identity = DMatrix::<f64>::identity(n, n);
        let mut monodromy = DMatrix::identity(n, n);
        for i in 0..m {
            let next = (i + 1) % m;
            let lhs = &identity - &jacobians[next] * (0.5 * h);
            let rhs = &identity + &jacobians[i] * (0.5 * h);
            let step = lhs
                .lu()
                .solve(&rhs)
                .ok_or_else(|| anyhow!("Failed to invert trapezoid step matrix"))?;
            monodromy = step * monodromy;
        }
        Ok(monodromy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::autodiff::jacobian_of;

    /// Harmonic oscillator, scaled by `omega`.
    struct Rotation;

    impl VectorField for Rotation {
        type Params = f64;

        fn dimension(&self) -> usize {
            2
        }

        fn eval<T: Scalar>(&self, x: &[T], omega: &f64, out: &mut [T]) {
            let w: T = lift(*omega);
            out[0] = -w * x[1];
            out[1] = w * x[0];
        }
    }

    fn guess(m: usize) -> OrbitGuess {
        OrbitGuess::sample(
            |t| DVector::from_vec(vec![t.cos(), t.sin()]),
            2.0 * std::f64::consts::PI,
            m,
        )
    }

    #[test]
    fn assembled_jacobian_matches_dual_numbers() {
        let (trap, x0) = Trapezoid::from_guess(&Rotation, &1.0, &guess(5)).unwrap();
        let x: Vec<f64> = x0.iter().enumerate().map(|(i, v)| v + 0.01 * i as f64).collect();
        let assembled = trap.assembled_jacobian(&Rotation, &1.0, &x);
        let ad = jacobian_of(&x, x.len(), |xd, out| {
            out.copy_from_slice(&trap.residual(&Rotation, &1.0, xd))
        });
        assert!((&assembled - &ad).amax() < 1e-12);

        let dx: Vec<f64> = (0..x.len()).map(|i| (i as f64).sin()).collect();
        let jv = DVector::from_vec(trap.jvp(&Rotation, &1.0, &x, &dx));
        assert!((assembled * DVector::from_vec(dx) - jv).amax() < 1e-12);
    }

    #[test]
    fn rotation_monodromy_is_nearly_identity() {
        let (trap, x0) = Trapezoid::from_guess(&Rotation, &1.0, &guess(40)).unwrap();
        let mono = trap.monodromy(&Rotation, &1.0, x0.as_slice()).unwrap();
        // The trapezoid map is a Cayley transform, hence exactly orthogonal.
        let gram = mono.transpose() * &mono;
        assert!((gram - DMatrix::identity(2, 2)).amax() < 1e-12);
        assert!((mono - DMatrix::identity(2, 2)).amax() < 0.02);
    }

    #[test]
    fn rejects_single_slice() {
        assert!(Trapezoid::from_guess(&Rotation, &1.0, &guess(1)).is_err());
    }
}
