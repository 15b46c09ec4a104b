//! Standard multiple shooting.
//!
//! Unknowns are `[s_0, .., s_{m-1}, T]`; each segment is flowed for `T/m`
//! with fixed-step RK4 and must land on the next start point. The phase is
//! pinned by `<s_0 - x_ref, F(x_ref)> = 0`, where `x_ref` moves to `s_0`
//! whenever the section is updated.

use anyhow::{bail, Result};
use log::warn;
use nalgebra::{DMatrix, DVector};

use super::{eval_field, eval_field_f64, OrbitGuess};
use crate::autodiff::TangentFlow;
use crate::solvers::flow;
use crate::traits::{lift, Frozen, Scalar, VectorField};

#[derive(Debug, Clone)]
pub struct Shooting {
    m: usize,
    n: usize,
    steps: usize,
    anchor: DVector<f64>,
    normal: DVector<f64>,
}

fn segment<T>(x: &[T], i: usize, n: usize) -> &[T] {
    &x[i * n..(i + 1) * n]
}

impl Shooting {
    pub fn from_guess<S: VectorField>(
        field: &S,
        params: &S::Params,
        guess: &OrbitGuess,
        steps: usize,
    ) -> Result<(Self, DVector<f64>)> {
        let m = guess.states.len();
        if m == 0 || steps == 0 {
            bail!("Shooting needs at least one segment and one step (got m = {m}, steps = {steps})");
        }
        let n = field.dimension();
        let anchor = guess.states[0].clone();
        let normal = eval_field_f64(field, params, anchor.as_slice());
        if normal.norm() == 0.0 {
            bail!("The orbit guess starts on an equilibrium; no phase condition can be set");
        }
        let shooting = Self {
            m,
            n,
            steps,
            anchor,
            normal,
        };
        let x0 = shooting.pack(&guess.states, guess.period);
        Ok((shooting, x0))
    }

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
            .map(|i| DVector::from_column_slice(segment(x, i, self.n)))
            .collect()
    }

    pub fn residual<S: VectorField, T: Scalar>(&self, field: &S, params: &S::Params, x: &[T]) -> Vec<T> {
        let (m, n) = (self.m, self.n);
        let duration = x[m * n] / lift(m as f64);
        let system = Frozen::new(field, params);
        let mut out = Vec::with_capacity(m * n + 1);
        for i in 0..m {
            let landed = flow(&system, segment(x, i, n), duration, self.steps);
            let next = segment(x, (i + 1) % m, n);
            out.extend(landed.iter().zip(next).map(|(a, b)| *a - *b));
        }
        let s0 = segment(x, 0, n);
        let phase = (0..n).fold(T::zero(), |acc, k| {
            acc + (s0[k] - lift(self.anchor[k])) * lift(self.normal[k])
        });
        out.push(phase);
        out
    }

    /// Flows `[s; v]` for one segment and returns the end state and tangent.
    fn tangent_segment<S: VectorField>(
        &self,
        field: &S,
        params: &S::Params,
        start: &[f64],
        direction: &[f64],
        duration: f64,
    ) -> (Vec<f64>, Vec<f64>) {
        let mut joint = start.to_vec();
        joint.extend_from_slice(direction);
        let mut end = flow(&TangentFlow::new(field, params), &joint, duration, self.steps);
        let v = end.split_off(self.n);
        (end, v)
    }

    pub fn jvp<S: VectorField>(&self, field: &S, params: &S::Params, x: &[f64], dx: &[f64]) -> Vec<f64> {
        let (m, n) = (self.m, self.n);
        let duration = self.period(x) / m as f64;
        let d_duration = dx[m * n] / m as f64;
        let mut out = Vec::with_capacity(m * n + 1);
        for i in 0..m {
            let (landed, v) = self.tangent_segment(field, params, segment(x, i, n), segment(dx, i, n), duration);
            let rate = eval_field(field, params, &landed);
            let next = segment(dx, (i + 1) % m, n);
            for k in 0..n {
                out.push(v[k] + rate[k] * d_duration - next[k]);
            }
        }
        let phase: f64 = segment(dx, 0, n)
            .iter()
            .zip(self.normal.iter())
            .map(|(a, b)| a * b)
            .sum();
        out.push(phase);
        out
    }

    /// Jacobian of one segment's flow map.
    fn segment_jacobian<S: VectorField>(&self, field: &S, params: &S::Params, start: &[f64], duration: f64) -> DMatrix<f64> {
        let n = self.n;
        let mut jac = DMatrix::zeros(n, n);
        let mut unit = vec![0.0; n];
        for j in 0..n {
            unit[j] = 1.0;
            let (_, column) = self.tangent_segment(field, params, start, &unit, duration);
            jac.set_column(j, &DVector::from_vec(column));
            unit[j] = 0.0;
        }
        jac
    }

    pub fn monodromy<S: VectorField>(&self, field: &S, params: &S::Params, x: &[f64]) -> Result<DMatrix<f64>> {
        let duration = self.period(x) / self.m as f64;
        let mut monodromy = DMatrix::identity(self.n, self.n);
        for i in 0..self.m {
            monodromy = self.segment_jacobian(field, params, segment(x, i, self.n), duration) * monodromy;
        }
        Ok(monodromy)
    }

    /// Re-anchors the phase condition at the current `s_0`.
    pub fn update_section<S: VectorField>(&mut self, field: &S, params: &S::Params, x: &[f64]) -> Result<bool> {
        let anchor = DVector::from_column_slice(segment(x, 0, self.n));
        let normal = eval_field_f64(field, params, anchor.as_slice());
        if normal.norm() == 0.0 {
            warn!("shooting: vector field vanishes at s_0; keeping the previous phase condition");
            return Ok(true);
        }
        self.anchor = anchor;
        self.normal = normal;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::autodiff::jacobian_of;

    struct Damped;

    impl VectorField for Damped {
        type Params = f64;

        fn dimension(&self) -> usize {
            2
        }

        fn eval<T: Scalar>(&self, x: &[T], gamma: &f64, out: &mut [T]) {
            let g: T = lift(*gamma);
            out[0] = x[1];
            out[1] = -x[0] - g * x[1];
        }
    }

    fn setup(m: usize) -> (Shooting, DVector<f64>) {
        let guess = OrbitGuess::sample(
            |t| DVector::from_vec(vec![t.cos(), -t.sin()]),
            2.0 * std::f64::consts::PI,
            m,
        );
        Shooting::from_guess(&Damped, &0.0, &guess, 50).unwrap()
    }

    #[test]
    fn monodromy_of_linear_flow_is_its_exponential() {
        let (shooting, x0) = setup(3);
        let gamma = 0.1;
        let mono = shooting.monodromy(&Damped, &gamma, x0.as_slice()).unwrap();
        // det exp(A T) = exp(tr(A) T)
        let expected = (-gamma * 2.0 * std::f64::consts::PI).exp();
        assert!((mono.determinant() - expected).abs() < 1e-6);
    }

    #[test]
    fn state_columns_of_jvp_match_dual_numbers() {
        let (shooting, x0) = setup(2);
        let x: Vec<f64> = x0.iter().map(|v| v + 0.05).collect();
        let ad = jacobian_of(&x, x.len(), |xd, out| {
            out.copy_from_slice(&shooting.residual(&Damped, &0.2, xd))
        });
        let mut dx = vec![0.0; x.len()];
        dx[1] = 1.0;
        dx[2] = -0.5;
        let jv = shooting.jvp(&Damped, &0.2, &x, &dx);
        let expected = &ad * DVector::from_vec(dx);
        for (a, b) in jv.iter().zip(expected.iter()) {
            assert!((a - b).abs() < 1e-10, "{a} vs {b}");
        }
    }

    #[test]
    fn update_moves_the_anchor() {
        let (mut shooting, x0) = setup(2);
        let mut x = x0.clone();
        x[0] = 0.9;
        assert!(shooting.update_section(&Damped, &0.0, x.as_slice()).unwrap());
        let r = shooting.residual(&Damped, &0.0, x.as_slice());
        assert!(r[r.len() - 1].abs() < 1e-15);
    }
}
