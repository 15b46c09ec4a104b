//! Poincaré-section shooting.
//!
//! Section `i` is the hyperplane through `c_i` with unit normal
//! `n_i = F(c_i)/|F(c_i)|`. A point on it is stored in `n - 1` reduced
//! coordinates: the component where `|n_i|` is largest is dropped and
//! recovered from the hyperplane equation. The unknowns are the reduced
//! points `x̂_0 .. x̂_{m-1}`; the residual asks the flow from section `i` to
//! hit section `i + 1` (cyclically) at `x̂_{i+1}`. There is no period
//! unknown and no trivial multiplier.

use anyhow::{bail, Result};
use log::{debug, warn};
use nalgebra::{DMatrix, DVector};

use super::{eval_field, eval_field_f64, OrbitGuess};
use crate::autodiff::TangentFlow;
use crate::solvers::flow;
use crate::traits::{lift, DynamicalSystem, Frozen, Scalar, VectorField};

/// Below this, the dropped component no longer parametrises the section.
const MIN_PIVOT: f64 = 0.1;
const REFINE_ITERATIONS: usize = 8;
/// Integration horizon, in expected transit times.
const HORIZON: usize = 3;

#[derive(Debug, Clone)]
pub struct PoincareShooting {
    m: usize,
    n: usize,
    steps: usize,
    centres: Vec<DVector<f64>>,
    normals: Vec<DVector<f64>>,
    pivots: Vec<usize>,
    /// Expected flight time from section `i` to section `i + 1`.
    transit: Vec<f64>,
}

/// Where and when the flow met the next section.
struct Hit<T> {
    state: Vec<T>,
    time: T,
    full_steps: usize,
    tail: T,
}

fn unit_normal<S: VectorField>(field: &S, params: &S::Params, at: &[f64]) -> Option<DVector<f64>> {
    let rate = eval_field_f64(field, params, at);
    let norm = rate.norm();
    (norm > 0.0).then(|| rate / norm)
}

fn pivot_of(normal: &DVector<f64>) -> usize {
    normal.iamax()
}

impl PoincareShooting {
    pub fn from_guess<S: VectorField>(
        field: &S,
        params: &S::Params,
        guess: &OrbitGuess,
        steps: usize,
    ) -> Result<(Self, DVector<f64>)> {
        let m = guess.states.len();
        let n = field.dimension();
        if m == 0 || steps == 0 {
            bail!("Poincaré shooting needs at least one section and one step (got m = {m}, steps = {steps})");
        }
        if n < 2 {
            bail!("Poincaré sections need a state space of dimension at least 2");
        }
        let mut normals = Vec::with_capacity(m);
        for (i, state) in guess.states.iter().enumerate() {
            let Some(normal) = unit_normal(field, params, state.as_slice()) else {
                bail!("The vector field vanishes at orbit sample {i}; cannot place a section there");
            };
            normals.push(normal);
        }
        let pivots: Vec<usize> = normals.iter().map(pivot_of).collect();
        let shooting = Self {
            m,
            n,
            steps,
            centres: guess.states.clone(),
            normals,
            pivots,
            transit: vec![guess.period / m as f64; m],
        };
        let x0 = shooting.pack(&guess.states);
        Ok((shooting, x0))
    }

    /// Reduced coordinates of `states[i]` on section `i`. The states need
    /// not lie on the sections; the dropped component is simply discarded.
    pub fn pack(&self, states: &[DVector<f64>]) -> DVector<f64> {
        let mut x = Vec::with_capacity(self.unknowns());
        for (i, state) in states.iter().enumerate().take(self.m) {
            x.extend(self.restrict(i, state.as_slice()));
        }
        DVector::from_vec(x)
    }

    pub fn unknowns(&self) -> usize {
        self.m * (self.n - 1)
    }

    fn reduced<'a, T>(&self, x: &'a [T], i: usize) -> &'a [T] {
        let r = self.n - 1;
        &x[i * r..(i + 1) * r]
    }

    /// Full state on section `i` from its reduced coordinates.
    fn lift_point<T: Scalar>(&self, i: usize, reduced: &[T]) -> Vec<T> {
        let (centre, normal, k) = (&self.centres[i], &self.normals[i], self.pivots[i]);
        let mut full = Vec::with_capacity(self.n);
        let mut offset = T::zero();
        let mut it = reduced.iter();
        for j in 0..self.n {
            if j == k {
                full.push(T::zero());
                continue;
            }
            let v = it.next().copied().unwrap_or_else(T::zero);
            offset = offset + (v - lift(centre[j])) * lift(normal[j]);
            full.push(v);
        }
        full[k] = lift::<T>(centre[k]) - offset / lift(normal[k]);
        full
    }

    fn restrict<T: Copy>(&self, i: usize, full: &[T]) -> Vec<T> {
        let k = self.pivots[i];
        full.iter()
            .enumerate()
            .filter(|(j, _)| *j != k)
            .map(|(_, v)| *v)
            .collect()
    }

    /// Linearised lift: a tangent vector of section `i`.
    fn lift_direction(&self, i: usize, reduced: &[f64]) -> Vec<f64> {
        let (normal, k) = (&self.normals[i], self.pivots[i]);
        let mut full = Vec::with_capacity(self.n);
        let mut it = reduced.iter();
        let mut offset = 0.0;
        for j in 0..self.n {
            if j == k {
                full.push(0.0);
                continue;
            }
            let v = it.next().copied().unwrap_or(0.0);
            offset += v * normal[j];
            full.push(v);
        }
        full[k] = -offset / normal[k];
        full
    }

    fn section_value<T: Scalar>(&self, i: usize, x: &[T]) -> T {
        let (centre, normal) = (&self.centres[i], &self.normals[i]);
        (0..self.n).fold(T::zero(), |acc, j| acc + (x[j] - lift(centre[j])) * lift(normal[j]))
    }

    /// Flows from section `i` until the first upward crossing of section
    /// `i + 1`, then refines the crossing time by Newton on the last step.
    fn return_map<T, D>(&self, system: &D, i: usize, start: Vec<T>) -> Option<Hit<T>>
    where
        T: Scalar,
        D: DynamicalSystem<T>,
    {
        let target = (i + 1) % self.m;
        let h: T = lift(self.transit[i] / self.steps as f64);
        let mut state = start;
        let mut g_prev = self.section_value(target, &state);
        let mut rate = vec![T::zero(); self.n];

        for k in 1..=HORIZON * self.steps {
            let next = flow(system, &state, h, 1);
            let g = self.section_value(target, &next);
            if g_prev < T::zero() && g >= T::zero() {
                let mut tail = h * g_prev / (g_prev - g);
                let mut hit = flow(system, &state, tail, 1);
                for _ in 0..REFINE_ITERATIONS {
                    system.apply(T::zero(), &hit, &mut rate);
                    let slope = self.section_slope(target, &rate);
                    if slope == T::zero() {
                        break;
                    }
                    tail = tail - self.section_value(target, &hit) / slope;
                    hit = flow(system, &state, tail, 1);
                }
                let full_steps = k - 1;
                return Some(Hit {
                    state: hit,
                    time: h * lift(full_steps as f64) + tail,
                    full_steps,
                    tail,
                });
            }
            state = next;
            g_prev = g;
        }
        None
    }

    fn section_slope<T: Scalar>(&self, i: usize, rate: &[T]) -> T {
        let normal = &self.normals[i];
        (0..self.n).fold(T::zero(), |acc, j| acc + rate[j] * lift(normal[j]))
    }

    pub fn residual<S: VectorField, T: Scalar>(&self, field: &S, params: &S::Params, x: &[T]) -> Vec<T> {
        let system = Frozen::new(field, params);
        let mut out = Vec::with_capacity(self.unknowns());
        for i in 0..self.m {
            let start = self.lift_point(i, self.reduced(x, i));
            let Some(hit) = self.return_map(&system, i, start) else {
                return vec![T::nan(); self.unknowns()];
            };
            let target = (i + 1) % self.m;
            let landed = self.restrict(target, &hit.state);
            out.extend(landed.iter().zip(self.reduced(x, target)).map(|(a, b)| *a - *b));
        }
        out
    }

    /// Derivative of the reduced return map from section `i`, applied to
    /// `direction`. `None` if the orbit misses the next section.
    fn return_map_jvp<S: VectorField>(
        &self,
        field: &S,
        params: &S::Params,
        i: usize,
        reduced: &[f64],
        direction: &[f64],
    ) -> Option<Vec<f64>> {
        let target = (i + 1) % self.m;
        let start = self.lift_point(i, reduced);
        let hit = self.return_map(&Frozen::new(field, params), i, start.clone())?;

        let mut joint = start;
        joint.extend(self.lift_direction(i, direction));
        let tangent_flow = TangentFlow::new(field, params);
        let h = self.transit[i] / self.steps as f64;
        for _ in 0..hit.full_steps {
            joint = flow(&tangent_flow, &joint, h, 1);
        }
        joint = flow(&tangent_flow, &joint, hit.tail, 1);
        let v = joint.split_off(self.n);

        // Slide along the flow back onto the section.
        let rate = eval_field(field, params, &hit.state);
        let slope = self.section_slope(target, &rate);
        let lateral = self.section_slope(target, &v);
        let corrected: Vec<f64> = v
            .iter()
            .zip(&rate)
            .map(|(vj, fj)| vj - fj * lateral / slope)
            .collect();
        Some(self.restrict(target, &corrected))
    }

    pub fn jvp<S: VectorField>(&self, field: &S, params: &S::Params, x: &[f64], dx: &[f64]) -> Vec<f64> {
        let mut out = Vec::with_capacity(self.unknowns());
        for i in 0..self.m {
            let target = (i + 1) % self.m;
            let Some(dp) = self.return_map_jvp(field, params, i, self.reduced(x, i), self.reduced(dx, i)) else {
                return vec![f64::NAN; self.unknowns()];
            };
            out.extend(dp.iter().zip(self.reduced(dx, target)).map(|(a, b)| a - b));
        }
        out
    }

    /// Product of the reduced return-map jacobians, of size `n - 1`.
    pub fn monodromy<S: VectorField>(&self, field: &S, params: &S::Params, x: &[f64]) -> Result<DMatrix<f64>> {
        let r = self.n - 1;
        let mut monodromy = DMatrix::identity(r, r);
        let mut unit = vec![0.0; r];
        for i in 0..self.m {
            let mut step = DMatrix::zeros(r, r);
            for j in 0..r {
                unit[j] = 1.0;
                let Some(column) = self.return_map_jvp(field, params, i, self.reduced(x, i), &unit) else {
                    bail!("Poincaré return map from section {i} missed section {}", (i + 1) % self.m);
                };
                step.set_column(j, &DVector::from_vec(column));
                unit[j] = 0.0;
            }
            monodromy = step * monodromy;
        }
        Ok(monodromy)
    }

    /// Sum of the flight times between consecutive sections; NaN on a miss.
    pub fn period<S: VectorField>(&self, field: &S, params: &S::Params, x: &[f64]) -> f64 {
        let system = Frozen::new(field, params);
        (0..self.m)
            .map(|i| {
                self.return_map(&system, i, self.lift_point(i, self.reduced(x, i)))
                    .map_or(f64::NAN, |hit| hit.time)
            })
            .sum()
    }

    pub fn slice_states(&self, x: &[f64]) -> Vec<DVector<f64>> {
        (0..self.m)
            .map(|i| DVector::from_vec(self.lift_point(i, self.reduced(x, i))))
            .collect()
    }

    /// Moves every section to the current orbit point, realigning its normal
    /// with the flow. The dropped component is kept so that `x` stays valid.
    pub fn update_section<S: VectorField>(&mut self, field: &S, params: &S::Params, x: &[f64]) -> Result<bool> {
        let points = self.slice_states(x);
        let system = Frozen::new(field, params);
        let transit: Vec<Option<f64>> = (0..self.m)
            .map(|i| self.return_map(&system, i, points[i].as_slice().to_vec()).map(|hit| hit.time))
            .collect();

        for (i, point) in points.into_iter().enumerate() {
            match unit_normal(field, params, point.as_slice()) {
                Some(normal) if normal[self.pivots[i]].abs() >= MIN_PIVOT => {
                    self.centres[i] = point;
                    self.normals[i] = normal;
                }
                _ => warn!("Poincaré section {i} cannot be realigned; keeping it"),
            }
            if let Some(time) = transit[i] {
                self.transit[i] = time;
            }
        }
        debug!("Poincaré transit times: {:?}", self.transit);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Uniform rotation in the plane with radial attraction to `r = 1`.
    struct Attracting;

    impl VectorField for Attracting {
        type Params = f64;

        fn dimension(&self) -> usize {
            2
        }

        fn eval<T: Scalar>(&self, x: &[T], rate: &f64, out: &mut [T]) {
            let k: T = lift(*rate);
            let r2 = x[0] * x[0] + x[1] * x[1];
            let radial = k * (T::one() - r2);
            out[0] = radial * x[0] - x[1];
            out[1] = radial * x[1] + x[0];
        }
    }

    fn setup(m: usize) -> (PoincareShooting, DVector<f64>) {
        let guess = OrbitGuess::sample(
            |t| DVector::from_vec(vec![t.cos(), t.sin()]),
            2.0 * std::f64::consts::PI,
            m,
        );
        PoincareShooting::from_guess(&Attracting, &0.5, &guess, 60).unwrap()
    }

    #[test]
    fn lift_lands_on_the_section() {
        let (ps, _) = setup(3);
        let full = ps.lift_point(1, &[0.3]);
        assert!(ps.section_value::<f64>(1, &full).abs() < 1e-14);
        assert_eq!(ps.restrict(1, &full), vec![0.3]);
    }

    #[test]
    fn circle_is_a_fixed_point_with_contracting_multiplier() {
        let (ps, x0) = setup(2);
        let r = ps.residual(&Attracting, &0.5, x0.as_slice());
        assert!(r.iter().all(|v| v.abs() < 1e-6), "{r:?}");
        assert!((ps.period(&Attracting, &0.5, x0.as_slice()) - 2.0 * std::f64::consts::PI).abs() < 1e-6);

        let mono = ps.monodromy(&Attracting, &0.5, x0.as_slice()).unwrap();
        assert_eq!(mono.shape(), (1, 1));
        // Linearised radial rate is -2k, so the multiplier is exp(-2k T).
        let expected = (-2.0 * 0.5 * 2.0 * std::f64::consts::PI).exp();
        assert!((mono[(0, 0)] - expected).abs() < 1e-3, "{}", mono[(0, 0)]);
    }

    #[test]
    fn miss_yields_nan_residual() {
        let (ps, _) = setup(2);
        // The origin is an equilibrium; the flow never reaches the next section.
        let x = ps.restrict(0, &[0.0, 0.0]);
        let start: Vec<f64> = x.iter().chain(ps.restrict(1, &[0.0, 0.0]).iter()).copied().collect();
        let r = ps.residual(&Attracting, &0.5, &start);
        assert!(r.iter().all(|v| v.is_nan()));
    }

    #[test]
    fn section_update_keeps_the_orbit_representation() {
        let (mut ps, x0) = setup(2);
        let mut x = x0.clone();
        x[0] += 0.05;
        let before = ps.slice_states(x.as_slice());
        assert!(ps.update_section(&Attracting, &0.5, x.as_slice()).unwrap());
        let after = ps.slice_states(x.as_slice());
        for (a, b) in before.iter().zip(&after) {
            assert!((a - b).norm() < 1e-12);
        }
    }
}
