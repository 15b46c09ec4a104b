//! Fixed-step integrators used by the shooting formulations.
//!
//! Everything is generic over [`Scalar`], so a flow evaluated with dual
//! numbers yields its exact directional derivative.

use crate::traits::{lift, DynamicalSystem, Scalar, Steppable};

/// Classic Runge-Kutta 4th Order Solver
pub struct RK4<T: Scalar> {
    k1: Vec<T>,
    k2: Vec<T>,
    k3: Vec<T>,
    k4: Vec<T>,
    tmp: Vec<T>,
}

impl<T: Scalar> RK4<T> {
    pub fn new(dim: usize) -> Self {
        let z = T::zero();
        Self {
            k1: vec![z; dim],
            k2: vec![z; dim],
            k3: vec![z; dim],
            k4: vec![z; dim],
            tmp: vec![z; dim],
        }
    }
}

impl<T: Scalar> Steppable<T> for RK4<T> {
    fn step(&mut self, system: &impl DynamicalSystem<T>, t: &mut T, state: &mut [T], dt: T) {
        let half: T = lift(0.5);
        let sixth: T = lift(1.0 / 6.0);
        let two: T = lift(2.0);

        let t0 = *t;

        // k1 = f(t, y)
        system.apply(t0, state, &mut self.k1);

        // k2 = f(t + dt/2, y + dt*k1/2)
        for i in 0..state.len() {
            self.tmp[i] = state[i] + dt * self.k1[i] * half;
        }
        system.apply(t0 + dt * half, &self.tmp, &mut self.k2);

        // k3 = f(t + dt/2, y + dt*k2/2)
        for i in 0..state.len() {
            self.tmp[i] = state[i] + dt * self.k2[i] * half;
        }
        system.apply(t0 + dt * half, &self.tmp, &mut self.k3);

        // k4 = f(t + dt, y + dt*k3)
        for i in 0..state.len() {
            self.tmp[i] = state[i] + dt * self.k3[i];
        }
        system.apply(t0 + dt, &self.tmp, &mut self.k4);

        for i in 0..state.len() {
            state[i] = state[i]
                + dt * sixth * (self.k1[i] + two * self.k2[i] + two * self.k3[i] + self.k4[i]);
        }

        *t = t0 + dt;
    }
}

/// Advances `x0` by `duration` using `steps` equal RK4 steps.
pub fn flow<T: Scalar>(
    system: &impl DynamicalSystem<T>,
    x0: &[T],
    duration: T,
    steps: usize,
) -> Vec<T> {
    let steps = steps.max(1);
    let mut state = x0.to_vec();
    let mut rk = RK4::new(state.len());
    let dt = duration / lift(steps as f64);
    let mut t = T::zero();
    for _ in 0..steps {
        rk.step(system, &mut t, &mut state, dt);
    }
    state
}
