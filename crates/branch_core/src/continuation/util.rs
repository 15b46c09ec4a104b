//! Arclength geometry shared by the stepper and the bisection.
//!
//! All products on `(x, p)` space are weighted: the state part is scaled by
//! `theta / n` and the parameter part by `1 - theta`.

use anyhow::{bail, Result};
use nalgebra::DVector;

use super::types::Tangent;

/// Weights `(xi_x, xi_p)` of the arclength dot product for a state of size `n`.
pub fn theta_weights(theta: f64, n: usize) -> (f64, f64) {
    (theta / n.max(1) as f64, 1.0 - theta)
}

/// `theta · <ax, bx> / n + (1 - theta) · ap · bp`
pub fn dot_theta(ax: &DVector<f64>, ap: f64, bx: &DVector<f64>, bp: f64, theta: f64) -> f64 {
    let (xi_x, xi_p) = theta_weights(theta, ax.len());
    xi_x * ax.dot(bx) + xi_p * ap * bp
}

impl Tangent {
    pub fn dot_theta(&self, other: &Tangent, theta: f64) -> f64 {
        dot_theta(&self.x, self.p, &other.x, other.p, theta)
    }

    /// Rescales to unit length in the weighted norm.
    pub fn normalize(mut self, theta: f64) -> Result<Self> {
        let norm = self.dot_theta(&self, theta).sqrt();
        if norm == 0.0 || !norm.is_finite() {
            bail!("Cannot normalize a degenerate tangent (norm {norm})");
        }
        self.x /= norm;
        self.p /= norm;
        Ok(self)
    }

    pub fn negate(self) -> Self {
        Self {
            x: -self.x,
            p: -self.p,
        }
    }
}

/// Angle between two unit tangents, in radians.
pub fn tangent_angle(a: &Tangent, b: &Tangent, theta: f64) -> f64 {
    a.dot_theta(b, theta).clamp(-1.0, 1.0).acos()
}

/// Solves the bordered system
///
/// ```text
/// [ J        dFdp     ] [dx]   [ r ]
/// [ xi_x τx  xi_p τp  ] [dp] = [ n ]
/// ```
///
/// given `u1 = J \ r` and `u2 = J \ dFdp`.
pub fn bordered_solution(
    u1: &DVector<f64>,
    u2: &DVector<f64>,
    constraint_rhs: f64,
    tangent: &Tangent,
    theta: f64,
) -> Result<(DVector<f64>, f64)> {
    let (xi_x, xi_p) = theta_weights(theta, u1.len());
    let denom = xi_p * tangent.p - xi_x * tangent.x.dot(u2);
    if denom.abs() < f64::EPSILON || !denom.is_finite() {
        bail!("Bordered system is singular (denominator {denom:e})");
    }
    let dp = (constraint_rhs - xi_x * tangent.x.dot(u1)) / denom;
    let dx = u1 - u2 * dp;
    Ok((dx, dp))
}

/// Tangent at a new point from `u2 = J \ dFdp`, oriented along `previous`.
pub fn bordered_tangent(u2: &DVector<f64>, previous: &Tangent, theta: f64) -> Result<Tangent> {
    let zero = DVector::zeros(u2.len());
    let (dx, dp) = bordered_solution(&zero, u2, 1.0, previous, theta)?;
    Tangent { x: dx, p: dp }.normalize(theta)
}

/// Splits an augmented vector `[x; p]`.
pub fn split_augmented(z: &DVector<f64>) -> (DVector<f64>, f64) {
    let n = z.len() - 1;
    (z.rows(0, n).into_owned(), z[n])
}

pub fn join_augmented(x: &DVector<f64>, p: f64) -> DVector<f64> {
    let n = x.len();
    let mut z = DVector::zeros(n + 1);
    z.rows_mut(0, n).copy_from(x);
    z[n] = p;
    z
}
