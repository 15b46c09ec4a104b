//! Hopf normal form and the orbit predictor built from it.
//!
//! Near a Hopf point `(x0, p0)` with critical eigenpair `(iω, ζ)` the
//! reduced dynamics are `z' = (iω + a (p - p0)) z + b z|z|²`. `a` comes from
//! the parameter dependence of the jacobian, `b` from the quadratic and cubic
//! terms of the field projected on the adjoint eigenvector `ζ*`. The
//! predictor `x0 + 2 r Re(ζ e^{iθ})` with `r² = -(p - p0) Re a / Re b` is the
//! first-order approximation of the emanating periodic orbits.

use anyhow::{anyhow, bail, Result};
use log::{debug, info};
use nalgebra::{DMatrix, DVector};
use num_complex::Complex;
use std::f64::consts::PI;

use super::periodic::{eval_field_f64, field_jacobian};
use super::problem::ParamLens;
use super::types::{CriticalKind, CriticalPoint};
use crate::error::ContinuationError;
use crate::linalg::{eigenvector_for, Jacobian};
use crate::traits::HigherDerivatives;

type CVector = DVector<Complex<f64>>;

/// User-supplied jacobian `J(x, params)`.
pub type JacobianFn<P> = Box<dyn Fn(&DVector<f64>, &P) -> Result<Jacobian>>;

/// User-supplied adjoint action `J(x, params)ᵀ v`.
pub type AdjointFn<P> = Box<dyn Fn(&DVector<f64>, &P, &DVector<f64>) -> DVector<f64>>;

/// Normal-form data at a Hopf point.
#[derive(Debug, Clone)]
pub struct HopfNormalForm {
    pub x0: DVector<f64>,
    pub p: f64,
    pub omega: f64,
    /// Unit-norm eigenvector of `J` for `iω`.
    pub zeta: CVector,
    /// Eigenvector of `Jᵀ` for `-iω`, scaled so that `<ζ*, ζ> = 1`.
    pub zeta_star: CVector,
    /// Parameter coefficient.
    pub a: Complex<f64>,
    /// Cubic coefficient.
    pub b: Complex<f64>,
}

/// Closed-form approximation of the periodic orbits born at a Hopf point.
#[derive(Debug, Clone)]
pub struct HopfPredictor {
    pub x0: DVector<f64>,
    pub zeta: CVector,
    pub amplitude: f64,
    pub omega: f64,
    /// Parameter value of the predicted orbit.
    pub p: f64,
    pub period: f64,
    /// `+1` when the orbits live on the `p > p0` side.
    pub ds_factor: f64,
}

impl HopfPredictor {
    /// Predicted state at phase `theta`.
    pub fn orbit(&self, theta: f64) -> DVector<f64> {
        let rotation = Complex::from_polar(1.0, theta);
        let offset = self.zeta.map(|z| 2.0 * self.amplitude * (z * rotation).re);
        &self.x0 + offset
    }

    /// Phase shift `ϕ = atan2(ζr·ζr, ζi·ζr)` applied when sampling the
    /// orbit, so that the first sample sits at a fixed position on it.
    pub fn phase(&self) -> f64 {
        let re = self.zeta.map(|z| z.re);
        let im = self.zeta.map(|z| z.im);
        re.dot(&re).atan2(im.dot(&re))
    }
}

impl HopfNormalForm {
    /// Predictor for a parameter step of `|ds|` to the side where orbits
    /// exist, with its amplitude scaled by `amplitude_factor`.
    pub fn predictor(&self, ds: f64, amplitude_factor: f64) -> Result<HopfPredictor> {
        let ds_factor = if self.a.re * self.b.re < 0.0 { 1.0 } else { -1.0 };
        let dp = ds_factor * ds.abs();
        let radicand = -dp * self.a.re / self.b.re;
        if !radicand.is_finite() || radicand < 0.0 {
            bail!(
                "Degenerate Hopf point: no real amplitude (a = {}, b = {})",
                self.a,
                self.b
            );
        }
        let omega = self.omega + (self.a.im - self.b.im * self.a.re / self.b.re) * dp;
        Ok(HopfPredictor {
            x0: self.x0.clone(),
            zeta: self.zeta.clone(),
            amplitude: amplitude_factor * radicand.sqrt(),
            omega,
            p: self.p + dp,
            period: 2.0 * PI / omega.abs(),
            ds_factor,
        })
    }

    /// The first Lyapunov coefficient sign: negative for a supercritical
    /// bifurcation.
    pub fn is_supercritical(&self) -> bool {
        self.b.re < 0.0
    }
}

fn parts(v: &CVector) -> (Vec<f64>, Vec<f64>) {
    (v.iter().map(|z| z.re).collect(), v.iter().map(|z| z.im).collect())
}

fn component(parts: &(Vec<f64>, Vec<f64>), imaginary: bool) -> &[f64] {
    if imaginary {
        &parts.1
    } else {
        &parts.0
    }
}

fn complexify(v: &DVector<f64>) -> CVector {
    v.map(|r| Complex::new(r, 0.0))
}

/// Multilinear extension of `d²f` to complex arguments.
fn d2_complex<S: HigherDerivatives>(field: &S, params: &S::Params, x: &[f64], u: &CVector, v: &CVector) -> CVector {
    let n = x.len();
    let ((ur, ui), (vr, vi)) = (parts(u), parts(v));
    let d2 = |a: &[f64], b: &[f64]| {
        let mut out = vec![0.0; n];
        field.d2f(x, params, a, b, &mut out);
        out
    };
    let (rr, ii, ri, ir) = (d2(&ur, &vr), d2(&ui, &vi), d2(&ur, &vi), d2(&ui, &vr));
    CVector::from_fn(n, |k, _| Complex::new(rr[k] - ii[k], ri[k] + ir[k]))
}

/// Multilinear extension of `d³f` to complex arguments.
fn d3_complex<S: HigherDerivatives>(
    field: &S,
    params: &S::Params,
    x: &[f64],
    u: &CVector,
    v: &CVector,
    w: &CVector,
) -> CVector {
    let n = x.len();
    let (u, v, w) = (parts(u), parts(v), parts(w));
    let mut out = CVector::zeros(n);
    let mut buf = vec![0.0; n];
    // Expand the product of (re + i im) over the three arguments.
    for mask in 0u8..8 {
        let a = component(&u, mask & 1 != 0);
        let b = component(&v, mask & 2 != 0);
        let c = component(&w, mask & 4 != 0);
        field.d3f(x, params, a, b, c, &mut buf);
        let factor = match mask.count_ones() {
            0 => Complex::new(1.0, 0.0),
            1 => Complex::new(0.0, 1.0),
            2 => Complex::new(-1.0, 0.0),
            _ => Complex::new(0.0, -1.0),
        };
        for k in 0..n {
            out[k] += factor * buf[k];
        }
    }
    out
}

fn solve_real(l: &DMatrix<f64>, rhs: &DVector<f64>) -> Result<DVector<f64>> {
    l.clone()
        .lu()
        .solve(rhs)
        .ok_or_else(|| anyhow!("Jacobian is singular at the Hopf point"))
}

fn apply_complex(jac: &Jacobian, v: &CVector) -> Result<CVector> {
    let (re, im) = parts(v);
    let re = jac.apply(&DVector::from_vec(re))?;
    let im = jac.apply(&DVector::from_vec(im))?;
    Ok(CVector::from_fn(v.len(), |k, _| Complex::new(re[k], im[k])))
}

/// Computes the Hopf normal form at `point`.
///
/// The jacobian comes from `jacobian` if given, otherwise from dual numbers
/// on `field`. The adjoint is the transpose of a dense jacobian; a
/// matrix-free jacobian needs `adjoint`. `delta` is the finite-difference
/// step for parameter derivatives.
pub fn hopf_normal_form<S: HigherDerivatives>(
    field: &S,
    params: &S::Params,
    lens: ParamLens<S::Params>,
    point: &CriticalPoint,
    jacobian: Option<&JacobianFn<S::Params>>,
    adjoint: Option<&AdjointFn<S::Params>>,
    delta: f64,
) -> Result<HopfNormalForm> {
    if point.kind != CriticalKind::Hopf {
        return Err(ContinuationError::KindMismatch {
            expected: CriticalKind::Hopf,
            found: point.kind,
        }
        .into());
    }
    let (x0, p0) = (&point.x, point.param);
    let n = x0.len();
    let par = lens.with(params, p0);
    let jacobian_at = |p: f64| -> Result<Jacobian> {
        let par = lens.with(params, p);
        match jacobian {
            Some(jac) => jac(x0, &par),
            None => Ok(Jacobian::Dense(field_jacobian(field, &par, x0.as_slice()))),
        }
    };

    let jac = jacobian_at(p0)?;
    let l = jac.to_dense()?;
    let transpose = match (adjoint, &jac) {
        (Some(adj), _) => {
            let mut mat = DMatrix::zeros(n, n);
            let mut unit = DVector::zeros(n);
            for j in 0..n {
                unit[j] = 1.0;
                mat.set_column(j, &adj(x0, &par, &unit));
                unit[j] = 0.0;
            }
            mat
        }
        (None, Jacobian::Dense(m)) => m.transpose(),
        (None, _) => return Err(ContinuationError::AdjointRequired.into()),
    };

    let lambda = l
        .clone()
        .complex_eigenvalues()
        .iter()
        .copied()
        .filter(|ev| ev.im > 1e-10)
        .min_by(|a, b| a.re.abs().partial_cmp(&b.re.abs()).unwrap_or(std::cmp::Ordering::Equal))
        .ok_or_else(|| anyhow!("No complex eigenvalue pair at the Hopf point p = {p0}"))?;
    let omega = lambda.im;
    debug!("Hopf point p = {p0}: critical eigenvalue {lambda}");

    let l_complex = l.map(|v| Complex::new(v, 0.0));
    let zeta = eigenvector_for(&l_complex, lambda)?;
    let zeta_bar = zeta.map(|z| z.conj());
    let mut zeta_star = eigenvector_for(&transpose.map(|v| Complex::new(v, 0.0)), lambda.conj())?;
    let overlap = zeta_star.dotc(&zeta);
    if overlap.norm() < 1e-12 {
        bail!("Adjoint eigenvector is orthogonal to the critical eigenvector");
    }
    zeta_star /= overlap.conj();

    let x = x0.as_slice();
    let r01 = (eval_field_f64(field, &lens.with(params, p0 + delta), x)
        - eval_field_f64(field, &lens.with(params, p0 - delta), x))
        / (2.0 * delta);
    let psi001 = -solve_real(&l, &r01)?;
    let r11_zeta = (apply_complex(&jacobian_at(p0 + delta)?, &zeta)? - apply_complex(&jacobian_at(p0 - delta)?, &zeta)?)
        / Complex::new(2.0 * delta, 0.0);
    let a = zeta_star.dotc(&(r11_zeta + d2_complex(field, &par, x, &zeta, &complexify(&psi001))));

    let psi110 = -solve_real(&l, &d2_complex(field, &par, x, &zeta, &zeta_bar).map(|z| z.re))?;
    let mut shifted = -l_complex;
    for i in 0..n {
        shifted[(i, i)] += Complex::new(0.0, 2.0 * omega);
    }
    let psi200 = shifted
        .lu()
        .solve(&(d2_complex(field, &par, x, &zeta, &zeta) * Complex::new(0.5, 0.0)))
        .ok_or_else(|| anyhow!("2iω - J is singular at the Hopf point"))?;
    let cubic = d2_complex(field, &par, x, &zeta, &complexify(&psi110))
        + d2_complex(field, &par, x, &zeta_bar, &psi200)
        + d3_complex(field, &par, x, &zeta, &zeta, &zeta_bar) * Complex::new(0.5, 0.0);
    let b = zeta_star.dotc(&cubic);

    info!("Hopf normal form at p = {p0}: ω = {omega}, a = {a}, b = {b}");
    Ok(HopfNormalForm {
        x0: x0.clone(),
        p: p0,
        omega,
        zeta,
        zeta_star,
        a,
        b,
    })
}
