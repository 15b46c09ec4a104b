//! Bifurcation detection from changes in the unstable spectrum, and
//! localisation of the crossing by bisection on the arclength.

use anyhow::Result;
use log::debug;
use nalgebra::DVector;

use super::types::{
    ContinuationPar, CriticalKind, CriticalStatus, KernelDimension, StepRecord, Tangent,
};

/// Unstable-eigenvalue counts at one point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpectralSummary {
    pub n_unstable: usize,
    pub n_imag: usize,
}

impl SpectralSummary {
    pub fn of(record: &StepRecord) -> Option<Self> {
        Some(Self {
            n_unstable: record.n_unstable?,
            n_imag: record.n_imag?,
        })
    }
}

/// A change of the unstable spectrum between two consecutive points.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Crossing {
    pub kind: CriticalKind,
    pub delta: KernelDimension,
    /// Index of the crossing eigenvalue in the spectrum sorted by decreasing
    /// real part.
    pub ind_ev: usize,
}

/// Kernel dimension accounting for a change from `before` to `after`.
///
/// Pairs are only counted when the unstable count moved by at least two, so
/// that `delta.unstable_change()` always equals the change in `n_unstable`.
pub fn kernel_dimension(before: SpectralSummary, after: SpectralSummary) -> KernelDimension {
    let d_unstable = before.n_unstable.abs_diff(after.n_unstable);
    let d_imag = before.n_imag.abs_diff(after.n_imag);
    let pairs = (d_imag / 2).min(d_unstable / 2);
    KernelDimension::new(d_unstable - 2 * pairs, pairs)
}

/// Classifies the spectral change between two consecutive accepted points;
/// `None` when the unstable count did not change.
pub fn classify(before: SpectralSummary, after: SpectralSummary) -> Option<Crossing> {
    if before.n_unstable == after.n_unstable {
        return None;
    }
    let d_unstable = before.n_unstable.abs_diff(after.n_unstable);
    let d_imag = before.n_imag.abs_diff(after.n_imag);
    let kind = match (d_unstable, d_imag) {
        (1, 0) => CriticalKind::BranchPoint,
        (2, 2) => CriticalKind::Hopf,
        _ => CriticalKind::Other,
    };
    Some(Crossing {
        kind,
        delta: kernel_dimension(before, after),
        ind_ev: before.n_unstable.max(after.n_unstable) - 1,
    })
}

/// A point corrected during bisection.
#[derive(Debug, Clone)]
pub struct Probe {
    pub x: DVector<f64>,
    pub p: f64,
    pub summary: SpectralSummary,
}

/// Corrects points at a given arclength along a fixed tangent and reports
/// their spectrum. Implemented by the stepper.
pub trait SpectralProbe {
    /// Point at arclength `s` from `(x0, p0)` along `tangent`, or `None` if
    /// the corrector did not converge.
    fn probe(
        &mut self,
        x0: &DVector<f64>,
        p0: f64,
        tangent: &Tangent,
        s: f64,
    ) -> Result<Option<Probe>>;
}

#[derive(Debug, Clone)]
pub struct BisectionOutcome {
    pub x: DVector<f64>,
    pub p: f64,
    pub status: CriticalStatus,
    /// Final parameter bracket width, -1 if the tolerance was not met.
    pub precision: f64,
    pub interval: (f64, f64),
    pub iterations: usize,
}

/// Endpoint of the bracketed step.
pub struct Bracket<'a> {
    pub x: &'a DVector<f64>,
    pub p: f64,
    pub summary: SpectralSummary,
}

/// Bisects the accepted step of arclength `ds` from `start` (along
/// `tangent`) to `end` until the unstable count has flipped `n_inversion`
/// times and the parameter bracket is below `tol_bisection_eigenvalue`.
pub fn bisect<S: SpectralProbe + ?Sized>(
    probe: &mut S,
    settings: &ContinuationPar,
    start: Bracket<'_>,
    end: Bracket<'_>,
    tangent: &Tangent,
    ds: f64,
) -> Result<BisectionOutcome> {
    let (mut s_lo, mut s_hi) = (0.0, ds);
    let (mut p_lo, mut p_hi) = (start.p, end.p);
    let mut last_n = end.summary.n_unstable;
    let mut inversions = 0usize;
    let mut refined = (end.x.clone(), end.p);
    let mut converged = false;
    let mut iterations = 0usize;

    while iterations < settings.max_bisection_steps {
        if (s_hi - s_lo).abs() < settings.dsmin_bisection {
            break;
        }
        let mid = 0.5 * (s_lo + s_hi);
        iterations += 1;
        let point = match probe.probe(start.x, start.p, tangent, mid)? {
            Some(point) => point,
            None => {
                debug!("bisection: corrector failed at s = {mid:e}");
                return Ok(BisectionOutcome {
                    x: refined.0,
                    p: refined.1,
                    status: CriticalStatus::FailedToConverge,
                    precision: -1.0,
                    interval: ordered(p_lo, p_hi),
                    iterations,
                });
            }
        };

        if point.summary.n_unstable != last_n {
            inversions += 1;
            last_n = point.summary.n_unstable;
        }
        if point.summary.n_unstable == start.summary.n_unstable {
            s_lo = mid;
            p_lo = point.p;
        } else {
            s_hi = mid;
            p_hi = point.p;
        }
        refined = (point.x, point.p);

        let width = (p_hi - p_lo).abs();
        debug!(
            "bisection {iterations}: p = {:.10}, n_unstable = {}, width = {width:e}, inversions = {inversions}",
            refined.1, last_n
        );
        if inversions >= settings.n_inversion && width < settings.tol_bisection_eigenvalue {
            converged = true;
            break;
        }
    }

    let width = (p_hi - p_lo).abs();
    Ok(BisectionOutcome {
        x: refined.0,
        p: refined.1,
        status: if converged {
            CriticalStatus::Converged
        } else {
            CriticalStatus::Guess
        },
        precision: if converged { width } else { -1.0 },
        interval: ordered(p_lo, p_hi),
        iterations,
    })
}

fn ordered(a: f64, b: f64) -> (f64, f64) {
    (a.min(b), a.max(b))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn summary(n_unstable: usize, n_imag: usize) -> SpectralSummary {
        SpectralSummary { n_unstable, n_imag }
    }

    #[test]
    fn classification_of_simple_crossings() {
        assert!(classify(summary(1, 0), summary(1, 0)).is_none());

        let bp = classify(summary(0, 0), summary(1, 0)).unwrap();
        assert_eq!(bp.kind, CriticalKind::BranchPoint);
        assert_eq!(bp.delta, KernelDimension::new(1, 0));
        assert_eq!(bp.ind_ev, 0);

        let hopf = classify(summary(3, 2), summary(1, 0)).unwrap();
        assert_eq!(hopf.kind, CriticalKind::Hopf);
        assert_eq!(hopf.delta, KernelDimension::new(0, 1));
        assert_eq!(hopf.ind_ev, 2);

        let multiple = classify(summary(0, 0), summary(3, 0)).unwrap();
        assert_eq!(multiple.kind, CriticalKind::Other);
        assert_eq!(multiple.delta, KernelDimension::new(3, 0));
    }

    #[test]
    fn kernel_dimension_matches_unstable_change() {
        for (before, after) in [
            (summary(0, 0), summary(1, 2)),
            (summary(4, 2), summary(1, 0)),
            (summary(2, 2), summary(0, 0)),
            (summary(0, 0), summary(5, 4)),
        ] {
            let delta = kernel_dimension(before, after);
            assert_eq!(
                delta.unstable_change(),
                before.n_unstable.abs_diff(after.n_unstable)
            );
        }
    }

    /// Scalar branch `x = 0` whose single eigenvalue is `p - root`.
    struct ScalarProbe {
        root: f64,
        fail_after: Option<usize>,
        calls: usize,
    }

    impl SpectralProbe for ScalarProbe {
        fn probe(
            &mut self,
            x0: &DVector<f64>,
            p0: f64,
            tangent: &Tangent,
            s: f64,
        ) -> Result<Option<Probe>> {
            self.calls += 1;
            if self.fail_after.is_some_and(|n| self.calls > n) {
                return Ok(None);
            }
            let p = p0 + s * tangent.p;
            Ok(Some(Probe {
                x: x0.clone(),
                p,
                summary: summary(usize::from(p > self.root), 0),
            }))
        }
    }

    fn run(probe: &mut ScalarProbe, settings: &ContinuationPar) -> BisectionOutcome {
        let x = DVector::zeros(1);
        let tangent = Tangent {
            x: DVector::zeros(1),
            p: 1.0,
        };
        bisect(
            probe,
            settings,
            Bracket {
                x: &x,
                p: 0.0,
                summary: summary(0, 0),
            },
            Bracket {
                x: &x,
                p: 0.1,
                summary: summary(1, 0),
            },
            &tangent,
            0.1,
        )
        .unwrap()
    }

    #[test]
    fn bisection_converges_on_crossing() {
        let settings = ContinuationPar::default();
        let mut probe = ScalarProbe {
            root: 0.0371,
            fail_after: None,
            calls: 0,
        };
        let out = run(&mut probe, &settings);
        assert_eq!(out.status, CriticalStatus::Converged);
        assert!(out.precision > 0.0 && out.precision < settings.tol_bisection_eigenvalue);
        assert!((out.p - 0.0371).abs() < 1e-6);
        assert!(out.interval.0 <= 0.0371 && 0.0371 <= out.interval.1);
    }

    #[test]
    fn bisection_budget_exhaustion_leaves_a_guess() {
        let settings = ContinuationPar::default().with_bisection(2, 1e-6, 3);
        let mut probe = ScalarProbe {
            root: 0.0371,
            fail_after: None,
            calls: 0,
        };
        let out = run(&mut probe, &settings);
        assert_eq!(out.status, CriticalStatus::Guess);
        assert_eq!(out.precision, -1.0);
        assert_eq!(out.iterations, 3);
    }

    #[test]
    fn corrector_failure_is_reported_in_status() {
        let settings = ContinuationPar::default();
        let mut probe = ScalarProbe {
            root: 0.0371,
            fail_after: Some(2),
            calls: 0,
        };
        let out = run(&mut probe, &settings);
        assert_eq!(out.status, CriticalStatus::FailedToConverge);
        assert_eq!(out.precision, -1.0);
    }
}
