//! The `branch_core` crate traces solution branches of `F(x, p) = 0`,
//! detects bifurcations from the spectrum of the linearization, and
//! switches from Hopf points onto the periodic orbits they emit.
//!
//! Key components:
//! - **Traits**: `Scalar` (numeric type abstraction), `VectorField` (models
//!   generic over `f64` and dual numbers), `DynamicalSystem` and
//!   `Steppable` (integrators).
//! - **Continuation**: the pseudo-arclength stepper, the bifurcation
//!   detector, branch results, periodic-orbit functionals with their Floquet
//!   wrapper, and Hopf branch switching.
//! - **Collaborators**: a damped Newton corrector with deflation, dense
//!   linear and eigen solvers, RK4 flows and forward-mode autodiff.
pub mod autodiff;
pub mod continuation;
pub mod error;
pub mod linalg;
pub mod newton;
pub mod solvers;
pub mod traits;

pub use continuation::{
    continuation, continue_from_hopf, continue_periodic_orbit, Branch, ContResult,
    ContinuationOptions, ContinuationPar, ContinuationProblem, ParamLens,
};
pub use error::ContinuationError;
