pub mod branch_switch;
pub mod detection;
pub mod floquet;
pub mod normal_form;
pub mod periodic;
pub mod problem;
pub mod results;
pub mod stepper;
pub mod types;
pub mod util;

#[cfg(test)]
mod scenarios;

pub use branch_switch::{continue_from_hopf, orbit_guess, HopfSwitchOptions};
pub use detection::{classify, kernel_dimension, Crossing, SpectralSummary};
pub use floquet::{FloquetEigenSolver, FloquetLinearSolver, FloquetWrapper};
pub use normal_form::{hopf_normal_form, AdjointFn, HopfNormalForm, HopfPredictor, JacobianFn};
pub use periodic::{
    continue_periodic_orbit, LinearizationMode, OrbitGuess, PeriodicOrbitKind, PeriodicOrbitProblem,
};
pub use problem::{ContinuationProblem, EquilibriumProblem, FieldProblem, ParamLens};
pub use results::{Branch, ContResult, SolutionSample, StepView};
pub use stepper::{continuation, ContinuationOptions, FinaliseStep, RecordFromSolution};
pub use types::{
    BranchKind, ContinuationPar, CriticalKind, CriticalPoint, CriticalStatus, EigenRecord,
    KernelDimension, StepRecord, StopReason, Tangent,
};
