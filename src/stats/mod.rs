//! Statistical core: resampling, sampling plans, sensitivity tests.

pub mod bootstrap;
pub mod sampling;
pub mod sensitivity;
pub mod special;

pub use bootstrap::{Bootstrap, BootstrapSettings, CiType};
pub use sampling::{PlannerKind, SamplingPlan};
pub use sensitivity::{ad_wrapper, cal_sensitivity};
