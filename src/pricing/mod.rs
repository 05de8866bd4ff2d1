pub mod estimator;
pub mod registry;

pub use estimator::{CostBreakdown, CostEstimator};
pub use registry::{ModelPricing, PricingRegistry};
